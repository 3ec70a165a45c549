//! Normalized crossjoin arguments - the flattened form a set expression
//! must reduce to before it can become a SQL read.

use crate::constraint::TargetSlot;
use crate::model::catalog::Catalog;
use crate::model::hierarchy::{HierarchyId, LevelId};
use crate::model::member::MemberId;

/// One flattened argument of a (possibly implicit) crossjoin. Each arg
/// covers exactly one hierarchy and one tuple position.
#[derive(Debug, Clone, PartialEq)]
pub enum CrossJoinArg {
    /// An explicit member list, all stored members of one level.
    Members {
        hierarchy: HierarchyId,
        level: LevelId,
        members: Vec<MemberId>,
    },
    /// Every member of a level.
    Level { level: LevelId },
    /// Children of a stored member.
    Children { parent: MemberId },
    /// Descendants of a stored member at a deeper level.
    Descendants { ancestor: MemberId, level: LevelId },
}

impl CrossJoinArg {
    pub fn hierarchy(&self, catalog: &Catalog) -> HierarchyId {
        match self {
            CrossJoinArg::Members { hierarchy, .. } => *hierarchy,
            CrossJoinArg::Level { level } => catalog.level(*level).hierarchy,
            CrossJoinArg::Children { parent } => catalog.member(*parent).hierarchy,
            CrossJoinArg::Descendants { ancestor, .. } => catalog.member(*ancestor).hierarchy,
        }
    }

    /// The level whose members the arg produces. `Children` of a
    /// bottom-level member has none.
    pub fn level(&self, catalog: &Catalog) -> Option<LevelId> {
        match self {
            CrossJoinArg::Members { level, .. } => Some(*level),
            CrossJoinArg::Level { level } => Some(*level),
            CrossJoinArg::Descendants { level, .. } => Some(*level),
            CrossJoinArg::Children { parent } => {
                let member = catalog.member(*parent);
                catalog
                    .hierarchy(member.hierarchy)
                    .level_at_depth(member.depth + 1)
            }
        }
    }

    /// The cache-target slot identifying this position. Explicit member
    /// lists identify by their level; the list itself lives in the
    /// constraint restrictions.
    pub fn target_slot(&self, catalog: &Catalog) -> TargetSlot {
        match self {
            CrossJoinArg::Members { level, .. } => {
                TargetSlot::Level(catalog.level(*level).key.clone())
            }
            CrossJoinArg::Level { level } => TargetSlot::Level(catalog.level(*level).key.clone()),
            CrossJoinArg::Children { parent } => {
                TargetSlot::Children(catalog.member(*parent).key.clone())
            }
            CrossJoinArg::Descendants { ancestor, level } => TargetSlot::Descendants {
                ancestor: catalog.member(*ancestor).key.clone(),
                level: catalog.level(*level).key.clone(),
            },
        }
    }

    /// Upper bound on produced members, when cheap to know.
    pub fn known_cardinality(&self, catalog: &Catalog) -> Option<u64> {
        match self {
            CrossJoinArg::Members { members, .. } => Some(members.len() as u64),
            CrossJoinArg::Children { parent } => {
                Some(catalog.arena().children_of(*parent).len() as u64)
            }
            CrossJoinArg::Level { level } => {
                let known = catalog.arena().members_at_level(*level).len();
                (known > 0).then_some(known as u64)
            }
            CrossJoinArg::Descendants { .. } => None,
        }
    }

}
