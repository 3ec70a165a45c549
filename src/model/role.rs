//! Access roles: per-hierarchy member grants and rollup policy.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::model::hierarchy::HierarchyKey;
use crate::model::member::{MemberArena, MemberId, MemberKey};

/// How aggregates treat members the role cannot see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RollupPolicy {
    /// Totals include hidden members. Constraints must not filter rows
    /// belonging to hidden siblings.
    Full,
    /// Totals include only visible members. Constraints carry the grant
    /// filter so SQL aggregates match what the role may see.
    Partial,
}

/// What a role may see of one hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub enum HierarchyAccess {
    All,
    None,
    /// Only the subtrees rooted at `allowed` are visible.
    Custom {
        allowed: Vec<MemberId>,
        rollup: RollupPolicy,
    },
}

#[derive(Debug, Clone)]
pub struct Role {
    pub name: String,
    grants: BTreeMap<HierarchyKey, HierarchyAccess>,
}

/// Serializable image of one grant, for constraint fingerprints. Members
/// appear by stable key so the digest survives catalog rebuilds.
#[derive(Debug, Serialize)]
pub struct GrantDigest {
    pub hierarchy: HierarchyKey,
    pub access: String,
    pub allowed: Vec<MemberKey>,
    pub rollup: Option<RollupPolicy>,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            grants: BTreeMap::new(),
        }
    }

    pub fn grant(&mut self, hierarchy: HierarchyKey, access: HierarchyAccess) -> &mut Self {
        self.grants.insert(hierarchy, access);
        self
    }

    /// Ungranted hierarchies default to full access.
    pub fn access(&self, hierarchy: &HierarchyKey) -> &HierarchyAccess {
        self.grants.get(hierarchy).unwrap_or(&HierarchyAccess::All)
    }

    pub fn is_restricted(&self, hierarchy: &HierarchyKey) -> bool {
        !matches!(self.access(hierarchy), HierarchyAccess::All)
    }

    /// Whether the member sits inside a granted subtree. Ancestors of an
    /// allowed member stay visible so the member remains reachable.
    pub fn can_see(&self, arena: &MemberArena, hierarchy: &HierarchyKey, id: MemberId) -> bool {
        match self.access(hierarchy) {
            HierarchyAccess::All => true,
            HierarchyAccess::None => false,
            HierarchyAccess::Custom { allowed, .. } => allowed.iter().any(|root| {
                *root == id
                    || arena.is_descendant_of(id, *root)
                    || arena.is_descendant_of(*root, id)
            }),
        }
    }

    pub fn rollup(&self, hierarchy: &HierarchyKey) -> Option<RollupPolicy> {
        match self.access(hierarchy) {
            HierarchyAccess::Custom { rollup, .. } => Some(*rollup),
            _ => None,
        }
    }

    /// Stable digest of every grant, in hierarchy order.
    pub fn digest(&self, arena: &MemberArena) -> Vec<GrantDigest> {
        self.grants
            .iter()
            .map(|(hierarchy, access)| match access {
                HierarchyAccess::All => GrantDigest {
                    hierarchy: hierarchy.clone(),
                    access: "all".to_string(),
                    allowed: Vec::new(),
                    rollup: None,
                },
                HierarchyAccess::None => GrantDigest {
                    hierarchy: hierarchy.clone(),
                    access: "none".to_string(),
                    allowed: Vec::new(),
                    rollup: None,
                },
                HierarchyAccess::Custom { allowed, rollup } => GrantDigest {
                    hierarchy: hierarchy.clone(),
                    access: "custom".to_string(),
                    allowed: allowed.iter().map(|id| arena.get(*id).key.clone()).collect(),
                    rollup: Some(*rollup),
                },
            })
            .collect()
    }
}
