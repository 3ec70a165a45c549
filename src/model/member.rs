//! The member arena - immutable member records addressed by stable keys.
//!
//! Cube members live in one append-only arena. Every record is immutable
//! once added, addressed positionally by `MemberId` and by a stable
//! interned `MemberKey` (the hierarchy-qualified key path). Caches key on
//! `MemberKey`, never on ids or references, so a rebuilt catalog can never
//! alias stale entries.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::model::hierarchy::{HierarchyId, LevelId};

/// Positional handle into the member arena. Valid only for the catalog
/// that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(pub u32);

impl MemberId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Stable interned identity of a member: the hierarchy-qualified key path,
/// e.g. `[Customer].[USA].[WA].[Jeanne Derry]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MemberKey(pub String);

impl MemberKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A member's key column value.
///
/// Ordering puts NULL after every concrete value, which is the ordering
/// every result list and SQL ORDER BY in this crate uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum KeyValue {
    Int(i64),
    Str(String),
    Null,
}

impl KeyValue {
    pub fn is_null(&self) -> bool {
        matches!(self, KeyValue::Null)
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        use KeyValue::*;
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (Str(a), Str(b)) => a.cmp(b),
            (Int(_), Str(_)) => Ordering::Less,
            (Str(_), Int(_)) => Ordering::Greater,
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Greater,
            (_, Null) => Ordering::Less,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(n) => write!(f, "{}", n),
            KeyValue::Str(s) => f.write_str(s),
            KeyValue::Null => f.write_str("#null"),
        }
    }
}

/// Body of a calculated member. A closed shape: anything the resolver
/// cannot express in these four forms arrives as `Opaque`.
#[derive(Debug, Clone, PartialEq)]
pub enum CalcBody {
    /// An alias for a single stored member.
    MemberRef(MemberId),
    /// Aggregate over a member list, e.g. `Aggregate({Q1, Q2})`.
    Aggregate(Vec<CalcBody>),
    /// A parenthesized sub-expression.
    Parens(Box<CalcBody>),
    /// Anything else. Participates as a literal value only.
    Opaque(OpaqueValue),
}

/// An unexpandable calculated-member body: a display form plus the value
/// it evaluates to in the defining context, if known.
#[derive(Debug, Clone, PartialEq)]
pub struct OpaqueValue {
    pub display: String,
    pub value: Option<f64>,
}

/// Result of expanding a calculated-member body.
#[derive(Debug, Clone, PartialEq)]
pub enum CalcExpansion {
    /// The body reduces to this list of stored members.
    Members(Vec<MemberId>),
    /// The body does not reduce; it carries only a value.
    Opaque(OpaqueValue),
}

/// What kind of member a record is.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberKind {
    /// A stored member backed by a dimension-table row.
    Regular,
    /// The hierarchy's All member.
    All,
    /// A calculated member with a closed-shape body.
    Calculated(CalcBody),
    /// A placeholder standing in for several underlying slicer members.
    CompoundSlicer(Vec<MemberId>),
}

/// One immutable member record.
#[derive(Debug, Clone)]
pub struct Member {
    pub id: MemberId,
    pub key: MemberKey,
    pub name: String,
    pub caption: String,
    pub hierarchy: HierarchyId,
    /// Stored level; None for All members and calculated/compound members
    /// that are not bound to a level.
    pub level: Option<LevelId>,
    /// 0 for the All member, 1 for the first stored level, and so on.
    pub depth: usize,
    pub parent: Option<MemberId>,
    /// Position among siblings, in catalog declaration order.
    pub ordinal: u32,
    pub key_value: KeyValue,
    pub kind: MemberKind,
}

impl Member {
    pub fn is_all(&self) -> bool {
        matches!(self.kind, MemberKind::All)
    }

    pub fn is_calculated(&self) -> bool {
        matches!(self.kind, MemberKind::Calculated(_))
    }

    pub fn is_compound_slicer(&self) -> bool {
        matches!(self.kind, MemberKind::CompoundSlicer(_))
    }

    /// Stored members are the only ones a SQL constraint can name.
    pub fn is_stored(&self) -> bool {
        matches!(self.kind, MemberKind::Regular)
    }
}

/// Append-only arena of immutable member records.
#[derive(Debug, Default)]
pub struct MemberArena {
    members: Vec<Member>,
    by_key: HashMap<MemberKey, MemberId>,
    children: Vec<Vec<MemberId>>,
    by_level: HashMap<LevelId, Vec<MemberId>>,
}

impl MemberArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Add a record. Returns the new id, or None if the key is taken.
    pub(crate) fn push(&mut self, mut member: Member) -> Option<MemberId> {
        if self.by_key.contains_key(&member.key) {
            return None;
        }
        let id = MemberId(self.members.len() as u32);
        member.id = id;
        if let Some(parent) = member.parent {
            member.ordinal = self.children[parent.index()].len() as u32;
            self.children[parent.index()].push(id);
        }
        if let Some(level) = member.level {
            self.by_level.entry(level).or_default().push(id);
        }
        self.by_key.insert(member.key.clone(), id);
        self.members.push(member);
        self.children.push(Vec::new());
        Some(id)
    }

    pub fn get(&self, id: MemberId) -> &Member {
        &self.members[id.index()]
    }

    pub fn lookup(&self, key: &MemberKey) -> Option<MemberId> {
        self.by_key.get(key).copied()
    }

    pub fn children_of(&self, id: MemberId) -> &[MemberId] {
        &self.children[id.index()]
    }

    /// All stored members registered at a level, in declaration order.
    pub fn members_at_level(&self, level: LevelId) -> &[MemberId] {
        self.by_level.get(&level).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.iter()
    }

    /// The member's ancestor at the given depth (0 = All), or None when the
    /// member is shallower than that depth.
    pub fn ancestor_at_depth(&self, id: MemberId, depth: usize) -> Option<MemberId> {
        let mut current = id;
        loop {
            let m = self.get(current);
            match m.depth.cmp(&depth) {
                std::cmp::Ordering::Equal => return Some(current),
                std::cmp::Ordering::Less => return None,
                std::cmp::Ordering::Greater => current = m.parent?,
            }
        }
    }

    pub fn is_descendant_of(&self, id: MemberId, ancestor: MemberId) -> bool {
        let mut current = self.get(id).parent;
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.get(c).parent;
        }
        false
    }

    /// Root-to-self key values, excluding the All member.
    pub fn key_path(&self, id: MemberId) -> Vec<KeyValue> {
        let mut path = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            let m = self.get(c);
            if !m.is_all() {
                path.push(m.key_value.clone());
            }
            current = m.parent;
        }
        path.reverse();
        path
    }

    /// Root-to-self sibling ordinals - the canonical sort key prefix.
    pub fn ordinal_path(&self, id: MemberId) -> Vec<u32> {
        let mut path = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            let m = self.get(c);
            path.push(m.ordinal);
            current = m.parent;
        }
        path.reverse();
        path
    }

    /// Expand a calculated member into stored members, following the
    /// closed recursive shape. Regular members expand to themselves;
    /// compound slicer placeholders expand to their underlying set.
    pub fn expand(&self, id: MemberId) -> CalcExpansion {
        match &self.get(id).kind {
            MemberKind::Regular | MemberKind::All => CalcExpansion::Members(vec![id]),
            MemberKind::CompoundSlicer(members) => CalcExpansion::Members(members.clone()),
            MemberKind::Calculated(body) => self.expand_body(body),
        }
    }

    fn expand_body(&self, body: &CalcBody) -> CalcExpansion {
        match body {
            CalcBody::MemberRef(id) => self.expand(*id),
            CalcBody::Parens(inner) => self.expand_body(inner),
            CalcBody::Aggregate(parts) => {
                let mut members = Vec::new();
                for part in parts {
                    match self.expand_body(part) {
                        CalcExpansion::Members(ms) => members.extend(ms),
                        // One opaque leaf poisons the whole aggregate.
                        CalcExpansion::Opaque(v) => return CalcExpansion::Opaque(v),
                    }
                }
                CalcExpansion::Members(members)
            }
            CalcBody::Opaque(v) => CalcExpansion::Opaque(v.clone()),
        }
    }
}
