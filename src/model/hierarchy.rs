//! Hierarchies, levels and the snowflake join path back to the fact table.

use std::fmt;

use serde::Serialize;

use crate::model::member::MemberId;

/// Positional handle into the catalog's hierarchy list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HierarchyId(pub u16);

impl HierarchyId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Positional handle into the catalog's level list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LevelId(pub u32);

impl LevelId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Stable qualified hierarchy name, e.g. `[Customers]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HierarchyKey(pub String);

impl HierarchyKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HierarchyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable qualified level name, e.g. `[Customers].[State]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LevelKey(pub String);

impl LevelKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LevelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One stored level of a hierarchy.
#[derive(Debug, Clone)]
pub struct Level {
    pub id: LevelId,
    pub hierarchy: HierarchyId,
    pub name: String,
    pub key: LevelKey,
    /// 1 for the first stored level; the All member sits at depth 0.
    pub depth: usize,
    /// Dimension table holding this level's key column.
    pub table: String,
    pub key_column: String,
    /// Column that orders siblings when it differs from the key column.
    pub ordinal_column: Option<String>,
    pub caption_column: Option<String>,
    /// Whether the key column may hold NULL (ragged snowflake levels).
    pub nullable: bool,
}

/// One hop of a snowflake join, read outward from the fact table.
#[derive(Debug, Clone, PartialEq)]
pub struct SnowflakeJoin {
    pub left_table: String,
    pub left_column: String,
    pub right_table: String,
    pub right_column: String,
}

/// A hierarchy: an ordered list of stored levels plus join metadata.
#[derive(Debug, Clone)]
pub struct Hierarchy {
    pub id: HierarchyId,
    pub name: String,
    pub key: HierarchyKey,
    pub dimension: String,
    pub has_all: bool,
    pub all_member: Option<MemberId>,
    /// Stored levels, shallowest first. The All level is implicit.
    pub levels: Vec<LevelId>,
    /// Table the fact table joins to, and the key column on it.
    pub primary_table: String,
    pub primary_key: String,
    /// Extra joins for snowflaked levels, walked outward from
    /// `primary_table`. Empty for a plain star dimension.
    pub joins: Vec<SnowflakeJoin>,
}

impl Hierarchy {
    /// The stored level at a member depth (depth 1 is `levels[0]`).
    pub fn level_at_depth(&self, depth: usize) -> Option<LevelId> {
        if depth == 0 {
            return None;
        }
        self.levels.get(depth - 1).copied()
    }

    pub fn bottom_level(&self) -> Option<LevelId> {
        self.levels.last().copied()
    }

    /// Tables this hierarchy spans, primary table first.
    pub fn tables(&self) -> Vec<&str> {
        let mut tables = vec![self.primary_table.as_str()];
        for join in &self.joins {
            if !tables.contains(&join.right_table.as_str()) {
                tables.push(join.right_table.as_str());
            }
        }
        tables
    }
}
