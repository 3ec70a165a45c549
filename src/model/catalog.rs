//! The catalog: hierarchies, levels, members and cubes behind one lookup
//! surface, plus the builder fixtures and loaders use to assemble it.

use std::collections::HashMap;

use crate::model::cube::{Cube, CubeRef, Measure, MeasureKey, VirtualCube};
use crate::model::hierarchy::{
    Hierarchy, HierarchyId, HierarchyKey, Level, LevelId, LevelKey, SnowflakeJoin,
};
use crate::model::member::{
    CalcBody, KeyValue, Member, MemberArena, MemberId, MemberKey, MemberKind,
};

/// Immutable schema snapshot. Built once through [`CatalogBuilder`]; every
/// id handed out is valid for exactly this snapshot.
#[derive(Debug, Default)]
pub struct Catalog {
    hierarchies: Vec<Hierarchy>,
    levels: Vec<Level>,
    cubes: Vec<Cube>,
    virtual_cubes: Vec<VirtualCube>,
    arena: MemberArena,
    hierarchy_index: HashMap<HierarchyKey, HierarchyId>,
    level_index: HashMap<LevelKey, LevelId>,
    cube_index: HashMap<String, CubeRef>,
}

impl Catalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    pub fn arena(&self) -> &MemberArena {
        &self.arena
    }

    pub fn hierarchy(&self, id: HierarchyId) -> &Hierarchy {
        &self.hierarchies[id.index()]
    }

    pub fn level(&self, id: LevelId) -> &Level {
        &self.levels[id.index()]
    }

    pub fn hierarchies(&self) -> &[Hierarchy] {
        &self.hierarchies
    }

    pub fn hierarchy_by_key(&self, key: &HierarchyKey) -> Option<&Hierarchy> {
        self.hierarchy_index.get(key).map(|id| self.hierarchy(*id))
    }

    pub fn level_by_key(&self, key: &LevelKey) -> Option<&Level> {
        self.level_index.get(key).map(|id| self.level(*id))
    }

    pub fn member(&self, id: MemberId) -> &Member {
        self.arena.get(id)
    }

    pub fn member_by_key(&self, key: &MemberKey) -> Option<&Member> {
        self.arena.lookup(key).map(|id| self.arena.get(id))
    }

    /// The stored level a member belongs to.
    pub fn level_of(&self, id: MemberId) -> Option<&Level> {
        self.member(id).level.map(|l| self.level(l))
    }

    /// The hierarchy a member belongs to.
    pub fn hierarchy_of(&self, id: MemberId) -> &Hierarchy {
        self.hierarchy(self.member(id).hierarchy)
    }

    pub fn cube_ref(&self, name: &str) -> Option<CubeRef> {
        self.cube_index.get(name).copied()
    }

    pub fn cube_name(&self, cube: CubeRef) -> &str {
        match cube {
            CubeRef::Base(i) => &self.cubes[i].name,
            CubeRef::Virtual(i) => &self.virtual_cubes[i].name,
        }
    }

    /// Base cubes a reference fans out to. A base cube is itself; a
    /// virtual cube yields the bases that carry the requested measures.
    pub fn base_cubes_for(&self, cube: CubeRef, measures: &[MeasureKey]) -> Vec<&Cube> {
        match cube {
            CubeRef::Base(i) => vec![&self.cubes[i]],
            CubeRef::Virtual(i) => self.virtual_cubes[i]
                .bases_for_measures(measures)
                .into_iter()
                .filter_map(|name| match self.cube_index.get(name) {
                    Some(CubeRef::Base(b)) => Some(&self.cubes[*b]),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Find a measure by key in any base cube behind the reference.
    pub fn measure(&self, cube: CubeRef, key: &MeasureKey) -> Option<&Measure> {
        self.base_cubes_for(cube, std::slice::from_ref(key))
            .into_iter()
            .find_map(|c| c.measure(key))
    }

    /// Whether every hierarchy id is attached to every base cube behind
    /// the reference. Virtual-cube pushdown needs conformed hierarchies.
    pub fn cube_covers(&self, cube: CubeRef, hierarchies: &[HierarchyId]) -> bool {
        self.base_cubes_for(cube, &[])
            .iter()
            .all(|c| hierarchies.iter().all(|h| c.has_hierarchy(*h)))
    }
}

// ===== Builder =====

/// Declarative level description handed to [`CatalogBuilder::add_hierarchy`].
#[derive(Debug, Clone)]
pub struct LevelSpec {
    pub name: String,
    pub table: String,
    pub key_column: String,
    pub ordinal_column: Option<String>,
    pub caption_column: Option<String>,
    pub nullable: bool,
}

impl LevelSpec {
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        key_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            key_column: key_column.into(),
            ordinal_column: None,
            caption_column: None,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn ordered_by(mut self, column: impl Into<String>) -> Self {
        self.ordinal_column = Some(column.into());
        self
    }

    pub fn captioned_by(mut self, column: impl Into<String>) -> Self {
        self.caption_column = Some(column.into());
        self
    }
}

/// Declarative hierarchy description.
#[derive(Debug, Clone)]
pub struct HierarchySpec {
    pub name: String,
    pub dimension: String,
    pub has_all: bool,
    pub primary_table: String,
    pub primary_key: String,
    pub levels: Vec<LevelSpec>,
    pub joins: Vec<SnowflakeJoin>,
}

impl HierarchySpec {
    pub fn new(
        name: impl Into<String>,
        primary_table: impl Into<String>,
        primary_key: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            dimension: name.clone(),
            name,
            has_all: true,
            primary_table: primary_table.into(),
            primary_key: primary_key.into(),
            levels: Vec::new(),
            joins: Vec::new(),
        }
    }

    pub fn level(mut self, spec: LevelSpec) -> Self {
        self.levels.push(spec);
        self
    }

    pub fn join(mut self, join: SnowflakeJoin) -> Self {
        self.joins.push(join);
        self
    }
}

/// Assembles a [`Catalog`]. Hierarchies come first, then their members,
/// then cubes; `build` freezes the snapshot.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    catalog: Catalog,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hierarchy(&mut self, spec: HierarchySpec) -> HierarchyId {
        let id = HierarchyId(self.catalog.hierarchies.len() as u16);
        let key = HierarchyKey(format!("[{}]", spec.name));
        let mut levels = Vec::with_capacity(spec.levels.len());
        for (i, level) in spec.levels.into_iter().enumerate() {
            let level_id = LevelId(self.catalog.levels.len() as u32);
            let level_key = LevelKey(format!("[{}].[{}]", spec.name, level.name));
            self.catalog.levels.push(Level {
                id: level_id,
                hierarchy: id,
                name: level.name,
                key: level_key.clone(),
                depth: i + 1,
                table: level.table,
                key_column: level.key_column,
                ordinal_column: level.ordinal_column,
                caption_column: level.caption_column,
                nullable: level.nullable,
            });
            self.catalog.level_index.insert(level_key, level_id);
            levels.push(level_id);
        }

        self.catalog.hierarchies.push(Hierarchy {
            id,
            name: spec.name,
            key: key.clone(),
            dimension: spec.dimension,
            has_all: spec.has_all,
            all_member: None,
            levels,
            primary_table: spec.primary_table,
            primary_key: spec.primary_key,
            joins: spec.joins,
        });
        self.catalog.hierarchy_index.insert(key, id);

        if self.catalog.hierarchies[id.index()].has_all {
            let all = self.push_member(id, None, "All", KeyValue::Null, MemberKind::All);
            self.catalog.hierarchies[id.index()].all_member = Some(all);
        }
        id
    }

    /// Add a stored member. `parent: None` attaches under the All member
    /// when the hierarchy has one, otherwise at the root.
    pub fn add_member(
        &mut self,
        hierarchy: HierarchyId,
        parent: Option<MemberId>,
        name: &str,
        key: KeyValue,
    ) -> MemberId {
        let parent = parent.or(self.catalog.hierarchies[hierarchy.index()].all_member);
        self.push_member(hierarchy, parent, name, key, MemberKind::Regular)
    }

    pub fn add_calculated(
        &mut self,
        hierarchy: HierarchyId,
        parent: Option<MemberId>,
        name: &str,
        body: CalcBody,
    ) -> MemberId {
        let parent = parent.or(self.catalog.hierarchies[hierarchy.index()].all_member);
        self.push_member(
            hierarchy,
            parent,
            name,
            KeyValue::Null,
            MemberKind::Calculated(body),
        )
    }

    /// Add a placeholder standing in for a multi-member slicer set.
    pub fn add_compound_slicer(
        &mut self,
        hierarchy: HierarchyId,
        name: &str,
        members: Vec<MemberId>,
    ) -> MemberId {
        let parent = self.catalog.hierarchies[hierarchy.index()].all_member;
        self.push_member(
            hierarchy,
            parent,
            name,
            KeyValue::Null,
            MemberKind::CompoundSlicer(members),
        )
    }

    fn push_member(
        &mut self,
        hierarchy: HierarchyId,
        parent: Option<MemberId>,
        name: &str,
        key_value: KeyValue,
        kind: MemberKind,
    ) -> MemberId {
        let h = &self.catalog.hierarchies[hierarchy.index()];
        // Parent-less members of an all-less hierarchy sit at depth 1.
        let depth = match parent {
            Some(p) => self.catalog.arena.get(p).depth + 1,
            None if matches!(kind, MemberKind::All) => 0,
            None => 1,
        };

        let level = if matches!(kind, MemberKind::Regular) {
            h.level_at_depth(depth)
        } else {
            None
        };
        let member_key = match parent {
            Some(p) if !self.catalog.arena.get(p).is_all() => {
                MemberKey(format!("{}.[{}]", self.catalog.arena.get(p).key, name))
            }
            _ => MemberKey(format!("{}.[{}]", h.key, name)),
        };

        let id = self
            .catalog
            .arena
            .push(Member {
                id: MemberId(0),
                key: member_key.clone(),
                name: name.to_string(),
                caption: name.to_string(),
                hierarchy,
                level,
                depth,
                parent,
                ordinal: 0,
                key_value,
                kind,
            })
            .unwrap_or_else(|| panic!("duplicate member key {}", member_key));
        id
    }

    pub fn add_cube(&mut self, cube: Cube) {
        let name = cube.name.clone();
        let index = self.catalog.cubes.len();
        self.catalog.cubes.push(cube);
        self.catalog.cube_index.insert(name, CubeRef::Base(index));
    }

    pub fn add_virtual_cube(&mut self, cube: VirtualCube) {
        let name = cube.name.clone();
        let index = self.catalog.virtual_cubes.len();
        self.catalog.virtual_cubes.push(cube);
        self.catalog.cube_index.insert(name, CubeRef::Virtual(index));
    }

    pub fn build(self) -> Catalog {
        self.catalog
    }
}
