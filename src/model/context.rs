//! Per-statement evaluation context: cube, current members, slicer,
//! role and the cooperative cancel token.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::NativeConfig;
use crate::error::{NativeError, NativeResult};
use crate::model::catalog::Catalog;
use crate::model::cube::{CubeRef, MeasureKey};
use crate::model::hierarchy::{HierarchyId, HierarchyKey};
use crate::model::member::MemberId;
use crate::model::role::Role;

/// Cooperative cancellation flag shared between a statement and its
/// evaluation. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Error out of the current evaluation step if cancelled.
    pub fn check(&self) -> NativeResult<()> {
        if self.is_cancelled() {
            Err(NativeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Everything one evaluation sees: the catalog, the active cube, the
/// current member per hierarchy (slicer members land there too), the
/// measure scope and the access role. Cloning is cheap enough for
/// per-axis copies.
#[derive(Clone)]
pub struct EvalContext<'a> {
    pub catalog: &'a Catalog,
    pub config: &'a NativeConfig,
    pub cube: CubeRef,
    current: BTreeMap<HierarchyKey, MemberId>,
    /// Measures the statement references, in first-use order.
    pub measure_scope: Vec<MeasureKey>,
    pub current_measure: Option<MeasureKey>,
    pub non_empty: bool,
    pub role: Option<&'a Role>,
    pub cancel: CancelToken,
}

impl<'a> EvalContext<'a> {
    pub fn new(catalog: &'a Catalog, config: &'a NativeConfig, cube: CubeRef) -> Self {
        Self {
            catalog,
            config,
            cube,
            current: BTreeMap::new(),
            measure_scope: Vec::new(),
            current_measure: None,
            non_empty: false,
            role: None,
            cancel: CancelToken::new(),
        }
    }

    /// Set the current member of the member's own hierarchy.
    pub fn with_member(mut self, id: MemberId) -> Self {
        self.set_current(id);
        self
    }

    /// Add slicer members. Each becomes the current member of its
    /// hierarchy, the way a WHERE clause sets context; a multi-member
    /// WHERE arrives as one compound member per hierarchy.
    pub fn with_slicer(mut self, members: impl IntoIterator<Item = MemberId>) -> Self {
        for id in members {
            self.set_current(id);
        }
        self
    }

    pub fn with_non_empty(mut self, non_empty: bool) -> Self {
        self.non_empty = non_empty;
        self
    }

    pub fn with_role(mut self, role: &'a Role) -> Self {
        self.role = Some(role);
        self
    }

    /// Make a measure current and record it in the statement scope.
    pub fn with_measure(mut self, measure: MeasureKey) -> Self {
        if !self.measure_scope.contains(&measure) {
            self.measure_scope.push(measure.clone());
        }
        self.current_measure = Some(measure);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn set_current(&mut self, id: MemberId) {
        let key = self.catalog.hierarchy_of(id).key.clone();
        self.current.insert(key, id);
    }

    /// The explicitly set current member of a hierarchy, if any.
    pub fn current_member(&self, hierarchy: &HierarchyKey) -> Option<MemberId> {
        self.current.get(hierarchy).copied()
    }

    /// The current member, falling back to the hierarchy's All member.
    pub fn member_or_default(&self, hierarchy: HierarchyId) -> Option<MemberId> {
        let h = self.catalog.hierarchy(hierarchy);
        self.current_member(&h.key).or(h.all_member)
    }

    /// Hierarchies with an explicitly set current member, with the member.
    pub fn current_members(&self) -> impl Iterator<Item = (&HierarchyKey, MemberId)> {
        self.current.iter().map(|(k, v)| (k, *v))
    }

    /// The measure emptiness checks run against: the current measure, or
    /// the first one in scope, or the cube's first measure.
    pub fn probe_measure(&self) -> Option<MeasureKey> {
        if let Some(m) = &self.current_measure {
            return Some(m.clone());
        }
        if let Some(m) = self.measure_scope.first() {
            return Some(m.clone());
        }
        self.catalog
            .base_cubes_for(self.cube, &[])
            .first()
            .and_then(|c| c.measures.first())
            .map(|m| m.key.clone())
    }
}
