//! The member and tuple result cache.
//!
//! Entries are keyed by `(target, fingerprint)`: what a read returns
//! and a content hash of how it was restricted. Those two values are
//! the whole key by construction. A non-empty read and a plain read
//! of the same target differ in fingerprint, as do two bounded reads
//! with different counts, so one can never satisfy the other.
//!
//! Concurrent statements share one cache. Values are `Arc`-wrapped
//! immutable lists in a sharded map, so a racing insert is
//! last-write-wins and a torn read is impossible. Invalidation is a
//! single global [`flush`](ResultCache::flush); there is no TTL and
//! no partial eviction.

use std::sync::Arc;

use dashmap::DashMap;

use crate::constraint::{CacheTarget, Fingerprint};
use crate::model::member::MemberKey;

/// An ordered native result: one row of member keys per tuple, in
/// canonical hierarchy order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleList {
    arity: usize,
    tuples: Vec<Vec<MemberKey>>,
}

impl TupleList {
    pub fn new(arity: usize, tuples: Vec<Vec<MemberKey>>) -> Self {
        debug_assert!(tuples.iter().all(|tuple| tuple.len() == arity));
        Self { arity, tuples }
    }

    /// A single-hierarchy list, one member per row.
    pub fn of_members(members: Vec<MemberKey>) -> Self {
        Self {
            arity: 1,
            tuples: members.into_iter().map(|member| vec![member]).collect(),
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn tuples(&self) -> &[Vec<MemberKey>] {
        &self.tuples
    }

    pub fn iter(&self) -> impl Iterator<Item = &[MemberKey]> {
        self.tuples.iter().map(Vec::as_slice)
    }
}

/// Shared result cache for native reads.
#[derive(Debug, Default)]
pub struct ResultCache {
    entries: DashMap<(CacheTarget, Fingerprint), Arc<TupleList>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, target: &CacheTarget, fingerprint: &Fingerprint) -> Option<Arc<TupleList>> {
        self.entries
            .get(&(target.clone(), fingerprint.clone()))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Store one result, returning the shared handle.
    pub fn put(
        &self,
        target: CacheTarget,
        fingerprint: Fingerprint,
        list: TupleList,
    ) -> Arc<TupleList> {
        let list = Arc::new(list);
        self.entries
            .insert((target, fingerprint), Arc::clone(&list));
        list
    }

    /// Seed children entries from a complete level read. The caller
    /// groups the returned members under their parents; each group
    /// lands under `Children(parent)` with the same fingerprint, so a
    /// later children read of that parent hits without touching SQL.
    pub fn populate_children<I>(&self, fingerprint: &Fingerprint, groups: I)
    where
        I: IntoIterator<Item = (MemberKey, TupleList)>,
    {
        for (parent, children) in groups {
            self.put(CacheTarget::children(parent), fingerprint.clone(), children);
        }
    }

    /// Drop every entry.
    pub fn flush(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
