//! Versioned, immutable views of the fact set.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::types::{Attribute, Datom, EntityId, Pattern, Triple};

/// Read side of the store, as consumed by the engine.
///
/// Implemented by `MemorySnapshot`; any store exposing monotonically
/// increasing versions and point queries can stand in.
pub trait Snapshot: fmt::Debug + Send + Sync {
    /// Monotonically increasing per committed write.
    fn version(&self) -> u64;

    /// All triples currently matching `pattern`.
    fn query_index(&self, pattern: &Pattern) -> Vec<Triple>;

    fn contains(&self, triple: &Triple) -> bool {
        !self.query_index(&Pattern::exact(triple)).is_empty()
    }
}

/// Shared handle to a snapshot.
pub type Db = Arc<dyn Snapshot>;

/// One committed write: the snapshots on either side and the datoms that
/// actually changed the fact set.
#[derive(Debug, Clone)]
pub struct Change {
    pub db_before: Db,
    pub db_after: Db,
    pub novelty: Vec<Datom>,
}

// ---------------------------------------------------------------------------
// MemorySnapshot
// ---------------------------------------------------------------------------

/// In-memory snapshot with entity and attribute indexes. Copy-on-write per
/// commit.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    version: u64,
    facts: BTreeSet<Triple>,
    by_entity: BTreeMap<EntityId, BTreeSet<Triple>>,
    by_attribute: BTreeMap<Attribute, BTreeSet<Triple>>,
}

impl MemorySnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Apply `datoms` in order, producing the next version and the datoms that
    /// had an effect. Adding a present triple or retracting an absent one is
    /// dropped from the novelty.
    pub fn apply(&self, datoms: &[Datom]) -> (MemorySnapshot, Vec<Datom>) {
        let mut next = self.clone();
        next.version += 1;
        let mut novelty = Vec::with_capacity(datoms.len());

        for datom in datoms {
            let triple = datom.triple();
            let changed = if datom.added {
                next.insert(triple)
            } else {
                next.remove(&triple)
            };
            if changed {
                novelty.push(datom.clone());
            }
        }

        (next, novelty)
    }

    fn insert(&mut self, triple: Triple) -> bool {
        if !self.facts.insert(triple.clone()) {
            return false;
        }
        self.by_entity
            .entry(triple.entity)
            .or_default()
            .insert(triple.clone());
        self.by_attribute
            .entry(triple.attribute.clone())
            .or_default()
            .insert(triple);
        true
    }

    fn remove(&mut self, triple: &Triple) -> bool {
        if !self.facts.remove(triple) {
            return false;
        }
        if let Some(set) = self.by_entity.get_mut(&triple.entity) {
            set.remove(triple);
            if set.is_empty() {
                self.by_entity.remove(&triple.entity);
            }
        }
        if let Some(set) = self.by_attribute.get_mut(&triple.attribute) {
            set.remove(triple);
            if set.is_empty() {
                self.by_attribute.remove(&triple.attribute);
            }
        }
        true
    }
}

impl Snapshot for MemorySnapshot {
    fn version(&self) -> u64 {
        self.version
    }

    fn query_index(&self, pattern: &Pattern) -> Vec<Triple> {
        let candidates: Box<dyn Iterator<Item = &Triple>> = match (&pattern.entity, &pattern.attribute)
        {
            (Some(e), _) => match self.by_entity.get(e) {
                Some(set) => Box::new(set.iter()),
                None => return Vec::new(),
            },
            (None, Some(a)) => match self.by_attribute.get(a) {
                Some(set) => Box::new(set.iter()),
                None => return Vec::new(),
            },
            (None, None) => Box::new(self.facts.iter()),
        };
        candidates.filter(|t| pattern.matches(t)).cloned().collect()
    }

    fn contains(&self, triple: &Triple) -> bool {
        self.facts.contains(triple)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_drops_ineffective_datoms() {
        let db = MemorySnapshot::empty();
        let (db, novelty) = db.apply(&[
            Datom::add(EntityId(1), "name", "a"),
            Datom::add(EntityId(1), "name", "a"),
            Datom::retract(EntityId(2), "name", "x"),
        ]);
        assert_eq!(novelty.len(), 1);
        assert_eq!(db.version(), 1);
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn query_index_uses_any_wildcard_subset() {
        let (db, _) = MemorySnapshot::empty().apply(&[
            Datom::add(EntityId(1), "name", "a"),
            Datom::add(EntityId(1), "age", 3i64),
            Datom::add(EntityId(2), "name", "b"),
        ]);
        assert_eq!(db.query_index(&Pattern::any()).len(), 3);
        assert_eq!(db.query_index(&Pattern::entity(EntityId(1))).len(), 2);
        assert_eq!(db.query_index(&Pattern::attribute("name")).len(), 2);
        assert_eq!(db.query_index(&Pattern::attribute_value("name", "b")).len(), 1);
        assert!(db.contains(&Triple::new(EntityId(1), "age", 3i64)));
        assert!(db.query_index(&Pattern::entity(EntityId(9))).is_empty());
    }

    #[test]
    fn retraction_cleans_indexes() {
        let (db, _) = MemorySnapshot::empty().apply(&[Datom::add(EntityId(1), "name", "a")]);
        let (db, novelty) = db.apply(&[Datom::retract(EntityId(1), "name", "a")]);
        assert_eq!(novelty.len(), 1);
        assert!(db.is_empty());
        assert!(db.query_index(&Pattern::attribute("name")).is_empty());
    }
}
