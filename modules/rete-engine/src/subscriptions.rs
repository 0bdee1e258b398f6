//! Routes store changes to the graph.
//!
//! Entries are registered under concrete `Pattern` keys (wildcards are `None`
//! components). A lookup for a triple probes the eight generalizations of the
//! triple, so an entry registered under any mask matching it is found. Keys are
//! compared structurally, never by a reduced hash, so there are no collisions.

use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use rete_store::{Datom, Pattern, Triple};

use crate::node::{NodeId, ScopeId};
use crate::rete::Cx;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct EntryId(u64);

/// Receives each matching datom.
pub(crate) type DatomPort = Rc<dyn Fn(&mut Cx<'_>, &Datom)>;

/// Re-runs a computation after a matching change; returns the patterns it read
/// this time, which replace its registration.
pub(crate) type RevalidationPort = Rc<dyn Fn(&mut Cx<'_>) -> Vec<Pattern>>;

#[derive(Clone)]
pub(crate) enum Port {
    Datom(DatomPort),
    Revalidation(RevalidationPort),
}

pub(crate) struct Entry {
    pub(crate) node: NodeId,
    pub(crate) scope: ScopeId,
    pub(crate) depth: u32,
    pub(crate) port: Port,
    patterns: Vec<Pattern>,
}

/// One lookup result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Hit {
    pub(crate) entry: EntryId,
    pub(crate) node: NodeId,
    pub(crate) revalidation: bool,
}

#[derive(Default)]
pub(crate) struct SubscriptionsIndex {
    entries: HashMap<EntryId, Entry>,
    by_pattern: HashMap<Pattern, BTreeSet<EntryId>>,
    next_id: u64,
}

impl SubscriptionsIndex {
    pub(crate) fn insert_datom(
        &mut self,
        node: NodeId,
        scope: ScopeId,
        depth: u32,
        pattern: Pattern,
        port: DatomPort,
    ) -> EntryId {
        self.insert(node, scope, depth, vec![pattern], Port::Datom(port))
    }

    pub(crate) fn insert_revalidation(
        &mut self,
        node: NodeId,
        scope: ScopeId,
        depth: u32,
        patterns: Vec<Pattern>,
        port: RevalidationPort,
    ) -> EntryId {
        self.insert(node, scope, depth, patterns, Port::Revalidation(port))
    }

    fn insert(
        &mut self,
        node: NodeId,
        scope: ScopeId,
        depth: u32,
        patterns: Vec<Pattern>,
        port: Port,
    ) -> EntryId {
        self.next_id += 1;
        let id = EntryId(self.next_id);
        let patterns = dedup(patterns);
        self.link(id, &patterns);
        self.entries.insert(
            id,
            Entry {
                node,
                scope,
                depth,
                port,
                patterns,
            },
        );
        id
    }

    fn link(&mut self, id: EntryId, patterns: &[Pattern]) {
        for pattern in patterns {
            self.by_pattern.entry(pattern.clone()).or_default().insert(id);
        }
    }

    fn unlink(&mut self, id: EntryId, patterns: &[Pattern]) {
        for pattern in patterns {
            if let Some(ids) = self.by_pattern.get_mut(pattern) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_pattern.remove(pattern);
                }
            }
        }
    }

    pub(crate) fn remove(&mut self, id: EntryId) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                self.unlink(id, &entry.patterns);
                true
            }
            None => false,
        }
    }

    /// Atomically replace a revalidation entry's pattern set.
    pub(crate) fn swap_patterns(&mut self, id: EntryId, patterns: Vec<Pattern>) {
        let Some(old) = self
            .entries
            .get_mut(&id)
            .map(|e| std::mem::replace(&mut e.patterns, dedup(patterns)))
        else {
            return;
        };
        self.unlink(id, &old);
        let fresh = self.entries[&id].patterns.clone();
        self.link(id, &fresh);
    }

    pub(crate) fn get(&self, id: EntryId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    /// Every entry whose pattern generalizes `triple`, each reported once.
    pub(crate) fn lookup(&self, triple: &Triple) -> Vec<Hit> {
        let mut seen = BTreeSet::new();
        for pattern in Pattern::generalizations(triple) {
            if let Some(ids) = self.by_pattern.get(&pattern) {
                seen.extend(ids.iter().copied());
            }
        }
        seen.into_iter()
            .filter_map(|id| {
                self.entries.get(&id).map(|e| Hit {
                    entry: id,
                    node: e.node,
                    revalidation: matches!(e.port, Port::Revalidation(_)),
                })
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

fn dedup(mut patterns: Vec<Pattern>) -> Vec<Pattern> {
    let mut seen = std::collections::HashSet::new();
    patterns.retain(|p| seen.insert(p.clone()));
    patterns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeTable;
    use rete_store::EntityId;

    fn fixture() -> (NodeId, ScopeId) {
        let mut table = NodeTable::default();
        let node = table.create_root();
        let root = table.node(node).unwrap().root;
        (node, root)
    }

    fn noop_datom() -> DatomPort {
        Rc::new(|_: &mut Cx<'_>, _: &Datom| {})
    }

    fn noop_revalidation() -> RevalidationPort {
        Rc::new(|_: &mut Cx<'_>| Vec::new())
    }

    #[test]
    fn lookup_finds_every_generalizing_registration() {
        let (node, scope) = fixture();
        let mut index = SubscriptionsIndex::default();
        let all = index.insert_datom(node, scope, 0, Pattern::any(), noop_datom());
        let by_attr = index.insert_datom(node, scope, 0, Pattern::attribute("name"), noop_datom());
        let exact = index.insert_datom(
            node,
            scope,
            1,
            Pattern::exact(&Triple::new(EntityId(1), "name", "a")),
            noop_datom(),
        );
        let other = index.insert_datom(node, scope, 0, Pattern::attribute("age"), noop_datom());

        let hits: Vec<_> = index
            .lookup(&Triple::new(EntityId(1), "name", "a"))
            .into_iter()
            .map(|h| h.entry)
            .collect();
        assert_eq!(hits, vec![all, by_attr, exact]);
        assert!(!hits.contains(&other));
    }

    #[test]
    fn revalidation_entry_is_reported_once_across_patterns() {
        let (node, scope) = fixture();
        let mut index = SubscriptionsIndex::default();
        let id = index.insert_revalidation(
            node,
            scope,
            2,
            vec![
                Pattern::entity(EntityId(1)),
                Pattern::attribute("name"),
                Pattern::attribute("name"),
            ],
            noop_revalidation(),
        );
        let hits = index.lookup(&Triple::new(EntityId(1), "name", "a"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry, id);
        assert!(hits[0].revalidation);
    }

    #[test]
    fn swap_replaces_registration() {
        let (node, scope) = fixture();
        let mut index = SubscriptionsIndex::default();
        let id = index.insert_revalidation(
            node,
            scope,
            0,
            vec![Pattern::attribute("name")],
            noop_revalidation(),
        );
        index.swap_patterns(id, vec![Pattern::attribute("age")]);

        assert!(index.lookup(&Triple::new(EntityId(1), "name", "a")).is_empty());
        assert_eq!(index.lookup(&Triple::new(EntityId(1), "age", 3i64)).len(), 1);
    }

    #[test]
    fn removal_unlinks_all_patterns() {
        let (node, scope) = fixture();
        let mut index = SubscriptionsIndex::default();
        let id = index.insert_revalidation(
            node,
            scope,
            0,
            vec![Pattern::attribute("name"), Pattern::any()],
            noop_revalidation(),
        );
        assert!(index.remove(id));
        assert!(!index.remove(id));
        assert_eq!(index.len(), 0);
        assert!(index.by_pattern.is_empty());
    }
}
