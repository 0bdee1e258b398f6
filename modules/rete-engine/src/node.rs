//! Node / retention graph.
//!
//! A node is one shared unit of computation: a top-level observed query or an
//! interned sub-query. Each node owns a tree of subscription scopes; scopes
//! own index entries and close hooks. Nodes are reference counted by their
//! retainers and disposed when the count reaches zero.

use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use crate::rete::Cx;
use crate::subscriptions::EntryId;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// (creator, sequence) packed into one integer.
///
/// `Ord` is the propagation order: lower creator first; within one creator,
/// higher sequence first, so nodes built while building another drain before
/// it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    pub fn new(creator: u32, sequence: u32) -> Self {
        Self(((creator as u64) << 32) | sequence as u64)
    }

    pub fn creator(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn sequence(self) -> u32 {
        self.0 as u32
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.creator()
            .cmp(&other.creator())
            .then_with(|| other.sequence().cmp(&self.sequence()))
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.creator(), self.sequence())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(pub(crate) u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer#{}", self.0)
    }
}

/// Who keeps a node alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Retainer {
    Node(NodeId),
    Observer(ObserverId),
}

/// Identity of an interned node. Equal keys must always be safe to treat as
/// producing identical results.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct InternKey {
    pub(crate) type_id: TypeId,
    pub(crate) name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ScopeId(u64);

pub(crate) type CloseHook = Box<dyn FnOnce(&mut Cx<'_>)>;

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

pub(crate) struct Node {
    pub(crate) root: ScopeId,
    retainers: HashMap<Retainer, usize>,
    retainees: Vec<NodeId>,
    pub(crate) intern_key: Option<InternKey>,
    pub(crate) state: Option<Rc<dyn Any>>,
}

pub(crate) struct Scope {
    pub(crate) node: NodeId,
    pub(crate) depth: u32,
    parent: Option<ScopeId>,
    children: BTreeSet<ScopeId>,
    entries: Vec<EntryId>,
    on_close: Vec<CloseHook>,
}

#[derive(Default)]
struct Creator {
    sequence: u32,
    live: usize,
}

#[derive(Default)]
pub(crate) struct NodeTable {
    nodes: HashMap<NodeId, Node>,
    scopes: HashMap<ScopeId, Scope>,
    pub(crate) interned: HashMap<InternKey, NodeId>,
    /// Per creator: last sequence handed out, and how many of its nodes live.
    /// Dropped with the creator's last node.
    creators: HashMap<u32, Creator>,
    next_creator: u32,
    next_scope: u64,
    /// Nodes created since the last sweep; released if still unretained.
    fresh: Vec<NodeId>,
}

impl NodeTable {
    /// A node for a new top-level query: fresh creator, sequence 0.
    pub(crate) fn create_root(&mut self) -> NodeId {
        self.next_creator += 1;
        let id = NodeId::new(self.next_creator, 0);
        self.insert(id, None);
        id
    }

    /// A nested node attributed to `creator`'s next sequence number.
    pub(crate) fn create_nested(&mut self, creator: u32, intern_key: Option<InternKey>) -> NodeId {
        let entry = self.creators.entry(creator).or_default();
        entry.sequence += 1;
        let id = NodeId::new(creator, entry.sequence);
        self.insert(id, intern_key);
        self.fresh.push(id);
        id
    }

    fn insert(&mut self, id: NodeId, intern_key: Option<InternKey>) {
        self.creators.entry(id.creator()).or_default().live += 1;
        let root = self.allocate_scope(Scope {
            node: id,
            depth: 0,
            parent: None,
            children: BTreeSet::new(),
            entries: Vec::new(),
            on_close: Vec::new(),
        });
        self.nodes.insert(
            id,
            Node {
                root,
                retainers: HashMap::new(),
                retainees: Vec::new(),
                intern_key,
                state: None,
            },
        );
    }

    fn allocate_scope(&mut self, scope: Scope) -> ScopeId {
        self.next_scope += 1;
        let id = ScopeId(self.next_scope);
        self.scopes.insert(id, scope);
        id
    }

    /// Unlink `id` from the table and its intern key. Its scopes stay until
    /// closed.
    fn remove(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&id)?;
        if let Some(key) = &node.intern_key {
            self.interned.remove(key);
        }
        if let Some(creator) = self.creators.get_mut(&id.creator()) {
            creator.live -= 1;
            if creator.live == 0 {
                self.creators.remove(&id.creator());
            }
        }
        Some(node)
    }

    pub(crate) fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub(crate) fn root(&self, id: NodeId) -> Option<ScopeId> {
        self.nodes.get(&id).map(|n| n.root)
    }

    pub(crate) fn is_retained(&self, id: NodeId) -> bool {
        self.nodes.get(&id).is_some_and(|n| !n.retainers.is_empty())
    }

    pub(crate) fn scope(&self, id: ScopeId) -> Option<&Scope> {
        self.scopes.get(&id)
    }

    pub(crate) fn has_scope(&self, id: ScopeId) -> bool {
        self.scopes.contains_key(&id)
    }

    /// Open a child scope one level deeper than `parent`.
    pub(crate) fn open_scope(&mut self, parent: ScopeId) -> Option<ScopeId> {
        let (node, depth) = {
            let p = self.scopes.get(&parent)?;
            (p.node, p.depth + 1)
        };
        let id = self.allocate_scope(Scope {
            node,
            depth,
            parent: Some(parent),
            children: BTreeSet::new(),
            entries: Vec::new(),
            on_close: Vec::new(),
        });
        if let Some(p) = self.scopes.get_mut(&parent) {
            p.children.insert(id);
        }
        Some(id)
    }

    pub(crate) fn add_entry(&mut self, scope: ScopeId, entry: EntryId) {
        if let Some(s) = self.scopes.get_mut(&scope) {
            s.entries.push(entry);
        }
    }

    /// Returns the hook back if the scope is already gone.
    pub(crate) fn add_hook(&mut self, scope: ScopeId, hook: CloseHook) -> Option<CloseHook> {
        match self.scopes.get_mut(&scope) {
            Some(s) => {
                s.on_close.push(hook);
                None
            }
            None => Some(hook),
        }
    }

    pub(crate) fn retain(&mut self, id: NodeId, retainer: Retainer) {
        if let Some(node) = self.nodes.get_mut(&id) {
            *node.retainers.entry(retainer).or_insert(0) += 1;
        }
        if let Retainer::Node(by) = retainer {
            if let Some(node) = self.nodes.get_mut(&by) {
                node.retainees.push(id);
            }
        }
    }

    /// Drop one retention edge. Returns true when `id` has no retainers left.
    fn unretain(&mut self, id: NodeId, retainer: Retainer) -> bool {
        if let Retainer::Node(by) = retainer {
            if let Some(node) = self.nodes.get_mut(&by) {
                if let Some(pos) = node.retainees.iter().position(|r| *r == id) {
                    node.retainees.swap_remove(pos);
                }
            }
        }
        let Some(node) = self.nodes.get_mut(&id) else {
            return false;
        };
        if let Some(count) = node.retainers.get_mut(&retainer) {
            *count -= 1;
            if *count == 0 {
                node.retainers.remove(&retainer);
            }
        }
        node.retainers.is_empty()
    }

    /// Retainers of `id`, for routing failures upward.
    pub(crate) fn retainers(&self, id: NodeId) -> Vec<Retainer> {
        self.nodes
            .get(&id)
            .map(|n| n.retainers.keys().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn take_fresh(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.fresh)
    }

    pub(crate) fn stats(&self) -> (usize, usize, usize, usize) {
        let edges = self.nodes.values().map(|n| n.retainees.len()).sum();
        (self.nodes.len(), self.scopes.len(), self.interned.len(), edges)
    }

    pub(crate) fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }
}

// ---------------------------------------------------------------------------
// Closing and disposal. These run hooks, so they need a full context.
// ---------------------------------------------------------------------------

/// Close `id` and everything below it: children first (newest first), then
/// index entries, then this scope's hooks (newest first).
pub(crate) fn close_scope(cx: &mut Cx<'_>, id: ScopeId) {
    let Some(scope) = cx.rete.nodes.scopes.remove(&id) else {
        return;
    };
    if let Some(parent) = scope.parent {
        if let Some(p) = cx.rete.nodes.scopes.get_mut(&parent) {
            p.children.remove(&id);
        }
    }
    for child in scope.children.into_iter().rev() {
        close_scope(cx, child);
    }
    for entry in scope.entries {
        cx.rete.index.remove(entry);
    }
    for hook in scope.on_close.into_iter().rev() {
        hook(cx);
    }
}

pub(crate) fn release(cx: &mut Cx<'_>, id: NodeId, retainer: Retainer) {
    if cx.rete.nodes.unretain(id, retainer) {
        dispose(cx, id);
    }
}

/// Remove `id` and close its subscription tree; the close hooks release
/// whatever it retained.
pub(crate) fn dispose(cx: &mut Cx<'_>, id: NodeId) {
    let Some(node) = cx.rete.nodes.remove(id) else {
        return;
    };
    close_scope(cx, node.root);
    debug!(node = %id, "Node disposed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;
    use std::cmp::Reverse;

    #[test]
    fn id_packs_creator_and_sequence() {
        let id = NodeId::new(3, 17);
        assert_eq!(id.creator(), 3);
        assert_eq!(id.sequence(), 17);
        assert_eq!(id.to_string(), "3.17");
    }

    #[test]
    fn order_is_creator_ascending_then_sequence_descending() {
        let mut heap = BinaryHeap::new();
        for id in [
            NodeId::new(2, 0),
            NodeId::new(1, 0),
            NodeId::new(1, 2),
            NodeId::new(2, 1),
            NodeId::new(1, 1),
        ] {
            heap.push(Reverse(id));
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop().map(|r| r.0.to_string())).collect();
        assert_eq!(order, ["1.2", "1.1", "1.0", "2.1", "2.0"]);
    }

    #[test]
    fn nested_nodes_take_the_next_sequence_of_their_creator() {
        let mut table = NodeTable::default();
        let a = table.create_root();
        let b = table.create_root();
        let a1 = table.create_nested(a.creator(), None);
        let a2 = table.create_nested(a.creator(), None);
        let b1 = table.create_nested(b.creator(), None);
        assert_eq!((a1.creator(), a1.sequence()), (1, 1));
        assert_eq!((a2.creator(), a2.sequence()), (1, 2));
        assert_eq!((b1.creator(), b1.sequence()), (2, 1));
        assert!(a2 < a1 && a1 < a && a < b);
        assert_eq!(table.take_fresh(), vec![a1, a2, b1]);
    }

    #[test]
    fn retention_is_counted_per_edge() {
        let mut table = NodeTable::default();
        let owner = table.create_root();
        let shared = table.create_nested(owner.creator(), None);
        table.retain(shared, Retainer::Node(owner));
        table.retain(shared, Retainer::Node(owner));
        assert_eq!(table.stats().3, 2);

        assert!(!table.unretain(shared, Retainer::Node(owner)));
        assert!(table.unretain(shared, Retainer::Node(owner)));
        assert_eq!(table.stats().3, 0);
    }

    #[test]
    fn creator_bookkeeping_ends_with_its_last_node() {
        let mut table = NodeTable::default();
        let root = table.create_root();
        let nested = table.create_nested(root.creator(), None);
        assert_eq!(table.creators.len(), 1);

        table.remove(root);
        assert_eq!(table.creators[&root.creator()].live, 1);
        // The surviving nested node keeps the sequence counter going.
        let next = table.create_nested(root.creator(), None);
        assert_eq!(next.sequence(), 2);

        table.remove(nested);
        table.remove(next);
        assert!(table.creators.is_empty());
        assert!(table.remove(nested).is_none());
    }

    #[test]
    fn scopes_nest_with_increasing_depth() {
        let mut table = NodeTable::default();
        let node = table.create_root();
        let root = table.node(node).unwrap().root;
        let child = table.open_scope(root).unwrap();
        let grandchild = table.open_scope(child).unwrap();
        assert_eq!(table.scope(grandchild).unwrap().depth, 2);
        assert_eq!(table.scope(grandchild).unwrap().node, node);
    }
}
