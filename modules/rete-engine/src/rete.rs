//! Engine-thread state: the node graph, the subscriptions index, observer
//! terminals, and the build/propagation context handed to producers.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;

use rete_store::{Db, Pattern};
use tracing::{debug, error, warn};

use crate::config::EngineConfig;
use crate::engine::EngineStats;
use crate::error::{panic_message, EngineError};
use crate::matching::QueryValue;
use crate::node::{self, CloseHook, NodeId, NodeTable, ObserverId, Retainer, ScopeId};
use crate::observable::{Invalidation, TokenSet};
use crate::propagation::{Delivery, Propagation};
use crate::query::Query;
use crate::subscriptions::{DatomPort, EntryId, RevalidationPort, SubscriptionsIndex};
use crate::terminal::{Continuation, Terminal, TerminalState};

pub(crate) struct ObserverEntry {
    pub(crate) node: NodeId,
    pub(crate) terminal: Rc<dyn Terminal>,
}

pub(crate) struct Rete {
    pub(crate) config: EngineConfig,
    pub(crate) db: Db,
    pub(crate) index: SubscriptionsIndex,
    pub(crate) nodes: NodeTable,
    pub(crate) propagation: Option<Propagation>,
    pub(crate) observers: HashMap<ObserverId, ObserverEntry>,
    /// Failures reported through `Cx::fail` since the last drain.
    pub(crate) failures: Vec<(NodeId, EngineError)>,
    pub(crate) poisoned: Option<Arc<EngineError>>,
    next_origin: u64,
}

impl Rete {
    pub(crate) fn new(db: Db, config: EngineConfig) -> Self {
        Self {
            config,
            db,
            index: SubscriptionsIndex::default(),
            nodes: NodeTable::default(),
            propagation: None,
            observers: HashMap::new(),
            failures: Vec::new(),
            poisoned: None,
            next_origin: 0,
        }
    }

    pub(crate) fn version(&self) -> u64 {
        self.db.version()
    }

    /// Context rooted at `node`'s root scope, against the committed snapshot.
    fn node_cx(&mut self, node: NodeId) -> Option<Cx<'_>> {
        let root = self.nodes.root(node)?;
        let db = self.db.clone();
        Some(Cx::new(self, root, node, db))
    }

    /// Build `query` into a fresh root node retained by `observer`, hand the
    /// hydrated matches to `init`, and keep its continuation for later
    /// changes.
    pub(crate) fn observe<T: QueryValue>(
        &mut self,
        observer: ObserverId,
        query: &Query<T>,
        init: Box<dyn FnOnce(TokenSet<T>) -> Continuation<T>>,
    ) -> Result<(), EngineError> {
        if let Some(err) = &self.poisoned {
            warn!(observer = %observer, "Observe refused by poisoned engine");
            return Err(EngineError::Poisoned(err.clone()));
        }

        let node = self.nodes.create_root();
        self.nodes.retain(node, Retainer::Observer(observer));
        let terminal = TerminalState::<T>::new(observer);

        self.failures.clear();
        if let Some(mut cx) = self.node_cx(node) {
            let built = catch_unwind(AssertUnwindSafe(|| -> Result<(), EngineError> {
                let producer = query.build(&mut cx)?;
                producer.collect(&mut cx, terminal.collector());
                Ok(())
            }));
            match built {
                Ok(Ok(())) => {}
                Ok(Err(err)) => cx.fail(err),
                Err(payload) => cx.fail(EngineError::QueryBuild(panic_message(&*payload))),
            }
        }

        let failures: Vec<Arc<EngineError>> = self
            .failures
            .drain(..)
            .map(|(at, err)| {
                error!(observer = %observer, node = %at, error = %err, "Query build failed");
                Arc::new(err)
            })
            .collect();
        if self.config.fail_strict {
            if let Some(first) = failures.first() {
                let err = EngineError::QueryBuild(first.to_string());
                self.abandon(node, observer, terminal.teardown());
                return Err(err);
            }
        }

        let initial = TokenSet::initial(terminal.hydrate(), failures);
        match catch_unwind(AssertUnwindSafe(move || init(initial))) {
            Ok(continuation) => terminal.set_callback(continuation),
            Err(payload) => {
                let err = EngineError::ObserverCallback(panic_message(&*payload));
                error!(observer = %observer, error = %err, "Observer init failed");
                self.abandon(node, observer, terminal.teardown());
                return Err(err);
            }
        }

        self.observers.insert(
            observer,
            ObserverEntry {
                node,
                terminal,
            },
        );
        self.sweep();
        debug!(observer = %observer, node = %node, "Observer registered");
        Ok(())
    }

    fn abandon(&mut self, node: NodeId, observer: ObserverId, invalidations: Vec<Invalidation>) {
        if let Some(mut cx) = self.node_cx(node) {
            node::release(&mut cx, node, Retainer::Observer(observer));
        }
        self.sweep();
        for invalidation in invalidations {
            invalidation.fire();
        }
    }

    /// Tear down an observer: its matches are invalidated and its node
    /// released, cascading to anything only it kept alive.
    pub(crate) fn remove_observer(&mut self, observer: ObserverId) {
        let Some(entry) = self.observers.remove(&observer) else {
            return;
        };
        let invalidations = entry.terminal.teardown();
        let fired = invalidations.len();
        self.abandon(entry.node, observer, invalidations);
        debug!(observer = %observer, invalidated = fired, "Observer removed");
    }

    /// Dispose nodes created during the last build or cycle that nobody ended
    /// up retaining.
    pub(crate) fn sweep(&mut self) {
        for id in self.nodes.take_fresh() {
            if self.nodes.contains(id) && !self.nodes.is_retained(id) {
                if let Some(mut cx) = self.node_cx(id) {
                    node::dispose(&mut cx, id);
                }
            }
        }
    }

    pub(crate) fn stats(&self) -> EngineStats {
        let (nodes, scopes, interned, retention_edges) = self.nodes.stats();
        EngineStats {
            version: self.version(),
            nodes,
            scopes,
            entries: self.index.len(),
            interned,
            retention_edges,
            observers: self.observers.len(),
        }
    }

    /// Remove every observer, firing all outstanding invalidations.
    pub(crate) fn shutdown(&mut self) {
        let observers: Vec<ObserverId> = self.observers.keys().copied().collect();
        for observer in observers {
            self.remove_observer(observer);
        }
        for id in self.nodes.node_ids() {
            if let Some(mut cx) = self.node_cx(id) {
                node::dispose(&mut cx, id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cx
// ---------------------------------------------------------------------------

/// What producers see while building and while handling tokens: the current
/// node and scope, and the snapshot the work is evaluated against.
pub(crate) struct Cx<'a> {
    pub(crate) rete: &'a mut Rete,
    scope: ScopeId,
    node: NodeId,
    db: Db,
}

impl<'a> Cx<'a> {
    pub(crate) fn new(rete: &'a mut Rete, scope: ScopeId, node: NodeId, db: Db) -> Self {
        Self {
            rete,
            scope,
            node,
            db,
        }
    }

    pub(crate) fn db(&self) -> &Db {
        &self.db
    }

    pub(crate) fn scope(&self) -> ScopeId {
        self.scope
    }

    pub(crate) fn node(&self) -> NodeId {
        self.node
    }

    /// Same snapshot, different scope (and the node owning it).
    pub(crate) fn enter(&mut self, scope: ScopeId) -> Cx<'_> {
        let node = self
            .rete
            .nodes
            .scope(scope)
            .map(|s| s.node)
            .unwrap_or(self.node);
        Cx {
            rete: &mut *self.rete,
            scope,
            node,
            db: self.db.clone(),
        }
    }

    pub(crate) fn open_scope(&mut self, parent: ScopeId) -> Option<ScopeId> {
        self.rete.nodes.open_scope(parent)
    }

    pub(crate) fn close_scope(&mut self, scope: ScopeId) {
        node::close_scope(self, scope);
    }

    /// Run `hook` when `scope` closes; immediately if it already has.
    pub(crate) fn on_close(&mut self, scope: ScopeId, hook: CloseHook) {
        if let Some(hook) = self.rete.nodes.add_hook(scope, hook) {
            hook(self);
        }
    }

    fn depth(&self) -> u32 {
        self.rete.nodes.scope(self.scope).map_or(0, |s| s.depth)
    }

    /// Route datoms matching `pattern` to `port`, owned by the current scope.
    pub(crate) fn subscribe(&mut self, pattern: Pattern, port: DatomPort) -> EntryId {
        let depth = self.depth();
        let id = self
            .rete
            .index
            .insert_datom(self.node, self.scope, depth, pattern, port);
        self.rete.nodes.add_entry(self.scope, id);
        id
    }

    /// Re-run `port` whenever a change touches one of `patterns`.
    pub(crate) fn revalidate(&mut self, patterns: Vec<Pattern>, port: RevalidationPort) -> EntryId {
        let depth = self.depth();
        let id = self
            .rete
            .index
            .insert_revalidation(self.node, self.scope, depth, patterns, port);
        self.rete.nodes.add_entry(self.scope, id);
        id
    }

    /// Report a failure of the current node without unwinding.
    pub(crate) fn fail(&mut self, err: EngineError) {
        warn!(node = %self.node, error = %err, "Node reported failure");
        self.rete.failures.push((self.node, err));
    }

    /// Identity for a computed provenance.
    pub(crate) fn next_origin(&mut self) -> u64 {
        self.rete.next_origin += 1;
        self.rete.next_origin
    }

    pub(crate) fn propagating(&self) -> bool {
        self.rete.propagation.is_some()
    }

    /// Queue work for `node` in the running cycle.
    pub(crate) fn enqueue_delivery(
        &mut self,
        node: NodeId,
        scope: ScopeId,
        added: bool,
        run: Box<dyn FnOnce(&mut Cx<'_>)>,
    ) {
        if let Some(propagation) = self.rete.propagation.as_mut() {
            propagation.enqueue(node, Delivery { scope, added, run });
        }
    }

    pub(crate) fn touch_observer(&mut self, observer: ObserverId) {
        if let Some(propagation) = self.rete.propagation.as_mut() {
            propagation.touched.insert(observer);
        }
    }
}
