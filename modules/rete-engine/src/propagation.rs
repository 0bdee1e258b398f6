//! Change propagation: one cycle per committed store change.
//!
//! Net the change's novelty, route it through the subscriptions index into
//! per-node tasks, and drain the tasks in `NodeId` order. Within a node,
//! queued token deliveries run first, then raw datoms (deepest subscription
//! first), then revalidations. Nothing is delivered to observers until the
//! whole cycle has drained.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use rete_store::{Attribute, Change, Datom, Db, EntityId, Value};
use tracing::{debug, error, info, warn};

use crate::error::{panic_message, EngineError};
use crate::node::{NodeId, ObserverId, Retainer, ScopeId};
use crate::rete::{Cx, Rete};
use crate::subscriptions::{EntryId, Port};

/// Tokens an upstream node forwarded to `scope` during the cycle.
pub(crate) struct Delivery {
    pub(crate) scope: ScopeId,
    pub(crate) added: bool,
    pub(crate) run: Box<dyn FnOnce(&mut Cx<'_>)>,
}

#[derive(Default)]
struct PropagationTask {
    novelty: Vec<(EntryId, Datom)>,
    revalidate: BTreeSet<EntryId>,
    deliveries: Vec<Delivery>,
}

pub(crate) struct Propagation {
    before: Db,
    after: Db,
    queue: BinaryHeap<Reverse<NodeId>>,
    tasks: HashMap<NodeId, PropagationTask>,
    failures: HashMap<NodeId, Arc<EngineError>>,
    pub(crate) touched: BTreeSet<ObserverId>,
}

impl Propagation {
    fn new(before: Db, after: Db) -> Self {
        Self {
            before,
            after,
            queue: BinaryHeap::new(),
            tasks: HashMap::new(),
            failures: HashMap::new(),
            touched: BTreeSet::new(),
        }
    }

    fn task(&mut self, node: NodeId) -> &mut PropagationTask {
        if !self.tasks.contains_key(&node) {
            self.queue.push(Reverse(node));
        }
        self.tasks.entry(node).or_default()
    }

    pub(crate) fn enqueue(&mut self, node: NodeId, delivery: Delivery) {
        self.task(node).deliveries.push(delivery);
    }

    fn pop(&mut self) -> Option<(NodeId, PropagationTask)> {
        while let Some(Reverse(node)) = self.queue.pop() {
            if let Some(task) = self.tasks.remove(&node) {
                return Some((node, task));
            }
        }
        None
    }
}

/// Cancel add/retract pairs of the same triple, then order the rest by
/// (entity, attribute) in first-seen order with retractions before
/// assertions inside each group.
pub(crate) fn net_novelty(novelty: &[Datom]) -> Vec<Datom> {
    let mut groups: Vec<(EntityId, Attribute)> = Vec::new();
    let mut effects: HashMap<(EntityId, Attribute), Vec<(Value, i64)>> = HashMap::new();
    for datom in novelty {
        let key = (datom.entity, datom.attribute.clone());
        if !effects.contains_key(&key) {
            groups.push(key.clone());
        }
        let values = effects.entry(key).or_default();
        let delta = if datom.added { 1 } else { -1 };
        match values.iter_mut().find(|(v, _)| *v == datom.value) {
            Some((_, n)) => *n += delta,
            None => values.push((datom.value.clone(), delta)),
        }
    }

    let mut out = Vec::new();
    for (entity, attribute) in groups {
        let Some(values) = effects.remove(&(entity, attribute.clone())) else {
            continue;
        };
        for (value, _) in values.iter().filter(|(_, n)| *n < 0) {
            out.push(Datom::retract(entity, attribute.clone(), value.clone()));
        }
        for (value, _) in values.iter().filter(|(_, n)| *n > 0) {
            out.push(Datom::add(entity, attribute.clone(), value.clone()));
        }
    }
    out
}

impl Rete {
    /// Run one propagation cycle for `change` and commit it. In fail-strict
    /// mode a node failure aborts the cycle before commit and poisons the
    /// engine.
    pub(crate) fn propagate(&mut self, change: Change) -> Result<(), EngineError> {
        let version = change.db_after.version();
        if let Some(err) = &self.poisoned {
            warn!(version, error = %err, "Change ignored by poisoned engine");
            return Ok(());
        }
        if version <= self.version() {
            warn!(version, current = self.version(), "Stale change ignored");
            return Ok(());
        }

        let novelty = net_novelty(&change.novelty);
        let mut propagation = Propagation::new(change.db_before, change.db_after);
        for datom in &novelty {
            for hit in self.index.lookup(&datom.triple()) {
                let task = propagation.task(hit.node);
                if hit.revalidation {
                    task.revalidate.insert(hit.entry);
                } else {
                    task.novelty.push((hit.entry, datom.clone()));
                }
            }
        }
        debug!(version, datoms = novelty.len(), nodes = propagation.tasks.len(), "Propagating change");

        self.propagation = Some(propagation);
        let drained = self.drain();
        let propagation = self.propagation.take();
        match (drained, propagation) {
            (Err(err), _) => {
                let err = Arc::new(err);
                error!(version, error = %err, "Propagation aborted, engine poisoned");
                self.poisoned = Some(err.clone());
                Err(EngineError::Poisoned(err))
            }
            (Ok(()), Some(propagation)) => {
                self.commit(propagation);
                Ok(())
            }
            (Ok(()), None) => Ok(()),
        }
    }

    fn drain(&mut self) -> Result<(), EngineError> {
        let mut processed = 0usize;
        loop {
            let Some(propagation) = self.propagation.as_mut() else {
                return Ok(());
            };
            let Some((node, task)) = propagation.pop() else {
                break;
            };
            let before = propagation.before.clone();
            let after = propagation.after.clone();
            if !self.nodes.contains(node) {
                continue;
            }
            processed += 1;

            self.failures.clear();
            self.process(node, task, &before, &after);
            let failures: Vec<(NodeId, EngineError)> = self.failures.drain(..).collect();
            for (at, err) in failures {
                error!(node = %at, error = %err, "Node failed during propagation");
                if self.config.fail_strict {
                    return Err(err);
                }
                if let Some(propagation) = self.propagation.as_mut() {
                    propagation.failures.entry(at).or_insert_with(|| Arc::new(err));
                }
            }
        }
        debug!(nodes = processed, "Propagation drained");
        Ok(())
    }

    /// Each delivery and port call is isolated: a panic becomes a failure of
    /// `node` and the rest of the task still runs.
    fn process(&mut self, node: NodeId, task: PropagationTask, before: &Db, after: &Db) {
        for delivery in task.deliveries {
            if !self.nodes.has_scope(delivery.scope) {
                continue;
            }
            let db = if delivery.added { after.clone() } else { before.clone() };
            self.guarded(node, |rete| (delivery.run)(&mut Cx::new(rete, delivery.scope, node, db)));
        }

        let mut grouped: BTreeMap<EntryId, Vec<Datom>> = BTreeMap::new();
        for (entry, datom) in task.novelty {
            grouped.entry(entry).or_default().push(datom);
        }
        for (entry, datoms) in self.deepest_first(grouped) {
            for datom in datoms {
                // An earlier datom may have closed the entry's scope.
                let Some((scope, Port::Datom(port))) =
                    self.index.get(entry).map(|e| (e.scope, e.port.clone()))
                else {
                    break;
                };
                let db = if datom.added { after.clone() } else { before.clone() };
                self.guarded(node, |rete| port(&mut Cx::new(rete, scope, node, db), &datom));
            }
        }

        let revalidate = task.revalidate.into_iter().map(|e| (e, ())).collect();
        for (entry, ()) in self.deepest_first(revalidate) {
            let Some((scope, Port::Revalidation(port))) =
                self.index.get(entry).map(|e| (e.scope, e.port.clone()))
            else {
                continue;
            };
            let patterns =
                self.guarded(node, |rete| port(&mut Cx::new(rete, scope, node, after.clone())));
            // A panicked revalidation keeps its previous registration.
            if let Some(patterns) = patterns {
                self.index.swap_patterns(entry, patterns);
            }
        }
    }

    /// Run one port call, turning a panic into a failure of `node`.
    fn guarded<R>(&mut self, node: NodeId, call: impl FnOnce(&mut Rete) -> R) -> Option<R> {
        match catch_unwind(AssertUnwindSafe(|| call(self))) {
            Ok(out) => Some(out),
            Err(payload) => {
                self.failures.push((
                    node,
                    EngineError::Propagation {
                        node,
                        message: panic_message(&*payload),
                    },
                ));
                None
            }
        }
    }

    /// Order entries by descending scope depth, then by id. Entries already
    /// removed are dropped.
    fn deepest_first<V>(&self, entries: BTreeMap<EntryId, V>) -> Vec<(EntryId, V)> {
        let mut ordered: Vec<(u32, EntryId, V)> = entries
            .into_iter()
            .filter_map(|(id, v)| self.index.get(id).map(|e| (e.depth, id, v)))
            .collect();
        ordered.sort_by_key(|(depth, id, _)| (Reverse(*depth), *id));
        ordered.into_iter().map(|(_, id, v)| (id, v)).collect()
    }

    /// Publish the drained cycle: advance the snapshot, hand each touched
    /// observer its token set, then fire the invalidations of what was
    /// retracted.
    fn commit(&mut self, propagation: Propagation) {
        let Propagation {
            after,
            failures,
            touched,
            ..
        } = propagation;
        self.db = after;

        let mut routed: BTreeMap<ObserverId, Vec<Arc<EngineError>>> = BTreeMap::new();
        for (node, err) in &failures {
            for observer in self.dependent_observers(*node) {
                routed.entry(observer).or_default().push(err.clone());
            }
        }

        let mut targets = touched;
        targets.extend(routed.keys().copied());
        let delivered = targets.len();
        let mut retracted = Vec::new();
        for observer in targets {
            let Some(terminal) = self.observers.get(&observer).map(|e| e.terminal.clone()) else {
                continue;
            };
            retracted.extend(terminal.commit(routed.remove(&observer).unwrap_or_default()));
        }
        let invalidated = retracted.iter().filter(|inv| inv.fire()).count();

        self.sweep();
        info!(
            version = self.version(),
            observers = delivered,
            invalidated,
            failures = failures.len(),
            "Change committed"
        );
    }

    /// Observers whose queries depend on `node`, following retainers upward.
    fn dependent_observers(&self, node: NodeId) -> BTreeSet<ObserverId> {
        let mut observers = BTreeSet::new();
        let mut seen = BTreeSet::new();
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            for retainer in self.nodes.retainers(id) {
                match retainer {
                    Retainer::Node(parent) => stack.push(parent),
                    Retainer::Observer(observer) => {
                        observers.insert(observer);
                    }
                }
            }
        }
        observers
    }
}
