//! Interned nodes: one shared computation per `InternKey`, fanned out to every
//! consumer that builds the same key.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::error::EngineError;
use crate::matching::{Match, QueryValue, Token};
use crate::node::{self, InternKey, NodeId, Retainer, ScopeId};
use crate::query::{BuildResult, Collector, Producer, Query};
use crate::rete::Cx;

struct Downstream<T> {
    id: u64,
    node: NodeId,
    scope: ScopeId,
    emit: Collector<T>,
}

/// State of an interned node, stored type-erased on the node itself.
pub(crate) struct Shared<T> {
    node: NodeId,
    live: RefCell<HashMap<Match<T>, usize>>,
    downstream: RefCell<Vec<Downstream<T>>>,
    next: Cell<u64>,
}

impl<T: QueryValue> Shared<T> {
    fn new(node: NodeId) -> Self {
        Self {
            node,
            live: RefCell::new(HashMap::new()),
            downstream: RefCell::new(Vec::new()),
            next: Cell::new(0),
        }
    }

    /// Record `token` in the live set and forward it to every consumer. While
    /// a change is propagating the forward goes through the consumer's task so
    /// it runs in node order.
    fn accept(&self, cx: &mut Cx<'_>, token: Token<T>) {
        {
            let mut live = self.live.borrow_mut();
            if token.added {
                *live.entry(token.item.clone()).or_insert(0) += 1;
            } else if let Some(n) = live.get_mut(&token.item) {
                *n -= 1;
                if *n == 0 {
                    live.remove(&token.item);
                }
            }
        }

        let targets: Vec<(NodeId, ScopeId, Collector<T>)> = self
            .downstream
            .borrow()
            .iter()
            .map(|d| (d.node, d.scope, d.emit.clone()))
            .collect();
        for (node, scope, emit) in targets {
            let token = token.clone();
            if cx.propagating() {
                let added = token.added;
                cx.enqueue_delivery(
                    node,
                    scope,
                    added,
                    Box::new(move |cx: &mut Cx<'_>| emit(cx, token)),
                );
            } else {
                emit(&mut cx.enter(scope), token);
            }
        }
    }
}

struct InternProducer<T> {
    shared: Rc<Shared<T>>,
}

impl<T: QueryValue> Producer<T> for InternProducer<T> {
    fn collect(&self, cx: &mut Cx<'_>, emit: Collector<T>) {
        let shared = &self.shared;
        let consumer = cx.node();
        let home = cx.scope();

        let id = shared.next.get();
        shared.next.set(id + 1);
        shared.downstream.borrow_mut().push(Downstream {
            id,
            node: consumer,
            scope: home,
            emit: emit.clone(),
        });
        cx.rete.nodes.retain(shared.node, Retainer::Node(consumer));

        let hook_shared = shared.clone();
        cx.on_close(
            home,
            Box::new(move |cx: &mut Cx<'_>| {
                hook_shared.downstream.borrow_mut().retain(|d| d.id != id);
                node::release(cx, hook_shared.node, Retainer::Node(consumer));
            }),
        );

        let replay: Vec<(Match<T>, usize)> = shared
            .live
            .borrow()
            .iter()
            .map(|(m, n)| (m.clone(), *n))
            .collect();
        for (item, n) in replay {
            for _ in 0..n {
                emit(cx, Token::added(item.clone()));
            }
        }
    }
}

/// Producer for the node interned under `key`, building it on first use.
pub(crate) fn intern<T: QueryValue>(cx: &mut Cx<'_>, key: InternKey, query: &Query<T>) -> BuildResult<T> {
    let shared = match cx.rete.nodes.interned.get(&key).copied() {
        Some(existing) => shared_of::<T>(cx, existing, &key)?,
        None => build_shared(cx, key, query)?,
    };
    Ok(Rc::new(InternProducer { shared }))
}

fn shared_of<T: QueryValue>(cx: &Cx<'_>, node: NodeId, key: &InternKey) -> Result<Rc<Shared<T>>, EngineError> {
    cx.rete
        .nodes
        .node(node)
        .and_then(|n| n.state.clone())
        .and_then(|state| state.downcast::<Shared<T>>().ok())
        .ok_or_else(|| EngineError::QueryBuild(format!("interned node '{}' has no state", key.name)))
}

fn build_shared<T: QueryValue>(cx: &mut Cx<'_>, key: InternKey, query: &Query<T>) -> Result<Rc<Shared<T>>, EngineError> {
    let creator = cx.node().creator();
    let node = cx.rete.nodes.create_nested(creator, Some(key.clone()));
    let root = cx
        .rete
        .nodes
        .root(node)
        .ok_or_else(|| EngineError::QueryBuild(format!("interned node '{}' vanished", key.name)))?;

    let shared = Rc::new(Shared::<T>::new(node));
    if let Some(n) = cx.rete.nodes.node_mut(node) {
        n.state = Some(shared.clone() as Rc<dyn Any>);
    }
    cx.rete.nodes.interned.insert(key.clone(), node);

    let mut inner = cx.enter(root);
    let producer = match query.build(&mut inner) {
        Ok(producer) => producer,
        Err(err) => {
            node::dispose(&mut inner, node);
            return Err(err);
        }
    };
    let sink = shared.clone();
    producer.collect(
        &mut inner,
        Rc::new(move |cx: &mut Cx<'_>, token: Token<T>| sink.accept(cx, token)),
    );
    debug!(node = %node, key = %key.name, "Interned node built");
    Ok(shared)
}
