//! Terminal endpoints: the last collector of an observed query. Tokens are
//! buffered during a cycle and turned into one `TokenSet` at commit.

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;

use tracing::error;

use crate::error::{panic_message, EngineError};
use crate::matching::{Match, QueryValue, Token};
use crate::node::ObserverId;
use crate::observable::{Invalidation, ObservableMatch, TokenSet};
use crate::query::Collector;
use crate::rete::Cx;

pub(crate) type Continuation<T> = Box<dyn FnMut(TokenSet<T>)>;

/// Type-erased view the engine keeps per observer.
pub(crate) trait Terminal {
    /// Deliver this cycle's tokens and failures. Returns the invalidations of
    /// retracted matches, to be fired by the caller.
    fn commit(&self, failures: Vec<Arc<EngineError>>) -> Vec<Invalidation>;

    /// Forget every live match; returns their invalidations.
    fn teardown(&self) -> Vec<Invalidation>;
}

pub(crate) struct TerminalState<T> {
    observer: ObserverId,
    inner: RefCell<Inner<T>>,
}

struct Inner<T> {
    pending: Vec<Token<T>>,
    live: HashMap<Match<T>, Vec<ObservableMatch<T>>>,
    callback: Option<Continuation<T>>,
}

impl<T: QueryValue> TerminalState<T> {
    pub(crate) fn new(observer: ObserverId) -> Rc<Self> {
        Rc::new(Self {
            observer,
            inner: RefCell::new(Inner {
                pending: Vec::new(),
                live: HashMap::new(),
                callback: None,
            }),
        })
    }

    /// The collector at the end of the query's producer chain.
    pub(crate) fn collector(self: &Rc<Self>) -> Collector<T> {
        let this = self.clone();
        Rc::new(move |cx: &mut Cx<'_>, token: Token<T>| {
            this.inner.borrow_mut().pending.push(token);
            cx.touch_observer(this.observer);
        })
    }

    /// Net the tokens buffered during hydration into the initial match set.
    pub(crate) fn hydrate(&self) -> Vec<ObservableMatch<T>> {
        let (asserted, _) = self.settle();
        asserted
    }

    pub(crate) fn set_callback(&self, callback: Continuation<T>) {
        self.inner.borrow_mut().callback = Some(callback);
    }

    /// Apply pending tokens to the live set. Assert/retract pairs of the same
    /// match within one batch cancel out.
    fn settle(&self) -> (Vec<ObservableMatch<T>>, Vec<ObservableMatch<T>>) {
        let mut inner = self.inner.borrow_mut();
        let pending = std::mem::take(&mut inner.pending);

        let mut order = Vec::new();
        let mut net: HashMap<Match<T>, i64> = HashMap::new();
        for token in pending {
            let delta = if token.added { 1 } else { -1 };
            match net.get_mut(&token.item) {
                Some(n) => *n += delta,
                None => {
                    order.push(token.item.clone());
                    net.insert(token.item, delta);
                }
            }
        }

        let mut asserted = Vec::new();
        let mut retracted = Vec::new();
        for item in order {
            let n = net[&item];
            if n > 0 {
                let entry = inner.live.entry(item.clone()).or_default();
                for _ in 0..n {
                    let observable = ObservableMatch::new(item.clone(), self.observer);
                    entry.push(observable.clone());
                    asserted.push(observable);
                }
            } else if n < 0 {
                let Some(entry) = inner.live.get_mut(&item) else {
                    continue;
                };
                for _ in 0..(-n) {
                    match entry.pop() {
                        Some(observable) => retracted.push(observable),
                        None => break,
                    }
                }
                if entry.is_empty() {
                    inner.live.remove(&item);
                }
            }
        }
        (asserted, retracted)
    }
}

impl<T: QueryValue> Terminal for TerminalState<T> {
    fn commit(&self, failures: Vec<Arc<EngineError>>) -> Vec<Invalidation> {
        let (asserted, retracted) = self.settle();
        let invalidations = retracted
            .iter()
            .map(|m| m.invalidation().clone())
            .collect();
        let set = TokenSet {
            asserted,
            retracted,
            failures,
        };
        if set.is_empty() {
            return invalidations;
        }

        let callback = self.inner.borrow_mut().callback.take();
        if let Some(mut callback) = callback {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(set))) {
                let err = EngineError::ObserverCallback(panic_message(&*payload));
                error!(observer = %self.observer, error = %err, "Observer callback failed");
            }
            self.inner.borrow_mut().callback = Some(callback);
        }
        invalidations
    }

    fn teardown(&self) -> Vec<Invalidation> {
        let mut inner = self.inner.borrow_mut();
        inner.pending.clear();
        inner.callback = None;
        inner
            .live
            .drain()
            .flat_map(|(_, ms)| ms.into_iter().map(|m| m.invalidation().clone()))
            .collect()
    }
}
