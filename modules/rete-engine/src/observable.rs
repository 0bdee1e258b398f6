//! What external callers hold: observable matches, their one-shot
//! invalidation signals, and structured cancellation under a match.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{EngineError, MatchInvalidated};
use crate::matching::{Match, Support, Validity};
use crate::node::ObserverId;

// ---------------------------------------------------------------------------
// Invalidation
// ---------------------------------------------------------------------------

/// One-shot signal. Fires at most once; waiters wake when it does.
#[derive(Clone)]
pub struct Invalidation {
    id: u64,
    signal: Arc<watch::Sender<bool>>,
}

impl Invalidation {
    pub(crate) fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let (tx, _) = watch::channel(false);
        Self {
            id: NEXT.fetch_add(1, Ordering::Relaxed),
            signal: Arc::new(tx),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_fired(&self) -> bool {
        *self.signal.borrow()
    }

    /// Returns true only for the call that actually fired it.
    pub(crate) fn fire(&self) -> bool {
        !self.signal.send_replace(true)
    }

    /// Resolves once fired.
    pub async fn fired(&self) {
        let mut rx = self.signal.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl std::fmt::Debug for Invalidation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invalidation")
            .field("id", &self.id)
            .field("fired", &self.is_fired())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ObservableMatch / Premise
// ---------------------------------------------------------------------------

/// A match handed to an observer. Its invalidation fires after the change
/// retracting it has committed, or when the observer is torn down.
#[derive(Debug, Clone)]
pub struct ObservableMatch<T> {
    item: Match<T>,
    observer: ObserverId,
    invalidation: Invalidation,
}

impl<T> ObservableMatch<T> {
    pub(crate) fn new(item: Match<T>, observer: ObserverId) -> Self {
        Self {
            item,
            observer,
            invalidation: Invalidation::new(),
        }
    }

    pub fn value(&self) -> &T {
        self.item.value()
    }

    pub fn as_match(&self) -> &Match<T> {
        &self.item
    }

    pub fn observer(&self) -> ObserverId {
        self.observer
    }

    pub fn invalidation(&self) -> &Invalidation {
        &self.invalidation
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidation.is_fired()
    }

    /// Type-erased handle for the write interceptor.
    pub fn premise(&self) -> Premise {
        Premise {
            support: self.item.support().clone(),
            invalidation: self.invalidation.clone(),
        }
    }
}

/// A fact a computation relied on: its provenance plus the signal that fires
/// when the engine retracts it.
#[derive(Debug, Clone)]
pub struct Premise {
    pub(crate) support: Support,
    pub(crate) invalidation: Invalidation,
}

impl Premise {
    pub fn support(&self) -> &Support {
        &self.support
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidation.is_fired()
    }

    pub fn validate(&self, db: &dyn rete_store::Snapshot) -> Validity {
        if self.is_invalidated() {
            return Validity::Invalid;
        }
        self.support.validate(db)
    }
}

// ---------------------------------------------------------------------------
// TokenSet
// ---------------------------------------------------------------------------

/// Everything one observer learns from one committed change.
#[derive(Debug)]
pub struct TokenSet<T> {
    pub asserted: Vec<ObservableMatch<T>>,
    pub retracted: Vec<ObservableMatch<T>>,
    pub failures: Vec<Arc<EngineError>>,
}

impl<T> TokenSet<T> {
    pub(crate) fn initial(asserted: Vec<ObservableMatch<T>>, failures: Vec<Arc<EngineError>>) -> Self {
        Self {
            asserted,
            retracted: Vec::new(),
            failures,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.asserted.is_empty() && self.retracted.is_empty() && self.failures.is_empty()
    }

    /// Retractions first, then assertions.
    pub fn iter(&self) -> impl Iterator<Item = (bool, &ObservableMatch<T>)> {
        self.retracted
            .iter()
            .map(|m| (false, m))
            .chain(self.asserted.iter().map(|m| (true, m)))
    }
}

impl<T: Clone> TokenSet<T> {
    pub fn asserted_values(&self) -> Vec<T> {
        self.asserted.iter().map(|m| m.value().clone()).collect()
    }

    pub fn retracted_values(&self) -> Vec<T> {
        self.retracted.iter().map(|m| m.value().clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Structured cancellation
// ---------------------------------------------------------------------------

/// Handle given to a body running under a match. Work spawned through it is
/// cancelled when the match is invalidated.
#[derive(Debug, Clone)]
pub struct MatchScope {
    invalidation: Invalidation,
}

impl MatchScope {
    pub fn is_cancelled(&self) -> bool {
        self.invalidation.is_fired()
    }

    pub async fn cancelled(&self) {
        self.invalidation.fired().await
    }

    /// Spawn background work bound to the match.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<Result<F::Output, MatchInvalidated>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let invalidation = self.invalidation.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = invalidation.fired() => Err(MatchInvalidated),
                out = fut => Ok(out),
            }
        })
    }
}

/// Run `body` for as long as `item` stays valid. Resolves to
/// `Err(MatchInvalidated)` as soon as the match is retracted.
pub async fn with_match<T, F, Fut>(
    item: &ObservableMatch<T>,
    body: F,
) -> Result<Fut::Output, MatchInvalidated>
where
    F: FnOnce(MatchScope) -> Fut,
    Fut: Future,
{
    let invalidation = item.invalidation().clone();
    if invalidation.is_fired() {
        return Err(MatchInvalidated);
    }
    let scope = MatchScope {
        invalidation: invalidation.clone(),
    };
    tokio::select! {
        biased;
        _ = invalidation.fired() => {
            debug!(invalidation = invalidation.id(), "Computation cancelled by retraction");
            Err(MatchInvalidated)
        }
        out = body(scope) => Ok(out),
    }
}
