//! Consistent writes: a transaction that depends on observed matches commits
//! only if those matches still hold, and returns only after the engine has
//! caught up with it.

use rete_store::{Change, Datom, MemoryStore, Snapshot};
use thiserror::Error;
use tracing::debug;

use crate::engine::Engine;
use crate::error::{EngineError, MatchInvalidated};
use crate::matching::Validity;
use crate::observable::Premise;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error(transparent)]
    Invalidated(#[from] MatchInvalidated),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

enum Verdict {
    Valid,
    Invalid,
    Inconclusive,
}

/// Write interceptor over a store and the engine following it.
#[derive(Clone)]
pub struct ConsistentWriter {
    store: MemoryStore,
    engine: Engine,
}

impl ConsistentWriter {
    pub fn new(store: MemoryStore, engine: Engine) -> Self {
        Self { store, engine }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Commit `datoms` if every premise still holds against the pre-write
    /// snapshot. An inconclusive premise waits for the engine to reach that
    /// snapshot and retries. After committing, waits until the engine has
    /// processed the write; that wait completes even if this future is
    /// dropped.
    pub async fn transact(&self, premises: &[Premise], datoms: Vec<Datom>) -> Result<Change, WriteError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let lock = self.store.lock().await;
            let before = lock.db();
            match self.verdict(premises, &*before) {
                Verdict::Invalid => {
                    debug!(attempt, version = before.version(), "Write rejected, premise no longer holds");
                    return Err(MatchInvalidated.into());
                }
                Verdict::Inconclusive => {
                    drop(lock);
                    debug!(attempt, version = before.version(), "Premises inconclusive, waiting for engine");
                    self.engine.await_version(before.version()).await?;
                }
                Verdict::Valid => {
                    let change = lock.commit(datoms);
                    let version = change.db_after.version();
                    let engine = self.engine.clone();
                    let catch_up = tokio::spawn(async move { engine.await_version(version).await });
                    catch_up.await.map_err(|e| EngineError::Query(e.into()))??;
                    debug!(attempt, version, "Consistent write committed");
                    return Ok(change);
                }
            }
        }
    }

    fn verdict(&self, premises: &[Premise], before: &dyn Snapshot) -> Verdict {
        // An engine at `before` has already fired the invalidation of any
        // premise `before` contradicts.
        let caught_up = self.engine.current_version() == before.version();
        let mut inconclusive = false;
        for premise in premises {
            if premise.is_invalidated() {
                return Verdict::Invalid;
            }
            if caught_up {
                continue;
            }
            match premise.support().validate(before) {
                Validity::Valid => {}
                Validity::Invalid => return Verdict::Invalid,
                Validity::Inconclusive => inconclusive = true,
            }
        }
        if inconclusive {
            Verdict::Inconclusive
        } else {
            Verdict::Valid
        }
    }
}
