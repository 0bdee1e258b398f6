//! Shared setup: an in-memory store with an engine following it.

#![allow(dead_code)]

use rete_engine::{Datom, Engine, EngineConfig, MemoryStore, ObservableMatch, TokenSet};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub store: MemoryStore,
    pub engine: Engine,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        init_tracing();
        let store = MemoryStore::new();
        let engine = Engine::connect(&store, config).expect("engine thread should start");
        Self { store, engine }
    }

    /// Commit and wait until the engine has propagated the write.
    pub async fn write(&self, datoms: Vec<Datom>) -> u64 {
        let version = self.commit(datoms).await;
        self.engine
            .await_version(version)
            .await
            .expect("engine should reach the written version");
        version
    }

    /// Commit without waiting for the engine.
    pub async fn commit(&self, datoms: Vec<Datom>) -> u64 {
        self.store.transact(datoms).await.db_after.version()
    }
}

/// Apply token sets to a multiset of values, the way a consumer would.
pub struct Mirror<T> {
    pub values: Vec<T>,
}

impl<T: Clone + PartialEq + Ord> Mirror<T> {
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    pub fn apply(&mut self, set: &TokenSet<T>) {
        for (added, m) in set.iter() {
            let value = m.value().clone();
            if added {
                self.values.push(value);
            } else if let Some(pos) = self.values.iter().position(|v| *v == value) {
                self.values.remove(pos);
            }
        }
    }

    pub fn sorted(&self) -> Vec<T> {
        let mut out = self.values.clone();
        out.sort();
        out
    }
}

pub fn sorted<T: Ord>(mut values: Vec<T>) -> Vec<T> {
    values.sort();
    values
}

pub fn values<T: Clone>(matches: &[ObservableMatch<T>]) -> Vec<T> {
    matches.iter().map(|m| m.value().clone()).collect()
}
