//! Single-writer, versioned, in-memory fact store.
//!
//! Writes are serialized through one async lock. Every commit produces a
//! `Change` that is broadcast to subscribers in commit order.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, MutexGuard};
use tracing::debug;

use crate::snapshot::{Change, Db, MemorySnapshot, Snapshot};
use crate::types::Datom;

/// In-memory store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    writer: tokio::sync::Mutex<()>,
    current: ArcSwap<MemorySnapshot>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<Change>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_snapshot(MemorySnapshot::empty())
    }

    pub fn with_snapshot(snapshot: MemorySnapshot) -> Self {
        Self {
            inner: Arc::new(Inner {
                writer: tokio::sync::Mutex::new(()),
                current: ArcSwap::from_pointee(snapshot),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Latest committed snapshot.
    pub fn snapshot(&self) -> Db {
        self.inner.current.load_full()
    }

    /// Stream of every change committed after this call, in commit order.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Change> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners().push(tx);
        rx
    }

    /// Acquire the writer. The guard exposes the pre-write snapshot; nothing
    /// else can commit until it is committed or dropped.
    pub async fn lock(&self) -> WriteLock<'_> {
        let guard = self.inner.writer.lock().await;
        WriteLock {
            store: self,
            before: self.inner.current.load_full(),
            _guard: guard,
        }
    }

    /// Lock, commit, release.
    pub async fn transact(&self, datoms: Vec<Datom>) -> Change {
        self.lock().await.commit(datoms)
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<Change>>> {
        // A panicking subscriber cannot leave the list half-updated.
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive write access to a `MemoryStore`.
pub struct WriteLock<'a> {
    store: &'a MemoryStore,
    before: Arc<MemorySnapshot>,
    _guard: MutexGuard<'a, ()>,
}

impl WriteLock<'_> {
    /// The snapshot this write will be applied to.
    pub fn db(&self) -> Db {
        self.before.clone()
    }

    pub fn version(&self) -> u64 {
        self.before.version()
    }

    /// Apply `datoms`, publish the new snapshot, and notify subscribers before
    /// releasing the writer so notifications stay in commit order.
    pub fn commit(self, datoms: Vec<Datom>) -> Change {
        let (after, novelty) = self.before.apply(&datoms);
        let after = Arc::new(after);
        self.store.inner.current.store(after.clone());

        let change = Change {
            db_before: self.before.clone(),
            db_after: after,
            novelty,
        };

        debug!(
            version = change.db_after.version(),
            datoms = change.novelty.len(),
            "Committed write"
        );

        self.store
            .listeners()
            .retain(|tx| tx.send(change.clone()).is_ok());

        change
    }
}
