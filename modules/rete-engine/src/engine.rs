//! The engine handle. All graph state lives on one dedicated thread; handles
//! talk to it through a command channel and read its committed version from a
//! watch watermark.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::select_all;
use rete_store::{Change, Db, MemoryStore};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::matching::QueryValue;
use crate::node::ObserverId;
use crate::observable::{Invalidation, TokenSet};
use crate::query::Query;
use crate::rete::Rete;
use crate::terminal::Continuation;

pub(crate) enum Command {
    Run(Box<dyn FnOnce(&mut Rete) + Send>),
    Remove(ObserverId),
    Change(Change),
}

#[derive(Debug, Clone)]
struct Watermark {
    version: u64,
    poisoned: Option<Arc<EngineError>>,
}

/// Size of the graph, for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub version: u64,
    pub nodes: usize,
    pub scopes: usize,
    pub entries: usize,
    pub interned: usize,
    pub retention_edges: usize,
    pub observers: usize,
}

/// Cloneable, thread-safe handle to a running engine.
#[derive(Clone)]
pub struct Engine {
    commands: mpsc::UnboundedSender<Command>,
    watermark: watch::Receiver<Watermark>,
    next_observer: Arc<AtomicU64>,
}

impl Engine {
    /// Start the engine thread over `db`. The thread exits once every handle
    /// and subscription is dropped.
    pub fn spawn(db: Db, config: EngineConfig) -> Result<Self, EngineError> {
        let (commands, rx) = mpsc::unbounded_channel();
        let (publish, watermark) = watch::channel(Watermark {
            version: db.version(),
            poisoned: None,
        });
        // Graph state is not Send; it is built on the engine thread.
        std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || run(Rete::new(db, config), rx, publish))
            .map_err(anyhow::Error::from)?;
        Ok(Self {
            commands,
            watermark,
            next_observer: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Spawn over `store` and follow its changes. Must run inside a tokio
    /// runtime.
    pub fn connect(store: &MemoryStore, config: EngineConfig) -> Result<Self, EngineError> {
        // Subscribe before taking the snapshot; changes already contained in
        // it arrive stale and are skipped.
        let changes = store.subscribe();
        let engine = Self::spawn(store.snapshot(), config)?;
        engine.attach(changes);
        Ok(engine)
    }

    /// Forward a change stream into the engine, in order.
    pub fn attach(&self, mut changes: mpsc::UnboundedReceiver<Change>) -> JoinHandle<()> {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                if commands.send(Command::Change(change)).is_err() {
                    break;
                }
            }
        })
    }

    pub fn propagate_change(&self, change: Change) -> Result<(), EngineError> {
        self.send(Command::Change(change))
    }

    fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands.send(command).map_err(|_| EngineError::Closed)
    }

    /// Register an observer. `init` receives the current matches and returns
    /// the callback for every later committed change. If any of
    /// `dependencies` fires, the observer is removed.
    pub async fn observe<T, I, C>(
        &self,
        query: Query<T>,
        dependencies: Vec<Invalidation>,
        init: I,
    ) -> Result<Subscription, EngineError>
    where
        T: QueryValue,
        I: FnOnce(TokenSet<T>) -> C + Send + 'static,
        C: FnMut(TokenSet<T>) + 'static,
    {
        if dependencies.iter().any(Invalidation::is_fired) {
            debug!("Observe skipped, dependency already invalidated");
            return Ok(Subscription::noop());
        }

        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        let (reply, response) = oneshot::channel();
        self.send(Command::Run(Box::new(move |rete: &mut Rete| {
            let init: Box<dyn FnOnce(TokenSet<T>) -> Continuation<T>> =
                Box::new(move |initial: TokenSet<T>| -> Continuation<T> { Box::new(init(initial)) });
            let _ = reply.send(rete.observe(id, &query, init));
        })))?;
        response.await.map_err(|_| EngineError::Closed)??;

        let watcher = (!dependencies.is_empty()).then(|| {
            let commands = self.commands.clone();
            tokio::spawn(async move {
                select_all(dependencies.iter().map(|d| Box::pin(d.fired()))).await;
                debug!(observer = %id, "Dependency invalidated, removing observer");
                let _ = commands.send(Command::Remove(id));
            })
        });

        Ok(Subscription {
            id: Some(id),
            commands: Some(self.commands.clone()),
            watcher,
        })
    }

    /// Observe `query` as a stream of token sets, the initial one first.
    pub async fn subscribe<T: QueryValue>(
        &self,
        query: Query<T>,
    ) -> Result<(Subscription, mpsc::UnboundedReceiver<TokenSet<T>>), EngineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self
            .observe(query, Vec::new(), move |initial: TokenSet<T>| {
                let _ = tx.send(initial);
                move |set: TokenSet<T>| {
                    let _ = tx.send(set);
                }
            })
            .await?;
        Ok((subscription, rx))
    }

    /// One-shot evaluation against the engine's committed snapshot.
    pub async fn evaluate<T: QueryValue>(&self, query: Query<T>) -> Result<Vec<T>, EngineError> {
        let (tx, rx) = oneshot::channel();
        let subscription = self
            .observe(query, Vec::new(), move |initial: TokenSet<T>| {
                let _ = tx.send(initial);
                |_: TokenSet<T>| {}
            })
            .await?;
        let initial = rx.await.map_err(|_| EngineError::Closed)?;
        drop(subscription);
        if let Some(err) = initial.failures.first() {
            return Err(EngineError::QueryBuild(err.to_string()));
        }
        Ok(initial.asserted_values())
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Run(Box::new(move |rete: &mut Rete| {
            let _ = reply.send(rete.stats());
        })))?;
        response.await.map_err(|_| EngineError::Closed)
    }

    /// Version of the last committed change.
    pub fn current_version(&self) -> u64 {
        self.watermark.borrow().version
    }

    /// Resolve once the engine has committed `version`. Fails if the engine
    /// is poisoned before getting there, or has shut down.
    pub async fn await_version(&self, version: u64) -> Result<(), EngineError> {
        let mut watermark = self.watermark.clone();
        let reached = watermark
            .wait_for(|w| w.version >= version || w.poisoned.is_some())
            .await
            .map_err(|_| EngineError::Closed)?
            .clone();
        match reached.poisoned {
            Some(err) if reached.version < version => Err(EngineError::Poisoned(err)),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("version", &self.current_version())
            .finish()
    }
}

fn run(mut rete: Rete, mut commands: mpsc::UnboundedReceiver<Command>, publish: watch::Sender<Watermark>) {
    info!(version = rete.version(), fail_strict = rete.config.fail_strict, "Engine started");
    while let Some(command) = commands.blocking_recv() {
        match command {
            Command::Run(f) => f(&mut rete),
            Command::Remove(id) => rete.remove_observer(id),
            Command::Change(change) => {
                let result = rete.propagate(change);
                let version = rete.version();
                publish.send_modify(|w| {
                    w.version = version;
                    if let Err(EngineError::Poisoned(err)) = &result {
                        w.poisoned = Some(err.clone());
                    }
                });
            }
        }
    }
    if rete.poisoned.is_some() {
        warn!("Engine stopped while poisoned");
    }
    rete.shutdown();
    info!(version = rete.version(), "Engine stopped");
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Disposal handle for an observer. Dropping it removes the observer.
pub struct Subscription {
    id: Option<ObserverId>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    watcher: Option<JoinHandle<()>>,
}

impl Subscription {
    fn noop() -> Self {
        Self {
            id: None,
            commands: None,
            watcher: None,
        }
    }

    pub fn id(&self) -> Option<ObserverId> {
        self.id
    }

    /// True when nothing was registered because a dependency had already
    /// fired.
    pub fn is_noop(&self) -> bool {
        self.id.is_none()
    }

    pub fn dispose(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if let (Some(id), Some(commands)) = (self.id.take(), self.commands.take()) {
            let _ = commands.send(Command::Remove(id));
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
