//! Incremental query engine over a versioned fact store.
//!
//! Queries are built from combinators over store patterns. An observed query
//! is hydrated against the current snapshot and then kept up to date: every
//! committed change is propagated through a shared node graph and each
//! observer receives one `TokenSet` of asserted and retracted matches. Every
//! delivered match carries an invalidation signal that fires once the match
//! is retracted, which `with_match` and `ConsistentWriter` build on.

pub mod config;
pub mod consistency;
pub mod engine;
pub mod error;
pub mod matching;
pub mod node;
pub mod observable;
pub mod query;

mod intern;
mod propagation;
mod rete;
mod subscriptions;
mod terminal;

pub use config::EngineConfig;
pub use consistency::{ConsistentWriter, WriteError};
pub use engine::{Engine, EngineStats, Subscription};
pub use error::{is_invalidation, EngineError, MatchInvalidated};
pub use matching::{BindKey, Match, QueryValue, Support, Token, Validity};
pub use node::{NodeId, ObserverId};
pub use observable::{with_match, Invalidation, MatchScope, ObservableMatch, Premise, TokenSet};
pub use query::{Query, Reads};

pub use rete_store::{
    Attribute, Change, Datom, Db, EntityId, MemorySnapshot, MemoryStore, Pattern, Snapshot,
    Triple, Value,
};
