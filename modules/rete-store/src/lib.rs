//! Versioned fact store consumed by the rete engine.
//!
//! Facts are (entity, attribute, value) triples. Every write produces a new
//! immutable snapshot with a higher version, plus a `Change` carrying the
//! datoms that actually changed. Zero knowledge of queries or the engine.

pub mod snapshot;
pub mod store;
pub mod types;

pub use snapshot::{Change, Db, MemorySnapshot, Snapshot};
pub use store::{MemoryStore, WriteLock};
pub use types::{Attribute, Datom, EntityId, Pattern, Triple, Value};
