use std::sync::Arc;

use thiserror::Error;

use crate::node::NodeId;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Query build failed: {0}")]
    QueryBuild(String),

    #[error("Propagation failed in node {node}: {message}")]
    Propagation { node: NodeId, message: String },

    #[error("Observer callback failed: {0}")]
    ObserverCallback(String),

    #[error("Engine poisoned: {0}")]
    Poisoned(Arc<EngineError>),

    #[error("Engine is shut down")]
    Closed,

    #[error(transparent)]
    Query(#[from] anyhow::Error),
}

/// Controlled cancellation: the match a computation depended on was retracted.
/// Not a failure, never logged as one.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Match invalidated")]
pub struct MatchInvalidated;

/// True when `err` is (or wraps) a `MatchInvalidated` cancellation.
pub fn is_invalidation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<MatchInvalidated>())
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidation_is_found_through_context() {
        let err = anyhow::Error::new(MatchInvalidated).context("while indexing");
        assert!(is_invalidation(&err));
        assert!(!is_invalidation(&anyhow::anyhow!("boom")));
    }

    #[test]
    fn poisoned_error_pins_cause() {
        let cause = Arc::new(EngineError::QueryBuild("bad".into()));
        let err = EngineError::Poisoned(cause);
        assert_eq!(err.to_string(), "Engine poisoned: Query build failed: bad");
    }
}
