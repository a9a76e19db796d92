//! Error taxonomy for pool operations
//!
//! Per-node failures ([`AttachError`], [`RejectReason`]) are isolated and
//! aggregated by the callers. Request-level failures ([`PoolError`]) are raised
//! only when aggregation leaves nothing usable.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::store::StoreError;

/// Errors surfaced by inventory and allocation operations
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("No nodes available: {0}")]
    NoResourceAvailable(String),

    #[error("No matching nodes: {0}")]
    NoMatchingNodes(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Pool in use: {0} node(s) still allocated, use force to override")]
    InUse(usize),

    #[error("Failed to attach nodes to '{consumer}': {details}")]
    AttachFailed { consumer: String, details: String },

    #[error(transparent)]
    Attach(#[from] AttachError),

    #[error("Store unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Failure to add or remove a single ownership edge
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    #[error("Node '{0}' not found in store")]
    NotFound(String),

    #[error("Node '{node}' is not available to '{consumer}' (held by: {holders})")]
    Unavailable {
        node: String,
        consumer: String,
        holders: String,
    },

    #[error("Node '{node}' is not allocated to '{consumer}'")]
    NotAttached { node: String, consumer: String },
}

/// Why a node descriptor was refused on import
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    AlreadyInPool,
    MissingType,
    MissingDescriptor,
    NotSynced,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RejectReason::AlreadyInPool => "already in pool",
            RejectReason::MissingType => "missing or unknown type",
            RejectReason::MissingDescriptor => "missing id or host",
            RejectReason::NotSynced => "not synchronized",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_error_wraps_into_pool_error() {
        let err: PoolError = AttachError::NotFound("n1".to_string()).into();
        assert!(matches!(err, PoolError::Attach(AttachError::NotFound(_))));
        assert_eq!(err.to_string(), "Node 'n1' not found in store");
    }

    #[test]
    fn test_store_error_is_distinct_from_no_match() {
        let err: PoolError = StoreError::Unavailable("disk gone".to_string()).into();
        assert!(matches!(err, PoolError::Store(_)));
        assert!(err.to_string().starts_with("Store unavailable"));
    }

    #[test]
    fn test_reject_reason_serializes_kebab_case() {
        let json = serde_json::to_string(&RejectReason::AlreadyInPool).unwrap();
        assert_eq!(json, "\"already-in-pool\"");
        assert_eq!(RejectReason::NotSynced.to_string(), "not synchronized");
    }
}
