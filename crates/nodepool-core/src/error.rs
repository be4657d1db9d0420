//! Pool-level error types.

use thiserror::Error;

/// Errors that can occur while managing a node pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Endpoint string is not of the form `host:port`.
    #[error("invalid endpoint address: {input:?}")]
    InvalidAddress { input: String },

    /// Every node in the pool is backing off (or the pool is empty).
    #[error("no healthy nodes available")]
    NoHealthyNodes,

    /// A node failed to release its transport resources.
    #[error("failed to close node {key}: {reason}")]
    Close { key: String, reason: String },

    /// Configuration rejected (e.g. min backoff above max backoff).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No node with the given key is held by the pool.
    #[error("unknown node: {key}")]
    UnknownNode { key: String },

    /// The node was closed and can no longer hand out channels.
    #[error("node {key} is closed")]
    NodeClosed { key: String },

    /// An RPC channel could not be constructed.
    #[error("channel error: {0}")]
    Channel(String),
}

impl PoolError {
    /// Returns `true` if the condition can clear up on its own, i.e. waiting
    /// for a readmission pass may help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoHealthyNodes)
    }

    /// Returns `true` if this error was caused by bad input or configuration.
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::InvalidAddress { .. } | Self::InvalidConfig(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_is_retryable() {
        assert!(PoolError::NoHealthyNodes.is_retryable());
        assert!(!PoolError::InvalidConfig("x".into()).is_retryable());
    }

    #[test]
    fn display_includes_key() {
        let err = PoolError::Close {
            key: "0.0.3".into(),
            reason: "broken pipe".into(),
        };
        assert_eq!(err.to_string(), "failed to close node 0.0.3: broken pipe");
    }
}
