//! Pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// Configuration for a [`NodePool`](crate::pool::NodePool).
///
/// Durations are (de)serialized as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Backoff applied after the first failure is twice this.
    #[serde(with = "millis")]
    pub min_backoff: Duration,
    /// Upper bound on a node's backoff.
    #[serde(with = "millis")]
    pub max_backoff: Duration,
    /// Shortest interval between two readmission sweeps.
    #[serde(with = "millis")]
    pub min_node_readmit_period: Duration,
    /// Longest interval between two readmission sweeps.
    #[serde(with = "millis")]
    pub max_node_readmit_period: Duration,
    /// Cap on nodes used per transaction. `None` means a third of the network.
    pub max_nodes_per_transaction: Option<usize>,
    /// Nodes that failed this many times are never readmitted.
    pub max_node_attempts: Option<u64>,
    /// Dial TLS ports instead of plaintext ones.
    pub transport_security: bool,
    /// Verify server certificates on TLS channels.
    pub verify_certificate: bool,
    /// Ledger the pool's nodes belong to.
    pub ledger_id: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(8),
            max_backoff: Duration::from_secs(60 * 60),
            min_node_readmit_period: Duration::from_secs(8),
            max_node_readmit_period: Duration::from_secs(60 * 60),
            max_nodes_per_transaction: None,
            max_node_attempts: None,
            transport_security: false,
            verify_certificate: true,
            ledger_id: None,
        }
    }
}

impl PoolConfig {
    /// Reject inverted bounds.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.min_backoff > self.max_backoff {
            return Err(PoolError::InvalidConfig(format!(
                "min_backoff ({:?}) exceeds max_backoff ({:?})",
                self.min_backoff, self.max_backoff
            )));
        }
        if self.min_node_readmit_period > self.max_node_readmit_period {
            return Err(PoolError::InvalidConfig(format!(
                "min_node_readmit_period ({:?}) exceeds max_node_readmit_period ({:?})",
                self.min_node_readmit_period, self.max_node_readmit_period
            )));
        }
        if self.max_nodes_per_transaction == Some(0) {
            return Err(PoolError::InvalidConfig(
                "max_nodes_per_transaction must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(PoolConfig::default().validate().is_ok());
    }

    #[test]
    fn inverted_backoff_rejected() {
        let cfg = PoolConfig {
            min_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(PoolError::InvalidConfig(_))));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: PoolConfig =
            serde_json::from_str(r#"{"min_backoff": 250, "max_nodes_per_transaction": 2}"#)
                .unwrap();
        assert_eq!(cfg.min_backoff, Duration::from_millis(250));
        assert_eq!(cfg.max_backoff, Duration::from_secs(3600));
        assert_eq!(cfg.max_nodes_per_transaction, Some(2));
        assert!(cfg.verify_certificate);
    }

    #[test]
    fn serializes_millis() {
        let json = serde_json::to_value(PoolConfig::default()).unwrap();
        assert_eq!(json["min_backoff"], 8_000);
        assert_eq!(json["max_node_readmit_period"], 3_600_000);
    }
}
