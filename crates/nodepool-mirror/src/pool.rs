//! Pool of mirror nodes with per-node channel caching.

use std::sync::Arc;

use rand::RngCore;

use nodepool_core::{
    ManagedNode, NodePool, NodeSummary, PoolConfig, PoolError, SharedClock, Topology,
};

use crate::channel::{ChannelPurpose, MirrorChannel};
use crate::node::MirrorNode;

/// Mirror node pool.
///
/// Mirror nodes have no separate logical identity, so each node is keyed by
/// the address it was configured with.
pub struct MirrorPool {
    pool: NodePool<MirrorNode>,
}

impl MirrorPool {
    /// Defaults suited to public mirror nodes, which are served over TLS.
    pub fn default_config() -> PoolConfig {
        PoolConfig {
            transport_security: true,
            ..PoolConfig::default()
        }
    }

    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        Ok(Self {
            pool: NodePool::new(config)?,
        })
    }

    pub fn with_clock(self, clock: SharedClock) -> Self {
        Self {
            pool: self.pool.with_clock(clock),
        }
    }

    pub fn with_rng(self, rng: impl RngCore + Send + 'static) -> Self {
        Self {
            pool: self.pool.with_rng(rng),
        }
    }

    /// Replace the set of mirror addresses.
    pub fn set_network<S: AsRef<str>>(&self, addresses: &[S]) -> Result<(), PoolError> {
        let topology: Topology = addresses
            .iter()
            .map(|a| (a.as_ref().to_string(), a.as_ref().to_string()))
            .collect();
        self.pool.set_topology(&topology)
    }

    /// Current mirror addresses, transport conversion applied.
    pub fn network(&self) -> Vec<String> {
        self.pool
            .nodes()
            .iter()
            .map(|n| n.address().to_string())
            .collect()
    }

    pub fn get_node(&self) -> Result<Arc<MirrorNode>, PoolError> {
        self.pool.get_node()
    }

    /// Pick a healthy mirror node and hand out its channel for `purpose`.
    pub fn channel(
        &self,
        purpose: ChannelPurpose,
    ) -> Result<(Arc<MirrorNode>, Arc<MirrorChannel>), PoolError> {
        let node = self.pool.get_node()?;
        let channel = node.channel(purpose)?;
        Ok((node, channel))
    }

    pub fn increase_backoff(&self, node: &Arc<MirrorNode>) {
        self.pool.increase_backoff(node)
    }

    pub fn decrease_backoff(&self, node: &Arc<MirrorNode>) {
        self.pool.decrease_backoff(node)
    }

    pub fn set_transport_security(&self, enabled: bool) -> Result<(), PoolError> {
        self.pool.set_transport_security(enabled)
    }

    pub fn set_verify_certificate(&self, enabled: bool) {
        self.pool.set_verify_certificate(enabled)
    }

    pub fn health_summary(&self) -> Vec<NodeSummary> {
        self.pool.health_summary()
    }

    /// The underlying generic pool, for settings not mirrored here.
    pub fn pool(&self) -> &NodePool<MirrorNode> {
        &self.pool
    }

    /// Close every mirror node and its channels.
    pub fn close(&self) -> Result<(), PoolError> {
        self.pool.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodepool_core::ManualClock;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;

    const MIRRORS: [&str; 3] = [
        "mirror-a.example.com:443",
        "mirror-b.example.com:443",
        "mirror-c.example.com:443",
    ];

    fn pool() -> (MirrorPool, ManualClock) {
        let clock = ManualClock::new();
        let pool = MirrorPool::new(MirrorPool::default_config())
            .unwrap()
            .with_clock(Arc::new(clock.clone()))
            .with_rng(StdRng::seed_from_u64(1));
        pool.set_network(&MIRRORS).unwrap();
        (pool, clock)
    }

    #[test]
    fn set_network_keys_by_address() {
        let (pool, _) = pool();
        let mut network = pool.network();
        network.sort();
        assert_eq!(network, MIRRORS);
        assert!(pool.pool().nodes().iter().all(|n| n.key() == n.address().to_string()));
    }

    #[test]
    fn channel_is_cached_per_node() {
        let (pool, _) = pool();
        let (node, first) = pool.channel(ChannelPurpose::Streaming).unwrap();
        assert!(first.is_secure());
        let again = node.channel(ChannelPurpose::Streaming).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn failed_mirror_is_skipped() {
        let (pool, clock) = pool();
        let bad = pool.get_node().unwrap();
        pool.increase_backoff(&bad);
        for _ in 0..30 {
            let (node, _) = pool.channel(ChannelPurpose::Metadata).unwrap();
            assert_ne!(node.key(), bad.key());
        }
        clock.advance(Duration::from_secs(16));
        pool.pool().readmit_nodes();
        assert_eq!(pool.pool().healthy_len(), 3);
    }

    #[test]
    fn plaintext_switch_rebuilds_channels() {
        let (pool, _) = pool();
        let (node, _) = pool.channel(ChannelPurpose::Metadata).unwrap();
        pool.set_transport_security(false).unwrap();
        assert!(node.is_closed());
        assert!(pool.network().iter().all(|a| a.ends_with(":5600")));

        let (fresh, channel) = pool.channel(ChannelPurpose::Metadata).unwrap();
        assert!(!fresh.is_closed());
        assert!(!channel.is_secure());
        assert!(channel.endpoint().starts_with("http://"));
    }

    #[test]
    fn removed_mirror_is_closed() {
        let (pool, _) = pool();
        let nodes = pool.pool().nodes();
        let dropped = nodes
            .iter()
            .find(|n| n.key() == MIRRORS[2])
            .unwrap()
            .clone();
        pool.set_network(&MIRRORS[..2]).unwrap();
        assert!(dropped.is_closed());
        assert_eq!(pool.network().len(), 2);
    }

    #[test]
    fn close_closes_every_node() {
        let (pool, _) = pool();
        pool.channel(ChannelPurpose::Streaming).unwrap();
        pool.close().unwrap();
        assert!(pool.pool().nodes().iter().all(|n| n.is_closed()));
        assert!(matches!(
            pool.channel(ChannelPurpose::Streaming),
            Err(PoolError::NodeClosed { .. })
        ));
    }
}
