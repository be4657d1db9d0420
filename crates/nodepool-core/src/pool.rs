//! Generic failover node pool with backoff, readmission and topology
//! reconciliation.
//!
//! Locking: the node list, the healthy subset and the key index sit behind
//! one pool-level `RwLock`; every node keeps its backoff state behind its
//! own lock. The pool never holds its lock while taking a node's write lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::address::EndpointAddress;
use crate::clock::{deadline_after, SharedClock, SystemClock};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::node::{ManagedNode, NodeOptions};

/// Desired topology: dialable `host:port` → node key.
///
/// One key may be served by several addresses.
pub type Topology = HashMap<String, String>;

/// Health overview of one pooled node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    pub key: String,
    pub address: String,
    pub healthy: bool,
    pub current_backoff: Duration,
    pub wait: Duration,
    pub attempts: u64,
    pub use_count: u64,
}

struct PoolState<N> {
    nodes: Vec<Arc<N>>,
    healthy: Vec<Arc<N>>,
    by_key: HashMap<String, Vec<Arc<N>>>,
    earliest_readmit: Option<Instant>,
    config: PoolConfig,
}

impl<N: ManagedNode> PoolState<N> {
    /// Replace the node list and derive the index and healthy subset from it.
    fn install(&mut self, nodes: Vec<Arc<N>>) {
        let mut by_key: HashMap<String, Vec<Arc<N>>> = HashMap::new();
        for node in &nodes {
            by_key
                .entry(node.key().to_string())
                .or_default()
                .push(node.clone());
        }
        let max_attempts = self.config.max_node_attempts;
        self.healthy = nodes
            .iter()
            .filter(|&n| n.is_healthy() && !is_dead(n.as_ref(), max_attempts))
            .cloned()
            .collect();
        self.by_key = by_key;
        self.nodes = nodes;
    }

    fn is_healthy_member(&self, node: &N) -> bool {
        self.healthy.iter().any(|h| same_node(h.as_ref(), node))
    }
}

/// Two handles refer to the same logical node if they share backoff state;
/// this survives TLS/plaintext conversion.
fn same_node<N: ManagedNode>(a: &N, b: &N) -> bool {
    a.health().shares_state_with(b.health())
}

fn is_dead<N: ManagedNode>(node: &N, max_attempts: Option<u64>) -> bool {
    max_attempts.is_some_and(|max| node.attempts() >= max)
}

/// Thread-safe pool of interchangeable endpoints.
///
/// Selection is uniform over the healthy subset. Nodes leave the healthy
/// subset when [`NodePool::increase_backoff`] is reported for them and come
/// back through a lazy, self-throttled readmission pass.
pub struct NodePool<N: ManagedNode> {
    state: RwLock<PoolState<N>>,
    rng: Mutex<Box<dyn RngCore + Send>>,
    clock: SharedClock,
}

impl<N: ManagedNode> NodePool<N> {
    /// Create an empty pool.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        Ok(Self {
            state: RwLock::new(PoolState {
                nodes: Vec::new(),
                healthy: Vec::new(),
                by_key: HashMap::new(),
                earliest_readmit: None,
                config,
            }),
            rng: Mutex::new(Box::new(StdRng::from_entropy())),
            clock: Arc::new(SystemClock),
        })
    }

    /// Use `clock` for every backoff and readmission decision.
    ///
    /// Nodes created afterwards inherit it; call before the first
    /// [`set_topology`](Self::set_topology).
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Use `rng` for node selection.
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Mutex::new(Box::new(rng));
        self
    }

    fn node_options(&self, config: &PoolConfig) -> NodeOptions {
        NodeOptions {
            min_backoff: config.min_backoff,
            max_backoff: config.max_backoff,
            verify_certificate: config.verify_certificate,
            clock: self.clock.clone(),
        }
    }

    /// Reconcile the pool with `desired`.
    ///
    /// Nodes whose `(key, address)` pair is still wanted are kept with their
    /// backoff history; the rest are closed and dropped; new pairs get fresh
    /// nodes. Addresses are parsed before anything is touched, so a bad
    /// address leaves the pool as it was. A close failure aborts the
    /// reconciliation (nodes already closed stay closed).
    pub fn set_topology(&self, desired: &Topology) -> Result<(), PoolError> {
        let mut parsed = desired
            .iter()
            .map(|(address, key)| Ok((key.clone(), EndpointAddress::parse(address)?)))
            .collect::<Result<Vec<_>, PoolError>>()?;
        parsed.sort_by(|a, b| (&a.0, a.1.to_string()).cmp(&(&b.0, b.1.to_string())));

        let mut state = self.state.write().unwrap();
        let secure = state.config.transport_security;
        let wanted: Vec<(String, EndpointAddress)> = parsed
            .into_iter()
            .map(|(key, address)| {
                let address = if secure {
                    address.to_secure()
                } else {
                    address.to_insecure()
                };
                (key, address)
            })
            .collect();

        let is_wanted = |node: &N| {
            wanted
                .iter()
                .any(|(key, address)| node.key() == key && node.address() == address)
        };

        let mut nodes = Vec::with_capacity(wanted.len());
        for node in &state.nodes {
            if is_wanted(node.as_ref()) {
                nodes.push(node.clone());
                continue;
            }
            if let Err(e) = node.close() {
                tracing::warn!(key = %node.key(), address = %node.address(), error = %e, "failed to close removed node");
                return Err(e);
            }
            tracing::debug!(key = %node.key(), address = %node.address(), "node removed from pool");
        }

        let options = self.node_options(&state.config);
        let mut added = 0usize;
        for (key, address) in wanted {
            let held = nodes
                .iter()
                .any(|n| n.key() == key && *n.address() == address);
            if !held {
                tracing::debug!(key = %key, address = %address, "node added to pool");
                nodes.push(Arc::new(N::create(key, address, &options)));
                added += 1;
            }
        }

        state.install(nodes);
        tracing::debug!(
            nodes = state.nodes.len(),
            healthy = state.healthy.len(),
            added,
            "topology reconciled"
        );
        Ok(())
    }

    /// Pick a healthy node uniformly at random.
    pub fn get_node(&self) -> Result<Arc<N>, PoolError> {
        self.readmit_nodes();
        let state = self.state.read().unwrap();
        if state.healthy.is_empty() {
            return Err(PoolError::NoHealthyNodes);
        }
        let idx = self.rng.lock().unwrap().gen_range(0..state.healthy.len());
        Ok(state.healthy[idx].clone())
    }

    /// Pick a healthy node serving `key`.
    pub fn get_node_for_key(&self, key: &str) -> Result<Arc<N>, PoolError> {
        self.readmit_nodes();
        let state = self.state.read().unwrap();
        let candidates = state
            .by_key
            .get(key)
            .ok_or_else(|| PoolError::UnknownNode { key: key.to_string() })?;
        let healthy: Vec<&Arc<N>> = candidates
            .iter()
            .filter(|&n| state.is_healthy_member(n.as_ref()))
            .collect();
        if healthy.is_empty() {
            return Err(PoolError::NoHealthyNodes);
        }
        let idx = self.rng.lock().unwrap().gen_range(0..healthy.len());
        Ok(healthy[idx].clone())
    }

    /// Up to `count` distinct healthy nodes, in random order.
    pub fn select_nodes(&self, count: usize) -> Result<Vec<Arc<N>>, PoolError> {
        self.remove_dead_nodes()?;
        self.readmit_nodes();
        let state = self.state.read().unwrap();
        if state.healthy.is_empty() {
            return Err(PoolError::NoHealthyNodes);
        }
        let amount = count.min(state.healthy.len());
        let mut rng = self.rng.lock().unwrap();
        Ok(rand::seq::index::sample(&mut **rng, state.healthy.len(), amount)
            .into_iter()
            .map(|i| state.healthy[i].clone())
            .collect())
    }

    /// Report a failed use of `node`: back it off and drop it from the
    /// healthy subset right away.
    pub fn increase_backoff(&self, node: &Arc<N>) {
        let backoff = node.increase_backoff();
        let readmit = node.readmit_time();
        tracing::warn!(
            key = %node.key(),
            address = %node.address(),
            backoff_ms = backoff.as_millis() as u64,
            attempts = node.attempts(),
            "node backing off"
        );

        let mut state = self.state.write().unwrap();
        state.healthy.retain(|h| !same_node(h.as_ref(), node.as_ref()));
        // Make sure the next sweep is not scheduled after this node is due.
        if let Some(readmit) = readmit {
            state.earliest_readmit = Some(
                state
                    .earliest_readmit
                    .map_or(readmit, |earliest| earliest.min(readmit)),
            );
        }
    }

    /// Report a successful use of `node`.
    pub fn decrease_backoff(&self, node: &Arc<N>) {
        let backoff = node.decrease_backoff();
        tracing::trace!(key = %node.key(), backoff_ms = backoff.as_millis() as u64, "node backoff decreased");
    }

    /// Move nodes whose backoff has expired back into the healthy subset.
    ///
    /// Runs at most once per readmission period: each sweep schedules the
    /// next one at the earliest pending readmit time, clamped to
    /// `[min_node_readmit_period, max_node_readmit_period]` from now.
    pub fn readmit_nodes(&self) {
        let now = self.clock.now();
        if self
            .state
            .read()
            .unwrap()
            .earliest_readmit
            .is_some_and(|earliest| now < earliest)
        {
            return;
        }

        let mut state = self.state.write().unwrap();
        if state.earliest_readmit.is_some_and(|earliest| now < earliest) {
            return;
        }

        let lower = deadline_after(now, state.config.min_node_readmit_period);
        let upper = deadline_after(now, state.config.max_node_readmit_period);
        let next = state
            .nodes
            .iter()
            .filter_map(|n| n.readmit_time())
            .filter(|&t| t > now)
            .min()
            .unwrap_or(upper);
        // Both bounds may saturate to the same far-future instant.
        state.earliest_readmit = Some(next.min(upper).max(lower));

        let max_attempts = state.config.max_node_attempts;
        let readmitted: Vec<Arc<N>> = state
            .nodes
            .iter()
            .filter(|n| n.readmit_time().map_or(true, |t| t <= now))
            .filter(|&n| !is_dead(n.as_ref(), max_attempts))
            .filter(|&n| !state.is_healthy_member(n.as_ref()))
            .cloned()
            .collect();
        for node in readmitted {
            tracing::debug!(key = %node.key(), address = %node.address(), "node readmitted");
            state.healthy.push(node);
        }
    }

    /// Close and drop nodes that reached `max_node_attempts` failures.
    pub fn remove_dead_nodes(&self) -> Result<(), PoolError> {
        let mut state = self.state.write().unwrap();
        let Some(max_attempts) = state.config.max_node_attempts else {
            return Ok(());
        };
        if !state.nodes.iter().any(|n| is_dead(n.as_ref(), Some(max_attempts))) {
            return Ok(());
        }

        let mut nodes = Vec::with_capacity(state.nodes.len());
        for node in &state.nodes {
            if !is_dead(node.as_ref(), Some(max_attempts)) {
                nodes.push(node.clone());
                continue;
            }
            node.close()?;
            tracing::info!(key = %node.key(), address = %node.address(), attempts = node.attempts(), "dead node removed");
        }
        state.install(nodes);
        Ok(())
    }

    /// How many nodes a single transaction should be sent to.
    ///
    /// `min(max_nodes_per_transaction, n)` when capped, otherwise a third of
    /// the `n` distinct node keys, rounded up.
    pub fn number_of_nodes_for_transaction(&self) -> usize {
        self.readmit_nodes();
        let state = self.state.read().unwrap();
        let network = state.by_key.len();
        match state.config.max_nodes_per_transaction {
            Some(max) => max.min(network),
            None => (network + 2) / 3,
        }
    }

    /// Switch every node between TLS and plaintext ports.
    ///
    /// No-op when already in the requested mode. Otherwise all nodes are
    /// closed (first failure aborts) and replaced by converted nodes that
    /// keep their backoff state.
    pub fn set_transport_security(&self, enabled: bool) -> Result<(), PoolError> {
        let mut state = self.state.write().unwrap();
        if state.config.transport_security == enabled {
            return Ok(());
        }

        for node in &state.nodes {
            node.close()?;
        }
        let converted = state
            .nodes
            .iter()
            .map(|n| {
                Arc::new(if enabled {
                    n.to_secure()
                } else {
                    n.to_insecure()
                })
            })
            .collect();
        state.config.transport_security = enabled;
        state.install(converted);
        tracing::info!(enabled, nodes = state.nodes.len(), "transport security changed");
        Ok(())
    }

    /// Returns `true` if nodes are dialed on their TLS ports.
    pub fn transport_security(&self) -> bool {
        self.state.read().unwrap().config.transport_security
    }

    /// Set whether TLS certificates are verified, for new nodes and every
    /// node currently held.
    pub fn set_verify_certificate(&self, enabled: bool) {
        let mut state = self.state.write().unwrap();
        state.config.verify_certificate = enabled;
        for node in &state.nodes {
            node.set_verify_certificate(enabled);
        }
    }

    /// Current certificate verification setting.
    pub fn verify_certificate(&self) -> bool {
        self.state.read().unwrap().config.verify_certificate
    }

    /// Set the backoff floor for new nodes and for currently healthy ones.
    /// Nodes already backing off keep their schedule.
    pub fn set_min_backoff(&self, min_backoff: Duration) -> Result<(), PoolError> {
        let healthy = {
            let mut state = self.state.write().unwrap();
            if min_backoff > state.config.max_backoff {
                return Err(PoolError::InvalidConfig(format!(
                    "min_backoff ({min_backoff:?}) exceeds max_backoff ({:?})",
                    state.config.max_backoff
                )));
            }
            state.config.min_backoff = min_backoff;
            state.healthy.clone()
        };
        for node in healthy {
            node.set_min_backoff(min_backoff);
        }
        Ok(())
    }

    /// Set the backoff ceiling for new nodes and for currently healthy ones.
    pub fn set_max_backoff(&self, max_backoff: Duration) -> Result<(), PoolError> {
        let healthy = {
            let mut state = self.state.write().unwrap();
            if max_backoff < state.config.min_backoff {
                return Err(PoolError::InvalidConfig(format!(
                    "max_backoff ({max_backoff:?}) is below min_backoff ({:?})",
                    state.config.min_backoff
                )));
            }
            state.config.max_backoff = max_backoff;
            state.healthy.clone()
        };
        for node in healthy {
            node.set_max_backoff(max_backoff);
        }
        Ok(())
    }

    /// Set the shortest gap between two readmission passes.
    ///
    /// Rejects a period above `max_node_readmit_period`.
    pub fn set_min_node_readmit_period(&self, period: Duration) -> Result<(), PoolError> {
        let mut state = self.state.write().unwrap();
        if period > state.config.max_node_readmit_period {
            return Err(PoolError::InvalidConfig(format!(
                "min_node_readmit_period ({period:?}) exceeds max_node_readmit_period ({:?})",
                state.config.max_node_readmit_period
            )));
        }
        state.config.min_node_readmit_period = period;
        Ok(())
    }

    /// Set the longest gap between two readmission passes.
    ///
    /// Rejects a period below `min_node_readmit_period`. `Duration::MAX`
    /// is accepted and saturates to a far-future sweep.
    pub fn set_max_node_readmit_period(&self, period: Duration) -> Result<(), PoolError> {
        let mut state = self.state.write().unwrap();
        if period < state.config.min_node_readmit_period {
            return Err(PoolError::InvalidConfig(format!(
                "max_node_readmit_period ({period:?}) is below min_node_readmit_period ({:?})",
                state.config.min_node_readmit_period
            )));
        }
        state.config.max_node_readmit_period = period;
        Ok(())
    }

    /// Cap the number of nodes a transaction is sent to; `None` removes
    /// the cap.
    pub fn set_max_nodes_per_transaction(&self, max: Option<usize>) -> Result<(), PoolError> {
        if max == Some(0) {
            return Err(PoolError::InvalidConfig(
                "max_nodes_per_transaction must be at least 1".into(),
            ));
        }
        self.state.write().unwrap().config.max_nodes_per_transaction = max;
        Ok(())
    }

    /// Failures after which a node is treated as dead; `None` disables
    /// dead-node removal.
    pub fn set_max_node_attempts(&self, max: Option<u64>) {
        self.state.write().unwrap().config.max_node_attempts = max;
    }

    /// Set the ledger this pool's network belongs to.
    pub fn set_ledger_id(&self, ledger_id: Option<String>) {
        self.state.write().unwrap().config.ledger_id = ledger_id;
    }

    /// The ledger this pool's network belongs to, if set.
    pub fn ledger_id(&self) -> Option<String> {
        self.state.read().unwrap().config.ledger_id.clone()
    }

    /// Current configuration, including runtime changes.
    pub fn config(&self) -> PoolConfig {
        self.state.read().unwrap().config.clone()
    }

    /// All nodes, in pool order.
    pub fn nodes(&self) -> Vec<Arc<N>> {
        self.state.read().unwrap().nodes.clone()
    }

    /// The cached healthy subset, as of the last readmission pass.
    pub fn healthy_nodes(&self) -> Vec<Arc<N>> {
        self.state.read().unwrap().healthy.clone()
    }

    /// Every node serving `key`, healthy or not.
    pub fn nodes_for_key(&self, key: &str) -> Result<Vec<Arc<N>>, PoolError> {
        self.state
            .read()
            .unwrap()
            .by_key
            .get(key)
            .cloned()
            .ok_or_else(|| PoolError::UnknownNode { key: key.to_string() })
    }

    /// Number of nodes in the pool, healthy or not.
    pub fn len(&self) -> usize {
        self.state.read().unwrap().nodes.len()
    }

    /// Returns `true` if the pool holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of nodes in the healthy subset.
    pub fn healthy_len(&self) -> usize {
        self.state.read().unwrap().healthy.len()
    }

    /// Per-node health overview.
    pub fn health_summary(&self) -> Vec<NodeSummary> {
        let state = self.state.read().unwrap();
        state
            .nodes
            .iter()
            .map(|n| {
                let snap = n.health().snapshot();
                NodeSummary {
                    key: n.key().to_string(),
                    address: n.address().to_string(),
                    healthy: state.is_healthy_member(n.as_ref()),
                    current_backoff: snap.current_backoff,
                    wait: n.wait(),
                    attempts: snap.bad_status_count,
                    use_count: snap.use_count,
                }
            })
            .collect()
    }

    /// Close every node. Stops at, and returns, the first failure.
    pub fn close(&self) -> Result<(), PoolError> {
        let nodes = self.nodes();
        for node in &nodes {
            if let Err(e) = node.close() {
                tracing::warn!(key = %node.key(), error = %e, "failed to close node");
                return Err(e);
            }
        }
        tracing::debug!(nodes = nodes.len(), "pool closed");
        Ok(())
    }
}

impl<N: ManagedNode> fmt::Debug for NodePool<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read().unwrap();
        f.debug_struct("NodePool")
            .field("nodes", &state.nodes.len())
            .field("healthy", &state.healthy.len())
            .field("config", &state.config)
            .finish()
    }
}
