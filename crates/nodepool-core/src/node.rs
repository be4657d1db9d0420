//! Per-node backoff state machine and the `ManagedNode` capability trait.
//!
//! State transitions:
//! - `healthy` → `backing-off`: [`NodeHealth::increase_backoff`] pushes the
//!   readmit time `current_backoff` into the future
//! - `backing-off` → `healthy`: the readmit time passes and the owning pool
//!   runs a readmission pass
//!
//! [`NodeHealth::decrease_backoff`] never changes the state, it only
//! shortens the next backoff period.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::address::EndpointAddress;
use crate::clock::{deadline_after, SharedClock, SystemClock};
use crate::error::PoolError;

/// Settings handed to every node the pool constructs.
#[derive(Clone)]
pub struct NodeOptions {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub verify_certificate: bool,
    pub clock: SharedClock,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(8),
            max_backoff: Duration::from_secs(60 * 60),
            verify_certificate: true,
            clock: Arc::new(SystemClock),
        }
    }
}

impl fmt::Debug for NodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeOptions")
            .field("min_backoff", &self.min_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("verify_certificate", &self.verify_certificate)
            .finish_non_exhaustive()
    }
}

struct BackoffState {
    current_backoff: Duration,
    min_backoff: Duration,
    max_backoff: Duration,
    readmit_time: Option<Instant>,
    use_count: u64,
    last_used: Option<Instant>,
    bad_status_count: u64,
}

/// Point-in-time copy of a node's backoff and usage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffSnapshot {
    pub current_backoff: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub readmit_time: Option<Instant>,
    pub use_count: u64,
    pub last_used: Option<Instant>,
    pub bad_status_count: u64,
}

/// Thread-safe backoff/usage state for one endpoint.
///
/// Cloning yields a handle to the *same* state, which is how a node keeps
/// its history across a TLS/plaintext conversion.
#[derive(Clone)]
pub struct NodeHealth {
    state: Arc<RwLock<BackoffState>>,
    clock: SharedClock,
}

impl NodeHealth {
    /// Fresh state with `current_backoff == min_backoff` and no readmit time.
    pub fn new(min_backoff: Duration, max_backoff: Duration, clock: SharedClock) -> Self {
        let max_backoff = max_backoff.max(min_backoff);
        Self {
            state: Arc::new(RwLock::new(BackoffState {
                current_backoff: min_backoff,
                min_backoff,
                max_backoff,
                readmit_time: None,
                use_count: 0,
                last_used: None,
                bad_status_count: 0,
            })),
            clock,
        }
    }

    pub fn from_options(options: &NodeOptions) -> Self {
        Self::new(options.min_backoff, options.max_backoff, options.clock.clone())
    }

    /// Record a failed use. Doubles the backoff (capped at the maximum) and
    /// schedules readmission `current_backoff` from now.
    ///
    /// Returns the new backoff.
    pub fn increase_backoff(&self) -> Duration {
        let now = self.clock.now();
        let mut state = self.state.write().unwrap();
        state.bad_status_count += 1;
        state.current_backoff = state
            .current_backoff
            .saturating_mul(2)
            .min(state.max_backoff);
        state.readmit_time = Some(deadline_after(now, state.current_backoff));
        state.current_backoff
    }

    /// Record a successful use. Halves the backoff, floored at the minimum.
    pub fn decrease_backoff(&self) -> Duration {
        let mut state = self.state.write().unwrap();
        state.current_backoff = (state.current_backoff / 2).max(state.min_backoff);
        state.current_backoff
    }

    /// `true` unless a readmit time is set and still in the future.
    pub fn is_healthy(&self) -> bool {
        let now = self.clock.now();
        match self.state.read().unwrap().readmit_time {
            Some(readmit) => readmit <= now,
            None => true,
        }
    }

    pub fn readmit_time(&self) -> Option<Instant> {
        self.state.read().unwrap().readmit_time
    }

    /// Time left until the readmit time, zero if already passed.
    pub fn wait(&self) -> Duration {
        let now = self.clock.now();
        self.state
            .read()
            .unwrap()
            .readmit_time
            .map_or(Duration::ZERO, |readmit| readmit.saturating_duration_since(now))
    }

    pub fn mark_in_use(&self) {
        let now = self.clock.now();
        let mut state = self.state.write().unwrap();
        state.use_count += 1;
        state.last_used = Some(now);
    }

    /// Set the backoff floor. A backoff sitting on the old floor follows it.
    pub fn set_min_backoff(&self, min_backoff: Duration) {
        let mut state = self.state.write().unwrap();
        if state.current_backoff == state.min_backoff {
            state.current_backoff = min_backoff;
        }
        state.min_backoff = min_backoff;
        state.max_backoff = state.max_backoff.max(min_backoff);
        state.current_backoff = state
            .current_backoff
            .clamp(state.min_backoff, state.max_backoff);
    }

    /// Set the backoff ceiling. A backoff sitting on the old floor follows
    /// the floor if the ceiling drags it down.
    pub fn set_max_backoff(&self, max_backoff: Duration) {
        let mut state = self.state.write().unwrap();
        state.max_backoff = max_backoff;
        state.min_backoff = state.min_backoff.min(max_backoff);
        state.current_backoff = state
            .current_backoff
            .clamp(state.min_backoff, state.max_backoff);
    }

    pub fn current_backoff(&self) -> Duration {
        self.state.read().unwrap().current_backoff
    }

    pub fn bad_status_count(&self) -> u64 {
        self.state.read().unwrap().bad_status_count
    }

    pub fn use_count(&self) -> u64 {
        self.state.read().unwrap().use_count
    }

    pub fn snapshot(&self) -> BackoffSnapshot {
        let state = self.state.read().unwrap();
        BackoffSnapshot {
            current_backoff: state.current_backoff,
            min_backoff: state.min_backoff,
            max_backoff: state.max_backoff,
            readmit_time: state.readmit_time,
            use_count: state.use_count,
            last_used: state.last_used,
            bad_status_count: state.bad_status_count,
        }
    }

    /// Returns `true` if both handles point at the same underlying state.
    pub fn shares_state_with(&self, other: &NodeHealth) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl fmt::Debug for NodeHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHealth")
            .field("state", &self.snapshot())
            .finish()
    }
}

/// The capability set every pooled node provides.
///
/// Implementors supply identity, transport conversion and resource release;
/// backoff bookkeeping is shared through [`NodeHealth`] and exposed by the
/// provided methods.
pub trait ManagedNode: Send + Sync + Sized + 'static {
    /// Construct a node in its default backoff state.
    fn create(key: String, address: EndpointAddress, options: &NodeOptions) -> Self;

    /// Stable logical identity (e.g. the account a consensus node serves).
    fn key(&self) -> &str;

    fn address(&self) -> &EndpointAddress;

    fn health(&self) -> &NodeHealth;

    /// Same node, TLS address, shared backoff state.
    fn to_secure(&self) -> Self;

    /// Same node, plaintext address, shared backoff state.
    fn to_insecure(&self) -> Self;

    fn set_verify_certificate(&self, verify: bool);

    fn verify_certificate(&self) -> bool;

    /// Release any transport resources held by the node.
    fn close(&self) -> Result<(), PoolError>;

    fn increase_backoff(&self) -> Duration {
        self.health().increase_backoff()
    }

    fn decrease_backoff(&self) -> Duration {
        self.health().decrease_backoff()
    }

    fn is_healthy(&self) -> bool {
        self.health().is_healthy()
    }

    fn mark_in_use(&self) {
        self.health().mark_in_use()
    }

    fn set_min_backoff(&self, min_backoff: Duration) {
        self.health().set_min_backoff(min_backoff)
    }

    fn set_max_backoff(&self, max_backoff: Duration) {
        self.health().set_max_backoff(max_backoff)
    }

    fn readmit_time(&self) -> Option<Instant> {
        self.health().readmit_time()
    }

    /// Remaining backoff before this node may be used again.
    fn wait(&self) -> Duration {
        self.health().wait()
    }

    fn attempts(&self) -> u64 {
        self.health().bad_status_count()
    }
}

/// A primary (consensus) node. Holds no transport of its own.
pub struct Node {
    key: String,
    address: EndpointAddress,
    health: NodeHealth,
    verify_certificate: AtomicBool,
}

impl Node {
    fn converted(&self, address: EndpointAddress) -> Self {
        Self {
            key: self.key.clone(),
            address,
            health: self.health.clone(),
            verify_certificate: AtomicBool::new(self.verify_certificate()),
        }
    }
}

impl ManagedNode for Node {
    fn create(key: String, address: EndpointAddress, options: &NodeOptions) -> Self {
        Self {
            key,
            address,
            health: NodeHealth::from_options(options),
            verify_certificate: AtomicBool::new(options.verify_certificate),
        }
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn address(&self) -> &EndpointAddress {
        &self.address
    }

    fn health(&self) -> &NodeHealth {
        &self.health
    }

    fn to_secure(&self) -> Self {
        self.converted(self.address.to_secure())
    }

    fn to_insecure(&self) -> Self {
        self.converted(self.address.to_insecure())
    }

    fn set_verify_certificate(&self, verify: bool) {
        self.verify_certificate.store(verify, Ordering::Relaxed);
    }

    fn verify_certificate(&self) -> bool {
        self.verify_certificate.load(Ordering::Relaxed)
    }

    fn close(&self) -> Result<(), PoolError> {
        Ok(())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.key)
            .field("address", &self.address.to_string())
            .field("health", &self.health)
            .finish()
    }
}
