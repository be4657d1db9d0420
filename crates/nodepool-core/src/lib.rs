//! nodepool-core — endpoint health tracking and failover for ledger RPC
//! clients.
//!
//! # Overview
//!
//! A network is a set of interchangeable endpoints, any of which may be slow
//! or down. The core crate defines:
//!
//! - [`EndpointAddress`] — `host:port` with TLS/plaintext port mapping
//! - [`ManagedNode`] — per-node backoff/usage capability, with [`Node`] as
//!   the primary (consensus) implementation
//! - [`NodePool`] — generic pool: random healthy selection, backoff
//!   feedback, lazy readmission and topology reconciliation
//! - [`PoolConfig`] — serde-loadable pool settings
//! - [`PoolError`] — structured error type
//! - [`Clock`] — injectable time source

pub mod address;
pub mod clock;
pub mod config;
pub mod error;
pub mod node;
pub mod pool;

pub use address::EndpointAddress;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::PoolConfig;
pub use error::PoolError;
pub use node::{BackoffSnapshot, ManagedNode, Node, NodeHealth, NodeOptions};
pub use pool::{NodePool, NodeSummary, Topology};

/// Pool of primary (consensus) nodes.
pub type Network = NodePool<Node>;
