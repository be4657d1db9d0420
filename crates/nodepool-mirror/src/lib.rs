//! nodepool-mirror — mirror node pool with lazily-built RPC channels.
//!
//! # Features
//! - [`MirrorNode`] wraps the core node bookkeeping with a per-purpose
//!   channel cache, built on first use
//! - TLS or h2c chosen from the node's port, keep-alive tuned per purpose
//! - [`MirrorPool`] keys nodes by address and hands out channels from
//!   healthy nodes only

pub mod channel;
pub mod node;
pub mod pool;

pub use channel::{ChannelPurpose, KeepAlive, MirrorChannel};
pub use node::MirrorNode;
pub use pool::MirrorPool;
