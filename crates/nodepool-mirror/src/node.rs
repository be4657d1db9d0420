//! Mirror node: a [`Node`] plus a lazily-filled channel cache.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nodepool_core::{EndpointAddress, ManagedNode, Node, NodeHealth, NodeOptions, PoolError};

use crate::channel::{ChannelPurpose, MirrorChannel};

/// A pooled mirror node.
///
/// Wraps the shared [`Node`] bookkeeping and adds one cached
/// [`MirrorChannel`] per [`ChannelPurpose`], built on first request.
pub struct MirrorNode {
    node: Node,
    channels: Mutex<HashMap<ChannelPurpose, Arc<MirrorChannel>>>,
    closed: AtomicBool,
}

impl MirrorNode {
    fn wrap(node: Node) -> Self {
        Self {
            node,
            channels: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// The channel for `purpose`, building it if this is the first request.
    ///
    /// Concurrent first callers are serialized; only one of them builds.
    pub fn channel(&self, purpose: ChannelPurpose) -> Result<Arc<MirrorChannel>, PoolError> {
        // `close` flips the flag under this lock, so a closed node never
        // gets a channel cached after the fact.
        let mut channels = self.channels.lock().unwrap();
        if self.is_closed() {
            return Err(PoolError::NodeClosed {
                key: self.key().to_string(),
            });
        }
        if let Some(channel) = channels.get(&purpose) {
            return Ok(channel.clone());
        }

        let channel = Arc::new(MirrorChannel::build(
            self.address(),
            purpose,
            self.verify_certificate(),
        )?);
        tracing::debug!(
            address = %self.address(),
            purpose = %purpose,
            secure = channel.is_secure(),
            "mirror channel built"
        );
        channels.insert(purpose, channel.clone());
        Ok(channel)
    }

    /// Returns `true` if a channel for `purpose` has been built and not
    /// dropped since.
    pub fn has_channel(&self, purpose: ChannelPurpose) -> bool {
        self.channels.lock().unwrap().contains_key(&purpose)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn drop_channels(&self) -> usize {
        let mut channels = self.channels.lock().unwrap();
        let dropped = channels.len();
        channels.clear();
        dropped
    }
}

impl ManagedNode for MirrorNode {
    fn create(key: String, address: EndpointAddress, options: &NodeOptions) -> Self {
        Self::wrap(Node::create(key, address, options))
    }

    fn key(&self) -> &str {
        self.node.key()
    }

    fn address(&self) -> &EndpointAddress {
        self.node.address()
    }

    fn health(&self) -> &NodeHealth {
        self.node.health()
    }

    fn to_secure(&self) -> Self {
        Self::wrap(self.node.to_secure())
    }

    fn to_insecure(&self) -> Self {
        Self::wrap(self.node.to_insecure())
    }

    /// Also drops cached channels so they are rebuilt with the new setting.
    fn set_verify_certificate(&self, verify: bool) {
        if self.node.verify_certificate() != verify {
            self.node.set_verify_certificate(verify);
            self.drop_channels();
        }
    }

    fn verify_certificate(&self) -> bool {
        self.node.verify_certificate()
    }

    fn close(&self) -> Result<(), PoolError> {
        let dropped = {
            let mut channels = self.channels.lock().unwrap();
            self.closed.store(true, Ordering::Release);
            let dropped = channels.len();
            channels.clear();
            dropped
        };
        if dropped > 0 {
            tracing::debug!(address = %self.address(), channels = dropped, "mirror channels closed");
        }
        self.node.close()
    }
}

impl fmt::Debug for MirrorNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorNode")
            .field("node", &self.node)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mirror(address: &str) -> MirrorNode {
        MirrorNode::create(
            address.to_string(),
            EndpointAddress::parse(address).unwrap(),
            &NodeOptions::default(),
        )
    }

    #[test]
    fn channel_built_once_and_reused() {
        let node = mirror("127.0.0.1:5600");
        assert!(!node.has_channel(ChannelPurpose::Streaming));
        let first = node.channel(ChannelPurpose::Streaming).unwrap();
        let second = node.channel(ChannelPurpose::Streaming).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!node.has_channel(ChannelPurpose::Metadata));
    }

    #[test]
    fn purposes_get_separate_channels() {
        let node = mirror("127.0.0.1:5600");
        let streaming = node.channel(ChannelPurpose::Streaming).unwrap();
        let metadata = node.channel(ChannelPurpose::Metadata).unwrap();
        assert!(!Arc::ptr_eq(&streaming, &metadata));
        assert_eq!(metadata.purpose(), ChannelPurpose::Metadata);
    }

    #[test]
    fn concurrent_callers_share_one_channel() {
        let node = mirror("127.0.0.1:5600");
        let channels: Vec<Arc<MirrorChannel>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| node.channel(ChannelPurpose::Metadata).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(channels.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn to_secure_discards_channels_but_keeps_health() {
        let node = mirror("127.0.0.1:5600");
        node.channel(ChannelPurpose::Streaming).unwrap();
        node.increase_backoff();

        let tls = node.to_secure();
        assert_eq!(tls.address().port(), 443);
        assert_eq!(tls.key(), "127.0.0.1:5600");
        assert!(!tls.has_channel(ChannelPurpose::Streaming));
        assert!(tls.health().shares_state_with(node.health()));
        assert!(tls.channel(ChannelPurpose::Streaming).unwrap().is_secure());
    }

    #[test]
    fn close_drops_channels() {
        let node = mirror("127.0.0.1:5600");
        node.channel(ChannelPurpose::Metadata).unwrap();
        node.close().unwrap();
        assert!(node.is_closed());
        assert!(!node.has_channel(ChannelPurpose::Metadata));
        assert!(matches!(
            node.channel(ChannelPurpose::Metadata),
            Err(PoolError::NodeClosed { .. })
        ));
    }

    #[test]
    fn close_racing_channel_requests_leaves_no_channel() {
        for _ in 0..50 {
            let node = mirror("127.0.0.1:5600");
            std::thread::scope(|s| {
                for purpose in ChannelPurpose::ALL {
                    let node = &node;
                    s.spawn(move || {
                        let _ = node.channel(purpose);
                    });
                }
                s.spawn(|| node.close().unwrap());
            });
            assert!(node.is_closed());
            for purpose in ChannelPurpose::ALL {
                assert!(!node.has_channel(purpose));
            }
        }
    }

    #[test]
    fn verify_change_rebuilds_channels() {
        let node = mirror("mirror.example.com:443");
        let before = node.channel(ChannelPurpose::Metadata).unwrap();
        node.set_verify_certificate(true);
        assert!(node.has_channel(ChannelPurpose::Metadata));
        node.set_verify_certificate(false);
        assert!(!node.has_channel(ChannelPurpose::Metadata));
        let after = node.channel(ChannelPurpose::Metadata).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
    }
}
