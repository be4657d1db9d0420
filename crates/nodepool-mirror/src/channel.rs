//! HTTP/2 channels to mirror nodes, one per traffic pattern.

use std::fmt;
use std::time::Duration;

use nodepool_core::{EndpointAddress, PoolError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// What a channel is used for. Each purpose gets its own channel per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelPurpose {
    /// Long-lived subscriptions streaming consensus records.
    Streaming,
    /// Occasional network/address-book queries.
    Metadata,
}

impl ChannelPurpose {
    pub const ALL: [ChannelPurpose; 2] = [ChannelPurpose::Streaming, ChannelPurpose::Metadata];

    /// Keep-alive parameters for this traffic pattern.
    pub fn keep_alive(self) -> KeepAlive {
        match self {
            // Streams can sit idle between records; ping often so
            // intermediaries don't drop them.
            Self::Streaming => KeepAlive {
                interval: Duration::from_secs(30),
                timeout: Duration::from_secs(10),
                while_idle: true,
            },
            Self::Metadata => KeepAlive {
                interval: Duration::from_secs(5 * 60),
                timeout: Duration::from_secs(20),
                while_idle: false,
            },
        }
    }
}

impl fmt::Display for ChannelPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Streaming => write!(f, "streaming"),
            Self::Metadata => write!(f, "metadata"),
        }
    }
}

/// HTTP/2 keep-alive settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    /// Ping interval.
    pub interval: Duration,
    /// How long to wait for a ping ack before dropping the connection.
    pub timeout: Duration,
    /// Keep pinging with no requests in flight.
    pub while_idle: bool,
}

/// A configured HTTP/2 client bound to one mirror node endpoint.
///
/// TLS is used when the node's address is on a secure port; plaintext
/// endpoints are spoken to with HTTP/2 prior knowledge (h2c).
pub struct MirrorChannel {
    purpose: ChannelPurpose,
    endpoint: String,
    secure: bool,
    client: reqwest::Client,
}

impl MirrorChannel {
    /// Build a channel for `address`.
    pub fn build(
        address: &EndpointAddress,
        purpose: ChannelPurpose,
        verify_certificate: bool,
    ) -> Result<Self, PoolError> {
        let keep_alive = purpose.keep_alive();
        let secure = address.is_secure();

        let mut builder = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(keep_alive.interval)
            .http2_keep_alive_interval(keep_alive.interval)
            .http2_keep_alive_timeout(keep_alive.timeout)
            .http2_keep_alive_while_idle(keep_alive.while_idle);
        builder = if secure {
            builder
                .https_only(true)
                .danger_accept_invalid_certs(!verify_certificate)
        } else {
            builder.http2_prior_knowledge()
        };

        let client = builder
            .build()
            .map_err(|e| PoolError::Channel(format!("{address} ({purpose}): {e}")))?;
        let scheme = if secure { "https" } else { "http" };

        Ok(Self {
            purpose,
            endpoint: format!("{scheme}://{address}"),
            secure,
            client,
        })
    }

    pub fn purpose(&self) -> ChannelPurpose {
        self.purpose
    }

    /// Base URL requests on this channel go to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// The underlying client, for issuing requests.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

impl fmt::Debug for MirrorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorChannel")
            .field("purpose", &self.purpose)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_port_builds_https_channel() {
        let addr = EndpointAddress::parse("mirror.example.com:443").unwrap();
        let ch = MirrorChannel::build(&addr, ChannelPurpose::Metadata, true).unwrap();
        assert!(ch.is_secure());
        assert_eq!(ch.endpoint(), "https://mirror.example.com:443");
        assert_eq!(ch.purpose(), ChannelPurpose::Metadata);
    }

    #[test]
    fn plaintext_port_builds_h2c_channel() {
        let addr = EndpointAddress::parse("127.0.0.1:5600").unwrap();
        let ch = MirrorChannel::build(&addr, ChannelPurpose::Streaming, false).unwrap();
        assert!(!ch.is_secure());
        assert_eq!(ch.endpoint(), "http://127.0.0.1:5600");
    }

    #[test]
    fn streaming_pings_more_often_than_metadata() {
        let streaming = ChannelPurpose::Streaming.keep_alive();
        let metadata = ChannelPurpose::Metadata.keep_alive();
        assert!(streaming.interval < metadata.interval);
        assert!(streaming.while_idle);
        assert!(!metadata.while_idle);
    }
}
