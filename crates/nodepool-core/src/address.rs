//! `host:port` endpoint addresses and TLS/plaintext port mapping.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// Plaintext consensus node port.
pub const PORT_NODE_PLAIN: u16 = 50211;
/// TLS consensus node port.
pub const PORT_NODE_TLS: u16 = 50212;
/// Plaintext mirror node port.
pub const PORT_MIRROR_PLAIN: u16 = 5600;
/// TLS mirror node port.
pub const PORT_MIRROR_TLS: u16 = 443;

/// Known `(insecure, secure)` port pairs.
const PORT_PAIRS: &[(u16, u16)] = &[
    (PORT_NODE_PLAIN, PORT_NODE_TLS),
    (PORT_MIRROR_PLAIN, PORT_MIRROR_TLS),
];

/// A dialable `host:port` endpoint.
///
/// Immutable: security-mode conversions return a new value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointAddress {
    host: String,
    port: u16,
}

impl EndpointAddress {
    /// Parse a `host:port` string.
    ///
    /// The host must be a non-empty token without whitespace and the port a
    /// run of ASCII digits that fits in a `u16`, with no leading zeros, so
    /// that a parsed address always displays as its input.
    pub fn parse(s: &str) -> Result<Self, PoolError> {
        let invalid = || PoolError::InvalidAddress {
            input: s.to_string(),
        };

        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(invalid());
        }
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        if port.len() > 1 && port.starts_with('0') {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns `true` if the port is one of the TLS ports.
    pub fn is_secure(&self) -> bool {
        PORT_PAIRS.iter().any(|&(_, tls)| tls == self.port)
    }

    /// The TLS counterpart of this address. Unknown ports are left alone.
    pub fn to_secure(&self) -> Self {
        let port = PORT_PAIRS
            .iter()
            .find(|&&(plain, _)| plain == self.port)
            .map_or(self.port, |&(_, tls)| tls);
        self.with_port(port)
    }

    /// The plaintext counterpart of this address. Unknown ports are left alone.
    pub fn to_insecure(&self) -> Self {
        let port = PORT_PAIRS
            .iter()
            .find(|&&(_, tls)| tls == self.port)
            .map_or(self.port, |&(plain, _)| plain);
        self.with_port(port)
    }

    fn with_port(&self, port: u16) -> Self {
        Self {
            host: self.host.clone(),
            port,
        }
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for EndpointAddress {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EndpointAddress {
    type Error = PoolError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<EndpointAddress> for String {
    fn from(addr: EndpointAddress) -> Self {
        addr.to_string()
    }
}
