//! Transport abstraction layer for the MSD stack
//!
//! Defines the transport kinds, endpoint addresses and the raw byte-stream
//! pair every transport hands to the connection layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::RoutingError;

/// Transport families an MSD can be configured with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// IP multicast discovery + UDP unicast datagrams + TCP connections
    Internet,
    /// Stream-only transport (RFCOMM style), one cached physical link per peer
    Bluetooth,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Internet => write!(f, "Internet"),
            TransportKind::Bluetooth => write!(f, "Bluetooth"),
        }
    }
}

/// A reachable endpoint: (url, port, owning network name)
///
/// Urls may carry trailing `;name=value` parameters (Bluetooth connection
/// strings do). Those are ignored when two addresses are compared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    pub url: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub network: String,
}

impl Address {
    pub fn new(url: impl Into<String>, port: u16, network: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            port,
            network: network.into(),
        }
    }

    /// Url without trailing parameters
    pub fn normalized_url(&self) -> &str {
        normalize_url(&self.url)
    }

    /// Key used by connection tables
    pub fn key(&self) -> String {
        format!("{}:{}", self.normalized_url(), self.port)
    }

    /// Resolve to a socket address. Only literal IPs are accepted.
    pub fn socket_addr(&self) -> Result<SocketAddr, RoutingError> {
        let ip: IpAddr = self
            .normalized_url()
            .parse()
            .map_err(|_| RoutingError::HostUnreachable(format!("not an ip address: {}", self.url)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn from_socket_addr(addr: SocketAddr, network: impl Into<String>) -> Self {
        Self::new(addr.ip().to_string(), addr.port(), network)
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.normalized_url() == other.normalized_url() && self.port == other.port
    }
}

impl Eq for Address {}

impl std::hash::Hash for Address {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized_url().hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.url, self.port)
    }
}

/// Strip `;name=value` parameters from a url
pub fn normalize_url(url: &str) -> &str {
    match url.find(';') {
        Some(idx) => &url[..idx],
        None => url,
    }
}

pub type RawReader = Box<dyn AsyncRead + Send + Unpin>;
pub type RawWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Both halves of a raw transport byte stream
pub struct RawStreamPair {
    pub reader: RawReader,
    pub writer: RawWriter,
    /// Remote end as seen by the transport, when known
    pub peer: Option<Address>,
}

impl RawStreamPair {
    pub fn new(reader: RawReader, writer: RawWriter) -> Self {
        Self {
            reader,
            writer,
            peer: None,
        }
    }

    pub fn with_peer(mut self, peer: Address) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Wrap any full-duplex stream
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(Box::new(reader), Box::new(writer))
    }
}

impl fmt::Debug for RawStreamPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawStreamPair").field("peer", &self.peer).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_transport_kind_display() {
        assert_eq!(TransportKind::Internet.to_string(), "Internet");
        assert_eq!(TransportKind::Bluetooth.to_string(), "Bluetooth");
    }

    #[test]
    fn test_address_equality_ignores_parameters() {
        let a = Address::new("btspp://001122334455:1;authenticate=false", 0, "bluetooth");
        let b = Address::new("btspp://001122334455:1", 0, "bluetooth");
        assert_eq!(a, b);
        assert_eq!(a.key(), b.key());

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_address_socket_addr() {
        let addr = Address::new("127.0.0.1", 4000, "ethernet");
        assert_eq!(addr.socket_addr().unwrap(), "127.0.0.1:4000".parse().unwrap());
        assert!(Address::new("not-an-ip", 1, "x").socket_addr().is_err());
    }

    #[test]
    fn test_normalize_url_without_params() {
        assert_eq!(normalize_url("mem://a"), "mem://a");
        assert_eq!(normalize_url("mem://a;x=1;y=2"), "mem://a");
    }
}
