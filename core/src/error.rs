//! Error taxonomy for the MSD stack
//!
//! Each layer owns one enum: framing failures are `ProtocolError`, channel
//! misuse and transport I/O are `ConnError`, next-hop resolution is
//! `RoutingError`, and operations refused by the protocol level are
//! `StateError`. `MsdError` is the umbrella used at the node façade.

use thiserror::Error;

/// Malformed or truncated frame. Fatal to the single decode attempt only.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad frame marker: {0:?}")]
    BadMarker(String),
    #[error("header line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
    #[error("missing or invalid length header")]
    MissingLength,
    #[error("truncated payload: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unexpected end of stream")]
    EndOfStream,
    #[error("unknown message type code: {0}")]
    UnknownType(String),
    #[error("no key configured for network {0}")]
    MissingKey(String),
    #[error("payload cipher failure: {0}")]
    Cipher(String),
    #[error("payload hash mismatch")]
    HashMismatch,
    #[error("i/o error while framing: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::EndOfStream
        } else {
            ProtocolError::Io(err.to_string())
        }
    }
}

/// Connection-level failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnErr {
    #[error("connection is closed")]
    Closed,
    #[error("virtual connection queue is full")]
    QueueFull,
    #[error("transport i/o failure: {0}")]
    Io(String),
    #[error("framing error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("handshake failed: {0}")]
    Handshake(String),
}

impl From<std::io::Error> for ConnErr {
    fn from(err: std::io::Error) -> Self {
        ConnErr::Io(err.to_string())
    }
}

/// Next-hop resolution and transmission failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("host unreachable: {0}")]
    HostUnreachable(String),
    #[error("unknown msd: {0}")]
    MsdUnknown(String),
    #[error("message too large: {size} bytes exceeds datagram ceiling of {limit}")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("connection failure: {0}")]
    Connection(#[from] ConnErr),
    #[error("framing failure: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transport i/o failure: {0}")]
    Io(String),
}

impl From<std::io::Error> for RoutingError {
    fn from(err: std::io::Error) -> Self {
        RoutingError::Io(err.to_string())
    }
}

/// Operation refused by the current protocol level of a network
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("network {network}: operation {operation} not allowed at level {level}")]
    Forbidden {
        network: String,
        operation: &'static str,
        level: String,
    },
    #[error("network {0} is not configured")]
    UnknownNetwork(String),
    #[error("network {network}: split leader detected, {other} also claims leadership")]
    SplitLeader { network: String, other: String },
    #[error("network {0} has no known leader")]
    NoLeader(String),
}

/// Keying collaborator failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyingError {
    #[error("join refused for network {0}")]
    JoinRefused(String),
    #[error("no key material for network {0}")]
    NoKey(String),
}

/// Configuration validation failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("failed to read configuration: {0}")]
    Io(String),
}

/// Umbrella error for the node façade
#[derive(Debug, Clone, Error)]
pub enum MsdError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Connection(#[from] ConnErr),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Keying(#[from] KeyingError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cache document error: {0}")]
    Cache(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("node already running")]
    AlreadyRunning,
}

impl From<serde_json::Error> for MsdError {
    fn from(err: serde_json::Error) -> Self {
        MsdError::Cache(err.to_string())
    }
}

pub type MsdResult<T> = Result<T, MsdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_eof_maps_to_end_of_stream() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(ProtocolError::from(io), ProtocolError::EndOfStream);
    }

    #[test]
    fn test_routing_error_display() {
        let err = RoutingError::MessageTooLarge { size: 2000, limit: 1024 };
        assert!(err.to_string().contains("2000"));
        assert!(err.to_string().contains("1024"));
    }

    #[test]
    fn test_conn_err_wraps_protocol() {
        let err: ConnErr = ProtocolError::MissingLength.into();
        assert!(matches!(err, ConnErr::Protocol(ProtocolError::MissingLength)));
    }

    #[test]
    fn test_msd_error_from_layers() {
        let err: MsdError = RoutingError::HostUnreachable("b".into()).into();
        assert!(err.to_string().contains("host unreachable"));
        let err: MsdError = StateError::NoLeader("wifi".into()).into();
        assert!(err.to_string().contains("wifi"));
    }
}
