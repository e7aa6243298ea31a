// Message types — the unit of communication between MSDs
//
// A message is an attribute bag plus an optional payload. Routing state
// (from/to/hops/virtual) lives in the attributes so that forwarding is an
// attribute replacement and never touches payload bytes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Hop budget given to freshly created messages
pub const DEFAULT_HOPS: i32 = 3;

/// Sentinel destination meaning "whichever MSD receives this"
pub const LOCAL_SENTINEL: &str = "0";

/// Well-known attribute names
pub mod attr {
    pub const FROM: &str = "from";
    pub const TO: &str = "to";
    pub const TYPE: &str = "type";
    pub const HOPS: &str = "hops";
    pub const VIRTUAL: &str = "virtual";
    pub const ENCODED: &str = "encoded";
    pub const HASH: &str = "hash";
    pub const LENGTH: &str = "length";
    pub const NETWORK: &str = "network";
    pub const UPDATE: &str = "update";
    pub const TEMPLATE: &str = "template";
    pub const SERVICE: &str = "service";
    pub const CREDENTIAL: &str = "credential";
    pub const REASON: &str = "reason";
}

/// Message type codes carried in the `type` header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Unregistered = 0,
    MainRequest = 1,
    MainReply = 2,
    Key = 3,
    IAmHere = 4,
    Conn = 5,
    Update = 6,
    Error = 7,
    Close = 8,
    Use = 9,
    Left = 10,
    Credential = 11,
}

impl MessageType {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let ty = match code {
            0 => MessageType::Unregistered,
            1 => MessageType::MainRequest,
            2 => MessageType::MainReply,
            3 => MessageType::Key,
            4 => MessageType::IAmHere,
            5 => MessageType::Conn,
            6 => MessageType::Update,
            7 => MessageType::Error,
            8 => MessageType::Close,
            9 => MessageType::Use,
            10 => MessageType::Left,
            11 => MessageType::Credential,
            _ => return None,
        };
        Some(ty)
    }

    /// Parse the decimal wire form
    pub fn parse(value: &str) -> Option<Self> {
        value.trim().parse::<u8>().ok().and_then(Self::from_code)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Unregistered => "UNREGISTERED",
            MessageType::MainRequest => "MAIN_REQUEST",
            MessageType::MainReply => "MAIN_REPLY",
            MessageType::Key => "KEY",
            MessageType::IAmHere => "I_AM_HERE",
            MessageType::Conn => "CONN",
            MessageType::Update => "UPDATE",
            MessageType::Error => "ERROR",
            MessageType::Close => "CLOSE",
            MessageType::Use => "USE",
            MessageType::Left => "LEFT",
            MessageType::Credential => "CREDENTIAL",
        };
        f.write_str(name)
    }
}

/// Logical connection types negotiated by the CONN handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionType {
    /// Bluetooth physical link setup
    Physical = 0,
    /// Cache query
    Get = 1,
    /// Cache update registration / push
    Update = 2,
    /// Brokered service connection
    Use = 3,
}

impl ConnectionType {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ConnectionType::Physical),
            1 => Some(ConnectionType::Get),
            2 => Some(ConnectionType::Update),
            3 => Some(ConnectionType::Use),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::Physical => write!(f, "PHYSICAL"),
            ConnectionType::Get => write!(f, "GET"),
            ConnectionType::Update => write!(f, "UPDATE"),
            ConnectionType::Use => write!(f, "USE"),
        }
    }
}

/// An attribute bag plus raw payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    attributes: BTreeMap<String, String>,
    payload: Vec<u8>,
}

impl Message {
    /// Create a message of the given type with the default hop budget
    pub fn new(message_type: MessageType) -> Self {
        let mut msg = Self::default();
        msg.set_type(message_type);
        msg.set_hops(DEFAULT_HOPS);
        msg
    }

    /// Create an addressed message
    pub fn addressed(message_type: MessageType, from: &str, to: Option<&str>) -> Self {
        let mut msg = Self::new(message_type);
        msg.set_from(from);
        if let Some(to) = to {
            msg.set_to(to);
        }
        msg
    }

    /// A bare attribute bag, used by the decoder
    pub fn empty() -> Self {
        Self::default()
    }

    /// Data chunk used by stream adaptation
    pub fn data(payload: Vec<u8>) -> Self {
        Self::new(MessageType::Use).with_payload(payload)
    }

    /// CLOSE control message
    pub fn close() -> Self {
        Self::new(MessageType::Close)
    }

    /// ERROR message carrying a reason
    pub fn error(reason: &str) -> Self {
        let mut msg = Self::new(MessageType::Error);
        msg.set_attribute(attr::REASON, reason);
        msg
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Names are stored lower-cased, matching the wire form
    pub fn set_attribute(&mut self, name: &str, value: impl Into<String>) {
        self.attributes.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<String> {
        self.attributes.remove(name)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    /// Declared type; absent or unknown codes read as UNREGISTERED
    pub fn message_type(&self) -> MessageType {
        self.attribute(attr::TYPE)
            .and_then(MessageType::parse)
            .unwrap_or(MessageType::Unregistered)
    }

    pub fn set_type(&mut self, message_type: MessageType) {
        self.set_attribute(attr::TYPE, message_type.code().to_string());
    }

    pub fn from_id(&self) -> Option<&str> {
        self.attribute(attr::FROM)
    }

    pub fn set_from(&mut self, from: &str) {
        self.set_attribute(attr::FROM, from);
    }

    /// Destination; `None` means multicast scope
    pub fn to_id(&self) -> Option<&str> {
        self.attribute(attr::TO)
    }

    pub fn set_to(&mut self, to: &str) {
        self.set_attribute(attr::TO, to);
    }

    pub fn clear_to(&mut self) {
        self.attributes.remove(attr::TO);
    }

    pub fn is_multicast(&self) -> bool {
        self.to_id().is_none()
    }

    /// Remaining hop budget. A missing header counts as the default budget,
    /// an unparseable one as exhausted.
    pub fn hops(&self) -> i32 {
        match self.attribute(attr::HOPS) {
            Some(value) => value.trim().parse().unwrap_or(0),
            None => DEFAULT_HOPS,
        }
    }

    pub fn set_hops(&mut self, hops: i32) {
        self.set_attribute(attr::HOPS, hops.to_string());
    }

    pub fn virtual_id(&self) -> Option<&str> {
        self.attribute(attr::VIRTUAL)
    }

    pub fn set_virtual_id(&mut self, id: &str) {
        self.set_attribute(attr::VIRTUAL, id);
    }

    pub fn network(&self) -> Option<&str> {
        self.attribute(attr::NETWORK)
    }

    pub fn set_network(&mut self, network: &str) {
        self.set_attribute(attr::NETWORK, network);
    }

    /// Payload as UTF-8, lossy
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} (hops {}, {} bytes)",
            self.message_type(),
            self.from_id().unwrap_or("?"),
            self.to_id().unwrap_or("*"),
            self.hops(),
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_defaults() {
        let msg = Message::new(MessageType::MainRequest);
        assert_eq!(msg.message_type(), MessageType::MainRequest);
        assert_eq!(msg.hops(), DEFAULT_HOPS);
        assert!(msg.is_multicast());
        assert!(msg.payload().is_empty());
    }

    #[test]
    fn test_type_codes_roundtrip() {
        for code in 0..=11u8 {
            let ty = MessageType::from_code(code).unwrap();
            assert_eq!(ty.code(), code);
        }
        assert!(MessageType::from_code(12).is_none());
        assert_eq!(MessageType::parse(" 6 "), Some(MessageType::Update));
        assert_eq!(MessageType::parse("x"), None);
    }

    #[test]
    fn test_attribute_names_lowercased() {
        let mut msg = Message::empty();
        msg.set_attribute("Network", "wifi");
        assert_eq!(msg.network(), Some("wifi"));
        assert_eq!(msg.attribute("network"), Some("wifi"));
    }

    #[test]
    fn test_unparseable_hops_is_exhausted() {
        let msg = Message::empty().with_attribute(attr::HOPS, "many");
        assert_eq!(msg.hops(), 0);
        assert_eq!(Message::empty().hops(), DEFAULT_HOPS);
    }

    #[test]
    fn test_addressed_message() {
        let msg = Message::addressed(MessageType::Update, "a", Some("b"));
        assert_eq!(msg.from_id(), Some("a"));
        assert_eq!(msg.to_id(), Some("b"));
        assert!(!msg.is_multicast());
        assert!(msg.to_string().contains("UPDATE a -> b"));
    }

    #[test]
    fn test_connection_type_codes() {
        assert_eq!(ConnectionType::from_code(1), Some(ConnectionType::Get));
        assert_eq!(ConnectionType::Use.code(), 3);
        assert_eq!(ConnectionType::from_code(9), None);
    }

    #[test]
    fn test_error_message_reason() {
        let msg = Message::error("boom");
        assert_eq!(msg.message_type(), MessageType::Error);
        assert_eq!(msg.attribute(attr::REASON), Some("boom"));
    }
}
