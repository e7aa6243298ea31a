// Message codec — line-oriented framing with optional hash and payload cipher
//
// Frame layout:
//
//   MSD\r\n
//   name:value\r\n        (one per attribute, names lower-cased)
//   length:N\r\n
//   \r\n
//   <N payload bytes>
//
// A line ends at CRLF (a bare LF is tolerated) or at end of stream.

use std::io::{BufRead, Read};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::types::{attr, Message, MessageType};
use crate::config::DEFAULT_MAX_HEADER_LINE;
use crate::crypto::{open_payload, payload_hash, seal_payload};
use crate::error::ProtocolError;
use crate::keying::KeyingService;

/// First line of every frame
pub const FRAME_MARKER: &str = "MSD";

/// Upper bound on payload preallocation; the declared length is untrusted
const PREALLOC_LIMIT: usize = 64 * 1024;

/// One decoded line
enum Line {
    Text(String),
    Eof,
}

/// Turn the raw bytes of a bounded `read_until` into a line
fn parse_line(raw: &[u8], max: usize) -> Result<Line, ProtocolError> {
    if raw.is_empty() {
        return Ok(Line::Eof);
    }
    let content = match raw.strip_suffix(b"\n") {
        Some(line) => line.strip_suffix(b"\r").unwrap_or(line),
        // no terminator: either the stream ended or the limit was hit
        None => raw,
    };
    if content.len() > max {
        return Err(ProtocolError::LineTooLong(max));
    }
    String::from_utf8(content.to_vec())
        .map(Line::Text)
        .map_err(|_| ProtocolError::MalformedHeader("header is not utf-8".into()))
}

#[derive(Clone, Copy, PartialEq)]
enum HeaderState {
    Marker,
    Fields,
    Done,
}

/// Accumulates the header block line by line
struct HeaderBlock {
    state: HeaderState,
    message: Message,
}

impl HeaderBlock {
    fn new() -> Self {
        Self {
            state: HeaderState::Marker,
            message: Message::empty(),
        }
    }

    fn is_done(&self) -> bool {
        self.state == HeaderState::Done
    }

    fn feed(&mut self, line: Line) -> Result<(), ProtocolError> {
        match (self.state, line) {
            (HeaderState::Marker, Line::Eof) => Err(ProtocolError::EndOfStream),
            (HeaderState::Marker, Line::Text(text)) => {
                if text != FRAME_MARKER {
                    return Err(ProtocolError::BadMarker(text));
                }
                self.state = HeaderState::Fields;
                Ok(())
            }
            (HeaderState::Fields, Line::Eof) => {
                self.state = HeaderState::Done;
                Ok(())
            }
            (HeaderState::Fields, Line::Text(text)) => {
                if text.is_empty() {
                    self.state = HeaderState::Done;
                    return Ok(());
                }
                let (name, value) = text
                    .split_once(':')
                    .ok_or_else(|| ProtocolError::MalformedHeader(text.clone()))?;
                let name = name.trim();
                if name.is_empty() {
                    return Err(ProtocolError::MalformedHeader(text.clone()));
                }
                if name.eq_ignore_ascii_case(attr::TYPE) && MessageType::parse(value).is_none() {
                    return Err(ProtocolError::UnknownType(value.to_string()));
                }
                self.message.set_attribute(name, value);
                Ok(())
            }
            (HeaderState::Done, _) => Ok(()),
        }
    }

    fn length(&self) -> Result<usize, ProtocolError> {
        self.message
            .attribute(attr::LENGTH)
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or(ProtocolError::MissingLength)
    }
}

/// Frames messages onto byte streams and datagrams
#[derive(Clone)]
pub struct Codec {
    hash_payloads: bool,
    max_header_line: usize,
    keys: Option<Arc<dyn KeyingService>>,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("hash_payloads", &self.hash_payloads)
            .field("max_header_line", &self.max_header_line)
            .field("keys", &self.keys.is_some())
            .finish()
    }
}

impl Codec {
    /// Plain codec: no hash, no cipher
    pub fn new() -> Self {
        Self {
            hash_payloads: false,
            max_header_line: DEFAULT_MAX_HEADER_LINE,
            keys: None,
        }
    }

    pub fn with_hashing(mut self, enabled: bool) -> Self {
        self.hash_payloads = enabled;
        self
    }

    pub fn with_max_header_line(mut self, max: usize) -> Self {
        self.max_header_line = max;
        self
    }

    pub fn with_keys(mut self, keys: Arc<dyn KeyingService>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Serialize a message into one frame
    pub fn encode(&self, msg: &Message) -> Result<Vec<u8>, ProtocolError> {
        let mut msg = msg.clone();
        msg.remove_attribute(attr::LENGTH);

        if self.hash_payloads {
            msg.set_attribute(attr::HASH, payload_hash(msg.payload()));
        }

        let payload = match msg.attribute(attr::ENCODED) {
            Some(network) => {
                let key = self
                    .keys
                    .as_ref()
                    .and_then(|keys| keys.current_key(network))
                    .ok_or_else(|| ProtocolError::MissingKey(network.to_string()))?;
                seal_payload(&key, network, msg.payload())?
            }
            None => msg.payload().to_vec(),
        };

        let mut frame = Vec::with_capacity(64 + payload.len());
        frame.extend_from_slice(FRAME_MARKER.as_bytes());
        frame.extend_from_slice(b"\r\n");
        for (name, value) in msg.attributes() {
            if name.contains(':') || has_line_break(name) || has_line_break(value) {
                return Err(ProtocolError::MalformedHeader(format!("{}:{}", name, value)));
            }
            let line = format!("{}:{}\r\n", name, value);
            if line.len() - 2 > self.max_header_line {
                return Err(ProtocolError::LineTooLong(self.max_header_line));
            }
            frame.extend_from_slice(line.as_bytes());
        }
        frame.extend_from_slice(format!("{}:{}\r\n\r\n", attr::LENGTH, payload.len()).as_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode one frame from a complete buffer (datagram form)
    pub fn decode(&self, bytes: &[u8]) -> Result<Message, ProtocolError> {
        let mut reader = bytes;
        let mut block = HeaderBlock::new();
        let limit = (self.max_header_line + 2) as u64;

        while !block.is_done() {
            let mut raw = Vec::new();
            Read::take(&mut reader, limit).read_until(b'\n', &mut raw)?;
            block.feed(parse_line(&raw, self.max_header_line)?)?;
        }

        let expected = block.length()?;
        let mut payload = Vec::with_capacity(expected.min(PREALLOC_LIMIT));
        let actual = Read::take(&mut reader, expected as u64).read_to_end(&mut payload)?;
        if actual < expected {
            return Err(ProtocolError::Truncated { expected, actual });
        }
        self.finish(block.message, payload)
    }

    /// Decode one frame from a byte stream
    pub async fn read_message<R>(&self, reader: &mut R) -> Result<Message, ProtocolError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut block = HeaderBlock::new();
        let limit = (self.max_header_line + 2) as u64;

        while !block.is_done() {
            let mut raw = Vec::new();
            (&mut *reader).take(limit).read_until(b'\n', &mut raw).await?;
            block.feed(parse_line(&raw, self.max_header_line)?)?;
        }

        let expected = block.length()?;
        let mut payload = Vec::with_capacity(expected.min(PREALLOC_LIMIT));
        let actual = (&mut *reader)
            .take(expected as u64)
            .read_to_end(&mut payload)
            .await?;
        if actual < expected {
            return Err(ProtocolError::Truncated { expected, actual });
        }
        self.finish(block.message, payload)
    }

    /// Encode and write one frame, flushing the sink
    pub async fn write_message<W>(&self, writer: &mut W, msg: &Message) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode(msg)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Recompute the payload hash and compare it with the `hash` header.
    /// A message without a hash does not validate.
    pub fn validate(msg: &Message) -> bool {
        match msg.attribute(attr::HASH) {
            Some(hash) => hash == payload_hash(msg.payload()),
            None => false,
        }
    }

    fn finish(&self, mut msg: Message, payload: Vec<u8>) -> Result<Message, ProtocolError> {
        msg.remove_attribute(attr::LENGTH);
        let payload = match msg.attribute(attr::ENCODED) {
            Some(network) => {
                let key = self
                    .keys
                    .as_ref()
                    .and_then(|keys| keys.current_key(network))
                    .ok_or_else(|| ProtocolError::MissingKey(network.to_string()))?;
                open_payload(&key, network, &payload)?
            }
            None => payload,
        };
        msg.set_payload(payload);
        Ok(msg)
    }
}

fn has_line_break(value: &str) -> bool {
    value.contains('\r') || value.contains('\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PayloadKey;
    use crate::keying::StaticKeyring;

    fn sample() -> Message {
        Message::addressed(MessageType::Update, "node-a", Some("node-b"))
            .with_attribute(attr::UPDATE, "42")
            .with_payload(b"hello".to_vec())
    }

    #[test]
    fn test_frame_layout() {
        let frame = Codec::new().encode(&sample()).unwrap();
        let text = String::from_utf8(frame).unwrap();
        assert!(text.starts_with("MSD\r\n"));
        assert!(text.contains("from:node-a\r\n"));
        assert!(text.contains("type:6\r\n"));
        assert!(text.ends_with("length:5\r\n\r\nhello"));
    }

    #[test]
    fn test_roundtrip_plain() {
        let codec = Codec::new();
        let msg = sample();
        let decoded = codec.decode(&codec.encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_bad_marker() {
        let result = Codec::new().decode(b"HTTP/1.0\r\nlength:0\r\n\r\n");
        assert!(matches!(result, Err(ProtocolError::BadMarker(_))));
    }

    #[test]
    fn test_empty_input_is_end_of_stream() {
        assert_eq!(Codec::new().decode(b""), Err(ProtocolError::EndOfStream));
    }

    #[test]
    fn test_missing_length() {
        let result = Codec::new().decode(b"MSD\r\ntype:1\r\n\r\n");
        assert_eq!(result, Err(ProtocolError::MissingLength));
    }

    #[test]
    fn test_truncated_payload() {
        let result = Codec::new().decode(b"MSD\r\nlength:10\r\n\r\nabc");
        assert_eq!(
            result,
            Err(ProtocolError::Truncated {
                expected: 10,
                actual: 3
            })
        );
    }

    #[test]
    fn test_line_too_long() {
        let codec = Codec::new().with_max_header_line(16);
        let mut frame = b"MSD\r\n".to_vec();
        frame.extend_from_slice(format!("from:{}\r\n", "x".repeat(64)).as_bytes());
        frame.extend_from_slice(b"length:0\r\n\r\n");
        assert_eq!(codec.decode(&frame), Err(ProtocolError::LineTooLong(16)));
    }

    #[test]
    fn test_end_of_stream_terminates_headers() {
        let msg = Codec::new().decode(b"MSD\r\nlength:0").unwrap();
        assert!(msg.payload().is_empty());
    }

    #[test]
    fn test_bare_lf_tolerated() {
        let msg = Codec::new().decode(b"MSD\nfrom:a\nlength:2\n\nhi").unwrap();
        assert_eq!(msg.from_id(), Some("a"));
        assert_eq!(msg.payload(), b"hi");
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result = Codec::new().decode(b"MSD\r\ntype:99\r\nlength:0\r\n\r\n");
        assert!(matches!(result, Err(ProtocolError::UnknownType(_))));
    }

    #[test]
    fn test_header_with_line_break_rejected() {
        let msg = Message::new(MessageType::Use).with_attribute("service", "a\r\nb");
        assert!(matches!(
            Codec::new().encode(&msg),
            Err(ProtocolError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_hash_stamp_and_validate() {
        let codec = Codec::new().with_hashing(true);
        let decoded = codec.decode(&codec.encode(&sample()).unwrap()).unwrap();
        assert!(Codec::validate(&decoded));

        let mut tampered = decoded.clone();
        tampered.set_payload(b"jello".to_vec());
        assert!(!Codec::validate(&tampered));
        assert!(!Codec::validate(&sample()));
    }

    #[test]
    fn test_encrypted_payload_roundtrip() {
        let ring = Arc::new(StaticKeyring::new());
        ring.set_key("wifi", PayloadKey::generate());
        let codec = Codec::new().with_keys(ring);

        let msg = sample().with_attribute(attr::ENCODED, "wifi");
        let frame = codec.encode(&msg).unwrap();
        assert!(!frame.windows(5).any(|w| w == b"hello"));

        let decoded = codec.decode(&frame).unwrap();
        assert_eq!(decoded.payload(), b"hello");
    }

    #[test]
    fn test_encoding_without_key_is_error() {
        let codec = Codec::new().with_keys(Arc::new(StaticKeyring::new()));
        let msg = sample().with_attribute(attr::ENCODED, "wifi");
        assert_eq!(
            codec.encode(&msg),
            Err(ProtocolError::MissingKey("wifi".into()))
        );
        assert!(Codec::new().encode(&msg).is_err());
    }

    #[tokio::test]
    async fn test_stream_read_two_frames() {
        let codec = Codec::new();
        let first = sample();
        let second = Message::close();
        let mut bytes = codec.encode(&first).unwrap();
        bytes.extend(codec.encode(&second).unwrap());

        let mut reader = tokio::io::BufReader::new(&bytes[..]);
        assert_eq!(codec.read_message(&mut reader).await.unwrap(), first);
        assert_eq!(codec.read_message(&mut reader).await.unwrap(), second);
        assert_eq!(
            codec.read_message(&mut reader).await,
            Err(ProtocolError::EndOfStream)
        );
    }

    #[tokio::test]
    async fn test_stream_write_then_read() {
        let codec = Codec::new();
        let (client, server) = tokio::io::duplex(1024);
        let (_, mut writer) = tokio::io::split(client);
        codec.write_message(&mut writer, &sample()).await.unwrap();

        let (reader, _) = tokio::io::split(server);
        let mut reader = tokio::io::BufReader::new(reader);
        assert_eq!(codec.read_message(&mut reader).await.unwrap(), sample());
    }
}
