// Integration tests for the framing codec
//
// Round-trip law over arbitrary messages, plus the stream form carrying
// several frames back to back.

use msd_core::message::{attr, Codec, Message, MessageType};
use proptest::prelude::*;
use tokio::io::BufReader;

const RESERVED: &[&str] = &[attr::LENGTH, attr::TYPE, attr::ENCODED, attr::HASH];

fn message_type() -> impl Strategy<Value = MessageType> {
    (0u8..12).prop_map(|code| MessageType::from_code(code).unwrap())
}

fn attributes() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::vec(("[a-z][a-z0-9_]{0,10}", "[ -~]{0,40}"), 0..8).prop_map(|pairs| {
        pairs
            .into_iter()
            .filter(|(name, _)| !RESERVED.contains(&name.as_str()))
            .collect()
    })
}

fn build(ty: MessageType, attrs: &[(String, String)], payload: Vec<u8>) -> Message {
    let mut msg = Message::new(ty).with_payload(payload);
    for (name, value) in attrs {
        msg.set_attribute(name, value.clone());
    }
    msg
}

proptest! {
    #[test]
    fn prop_datagram_round_trip(
        ty in message_type(),
        attrs in attributes(),
        payload in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let codec = Codec::new();
        let msg = build(ty, &attrs, payload);
        let frame = codec.encode(&msg).unwrap();
        let decoded = codec.decode(&frame).unwrap();
        prop_assert_eq!(decoded, msg);
    }

    #[test]
    fn prop_truncated_frame_rejected(
        payload in prop::collection::vec(any::<u8>(), 1..256),
        cut in 1usize..256,
    ) {
        let codec = Codec::new();
        let msg = Message::new(MessageType::Use).with_payload(payload.clone());
        let frame = codec.encode(&msg).unwrap();
        let cut = cut.min(payload.len());
        prop_assert!(codec.decode(&frame[..frame.len() - cut]).is_err());
    }
}

#[tokio::test]
async fn test_stream_carries_consecutive_frames() {
    let codec = Codec::new().with_hashing(true);
    let first = Message::addressed(MessageType::MainRequest, "a", None);
    let second = Message::addressed(MessageType::Update, "a", Some("b"))
        .with_attribute(attr::UPDATE, "42")
        .with_payload(b"{\"services\":[]}".to_vec());

    let mut bytes = codec.encode(&first).unwrap();
    bytes.extend(codec.encode(&second).unwrap());

    let mut reader = BufReader::new(bytes.as_slice());
    let one = codec.read_message(&mut reader).await.unwrap();
    let two = codec.read_message(&mut reader).await.unwrap();
    assert_eq!(one.message_type(), MessageType::MainRequest);
    assert_eq!(two.attribute(attr::UPDATE), Some("42"));
    assert!(Codec::validate(&two));
    assert!(codec.read_message(&mut reader).await.is_err());

    println!("✓ Two frames read back from one stream");
}

#[test]
fn test_upper_case_names_arrive_lower_cased() {
    let codec = Codec::new();
    let frame = b"MSD\r\nFrom:a\r\nType:7\r\nlength:2\r\n\r\nok";
    let msg = codec.decode(frame).unwrap();
    assert_eq!(msg.from_id(), Some("a"));
    assert_eq!(msg.message_type(), MessageType::Error);
    assert_eq!(msg.payload(), b"ok");
}
