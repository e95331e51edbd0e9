//! Round-trip and malformed-input properties for the TLV framer.

use msgframe_proto::{ConversationId, Frame, Header, Metadata, MetadataValue, ProtocolError, Status};
use proptest::prelude::*;

fn arbitrary_header() -> impl Strategy<Value = Header> {
    (
        any::<bool>(),
        "[a-z]{1,8}",
        "[a-z]{0,8}",
        1_000i64..10_000_000_000_000,
        1u64..5_000,
    )
        .prop_map(|(is_sync, key, value, sent, delta)| {
            let mut metadata = Metadata::new();
            if !key.is_empty() {
                metadata.insert(key, MetadataValue::Text(value));
            }

            if is_sync {
                Header {
                    status: Status::Normal,
                    metadata,
                    sync_request: true,
                    sender_timestamp: Some(sent),
                    expiration: Some(sent + delta as i64),
                    conversation_id: Some(ConversationId::from_bytes([9; 16])),
                    ..Header::default()
                }
            } else {
                Header { status: Status::Normal, metadata, ..Header::default() }
            }
        })
}

proptest! {
    /// For every valid header H and payload P with `|P| = H.ContentLength`,
    /// `decode(encode(H, P)) == (H, P)`.
    #[test]
    fn round_trip_matches_original(header in arbitrary_header(), payload in any::<Vec<u8>>()) {
        let frame = Frame::new(header, payload.clone()).expect("valid header should build");

        let mut wire = Vec::new();
        frame.encode(&mut wire).expect("should encode");

        let decoded = Frame::decode(&wire).expect("should decode");
        prop_assert_eq!(decoded.header, frame.header);
        prop_assert_eq!(decoded.payload.as_ref(), payload.as_slice());
    }

    /// Any byte string whose first four bytes claim a header block longer
    /// than what follows fails with a truncation error, never a panic.
    #[test]
    fn truncated_header_length_is_rejected(claimed_len in 5u32..=5000, tail in prop::collection::vec(any::<u8>(), 0..4)) {
        let mut wire = Vec::new();
        wire.extend_from_slice(&claimed_len.to_le_bytes());
        wire.extend_from_slice(&tail);

        prop_assert!(Frame::decode(&wire).is_err());
    }
}

#[test]
fn malformed_tag_sequence_does_not_allocate_unbounded_memory() {
    // A 4-byte length prefix claiming
    // ~2^31 bytes of header, followed by far fewer actual bytes, must fail
    // fast rather than attempt to read gigabytes.
    let mut wire = vec![0xFFu8, 0xFF, 0xFF, 0x7F];
    wire.extend(std::iter::repeat(0u8).take(16));

    let result = Frame::decode(&wire);
    assert!(result.is_err());
}

#[test]
fn empty_buffer_is_peer_closed_shaped_truncation() {
    let result = Frame::decode(&[]);
    assert!(matches!(result, Err(ProtocolError::FrameTruncated { .. })));
}
