//! The per-message header: a tag-length-value record carried ahead of every
//! payload.
//!
//! Each present field is emitted as `(tag: varint, wire_type: u8, value)`.
//! Readers that encounter a tag they do not recognize skip it using the
//! wire-type's length rule alone, which is what keeps the format forward
//! compatible: a header written by a newer version with extra fields still
//! parses cleanly on an older reader.

use std::collections::HashMap;

use crate::{
    errors::{ProtocolError, Result},
    varint::{decode_svarint, decode_uvarint, encode_svarint, encode_uvarint},
};

/// Maximum payload size this implementation will allocate for in one shot.
/// Larger bodies must use the streamed delivery path (see `ConnectionIO`).
pub const MAX_CONTENT_LENGTH: u64 = 64 * 1024 * 1024;

/// Maximum encoded size of a single TLV header. A header carries only a
/// handful of scalar fields plus `Metadata`, never the payload itself, so
/// this is orders of magnitude smaller than [`MAX_CONTENT_LENGTH`] -- it
/// exists to let `ConnectionIO::read_message` reject an implausible
/// wire-controlled length prefix before allocating a buffer for it.
pub const MAX_HEADER_LENGTH: u32 = 64 * 1024;

const TAG_CONTENT_LENGTH: u64 = 1;
const TAG_PRESHARED_KEY: u64 = 2;
const TAG_STATUS: u64 = 3;
const TAG_METADATA: u64 = 4;
const TAG_SYNC_REQUEST: u64 = 5;
const TAG_SYNC_RESPONSE: u64 = 6;
const TAG_SENDER_TIMESTAMP: u64 = 7;
const TAG_EXPIRATION: u64 = 8;
const TAG_CONVERSATION_ID: u64 = 9;
const TAG_COMPRESSION: u64 = 10;

/// Describes how many bytes of value data follow a tag, independent of what
/// the tag means. This is the mechanism that lets an unknown tag be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum WireType {
    /// A LEB128 varint (unsigned or zig-zag signed; shape is the same).
    Varint = 0,
    /// A single byte (booleans, small enums).
    Byte = 1,
    /// Exactly 16 raw bytes (preshared keys, conversation identifiers).
    Fixed16 = 2,
    /// A varint length followed by that many raw bytes.
    LengthDelimited = 3,
}

impl WireType {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Varint),
            1 => Ok(Self::Byte),
            2 => Ok(Self::Fixed16),
            3 => Ok(Self::LengthDelimited),
            other => Err(ProtocolError::malformed(format!("unknown wire type {other}"))),
        }
    }
}

/// Control/classification code for a message, mirroring the transitions a
/// [`crate::Frame`] can drive in the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    /// Ordinary application data.
    #[default]
    Normal,
    /// Positive application-level acknowledgement.
    Success,
    /// Negative application-level acknowledgement.
    Failure,
    /// Server demands a preshared key before anything else is processed.
    AuthRequired,
    /// Client is presenting a preshared key.
    AuthRequested,
    /// Preshared key accepted.
    AuthSuccess,
    /// Preshared key rejected.
    AuthFailure,
    /// Server is forcibly disconnecting this peer.
    Removed,
    /// Peer is shutting down the connection cleanly.
    Shutdown,
    /// Liveness probe.
    Heartbeat,
    /// Idle watchdog fired.
    Timeout,
}

impl Status {
    fn to_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Success => 1,
            Self::Failure => 2,
            Self::AuthRequired => 3,
            Self::AuthRequested => 4,
            Self::AuthSuccess => 5,
            Self::AuthFailure => 6,
            Self::Removed => 7,
            Self::Shutdown => 8,
            Self::Heartbeat => 9,
            Self::Timeout => 10,
        }
    }

    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Success),
            2 => Ok(Self::Failure),
            3 => Ok(Self::AuthRequired),
            4 => Ok(Self::AuthRequested),
            5 => Ok(Self::AuthSuccess),
            6 => Ok(Self::AuthFailure),
            7 => Ok(Self::Removed),
            8 => Ok(Self::Shutdown),
            9 => Ok(Self::Heartbeat),
            10 => Ok(Self::Timeout),
            other => Err(ProtocolError::malformed(format!("unknown status code {other}"))),
        }
    }
}

/// Payload compression scheme. Only `None` is implemented; the other two
/// variants round-trip on the wire so a peer that sets them is not rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Compression {
    /// No compression (the only scheme this implementation applies).
    #[default]
    None,
    /// Gzip-compressed payload.
    Gzip,
    /// Deflate-compressed payload.
    Deflate,
}

impl Compression {
    fn to_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Gzip => 1,
            Self::Deflate => 2,
        }
    }

    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Gzip),
            2 => Ok(Self::Deflate),
            other => Err(ProtocolError::malformed(format!("unknown compression code {other}"))),
        }
    }
}

/// 128-bit correlation key for a synchronous request/response pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationId(pub [u8; 16]);

impl ConversationId {
    /// Builds a conversation id from raw bytes obtained from an RNG.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A single user-supplied metadata attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MetadataValue {
    /// UTF-8 text.
    Text(String),
    /// Signed integer.
    Int(i64),
    /// Boolean flag.
    Bool(bool),
    /// Opaque bytes.
    Bytes(Vec<u8>),
}

/// Opaque user attributes attached to a message. Never interpreted by the
/// framing or session layers; purely carried for the application.
pub type Metadata = HashMap<String, MetadataValue>;

/// The structured fields that precede every payload on the wire.
///
/// See [`Header::validate`] for the invariants relating
/// `SyncRequest`/`SyncResponse`/`Expiration`/`ConversationId`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Number of payload bytes that follow this header on the wire.
    pub content_length: u64,
    /// Preshared key presented during the auth handshake, if any.
    pub preshared_key: Option<[u8; 16]>,
    /// Control/classification code.
    pub status: Status,
    /// Opaque user attributes.
    pub metadata: Metadata,
    /// Marks this message as a synchronous request.
    pub sync_request: bool,
    /// Marks this message as the reply to a synchronous request.
    pub sync_response: bool,
    /// Sender's wall clock at transmission, milliseconds since the epoch.
    pub sender_timestamp: Option<i64>,
    /// Deadline for a synchronous request/response, milliseconds since the
    /// epoch.
    pub expiration: Option<i64>,
    /// Correlation key for a synchronous request/response pair.
    pub conversation_id: Option<ConversationId>,
    /// Payload compression scheme.
    pub compression: Compression,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            content_length: 0,
            preshared_key: None,
            status: Status::Normal,
            metadata: Metadata::new(),
            sync_request: false,
            sync_response: false,
            sender_timestamp: None,
            expiration: None,
            conversation_id: None,
            compression: Compression::None,
        }
    }
}

impl Header {
    /// Builds a header for a plain data message carrying `content_length`
    /// bytes.
    #[must_use]
    pub fn normal(content_length: u64) -> Self {
        Self { content_length, ..Self::default() }
    }

    /// Checks the invariants that are not already
    /// enforced structurally (e.g. `PresharedKey` presence iff the status is
    /// `AuthRequested`).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] when an invariant is violated.
    pub fn validate(&self) -> Result<()> {
        if self.sync_request && self.sync_response {
            return Err(ProtocolError::malformed(
                "message cannot be both SyncRequest and SyncResponse",
            ));
        }
        if self.sync_request && (self.expiration.is_none() || self.conversation_id.is_none()) {
            return Err(ProtocolError::malformed(
                "SyncRequest requires Expiration and ConversationId",
            ));
        }
        if let (true, Some(expiration), Some(sent)) =
            (self.sync_request, self.expiration, self.sender_timestamp)
        {
            if expiration <= sent {
                return Err(ProtocolError::malformed("Expiration must be after SenderTimestamp"));
            }
        }
        if self.sync_response && self.conversation_id.is_none() {
            return Err(ProtocolError::malformed("SyncResponse requires ConversationId"));
        }
        let psk_allowed = matches!(self.status, Status::AuthRequested);
        if self.preshared_key.is_some() && !psk_allowed {
            return Err(ProtocolError::malformed(
                "PresharedKey is only valid on an AuthRequested message",
            ));
        }
        Ok(())
    }

    /// Serializes this header into `dst`, NOT including the outer 4-byte
    /// length prefix (that belongs to [`crate::Frame::encode`]).
    pub fn encode_into(&self, dst: &mut Vec<u8>) {
        write_field(dst, TAG_CONTENT_LENGTH, WireType::Varint, |buf| {
            encode_uvarint(self.content_length, buf);
        });

        if let Some(psk) = self.preshared_key {
            write_field(dst, TAG_PRESHARED_KEY, WireType::Fixed16, |buf| {
                buf.extend_from_slice(&psk);
            });
        }

        write_field(dst, TAG_STATUS, WireType::Byte, |buf| buf.push(self.status.to_u8()));

        if !self.metadata.is_empty() {
            write_field(dst, TAG_METADATA, WireType::LengthDelimited, |buf| {
                encode_metadata(&self.metadata, buf);
            });
        }

        if self.sync_request {
            write_field(dst, TAG_SYNC_REQUEST, WireType::Byte, |buf| buf.push(1));
        }
        if self.sync_response {
            write_field(dst, TAG_SYNC_RESPONSE, WireType::Byte, |buf| buf.push(1));
        }
        if let Some(ts) = self.sender_timestamp {
            write_field(dst, TAG_SENDER_TIMESTAMP, WireType::Varint, |buf| encode_svarint(ts, buf));
        }
        if let Some(exp) = self.expiration {
            write_field(dst, TAG_EXPIRATION, WireType::Varint, |buf| encode_svarint(exp, buf));
        }
        if let Some(cid) = &self.conversation_id {
            write_field(dst, TAG_CONVERSATION_ID, WireType::Fixed16, |buf| {
                buf.extend_from_slice(&cid.0);
            });
        }

        write_field(dst, TAG_COMPRESSION, WireType::Byte, |buf| buf.push(self.compression.to_u8()));
    }

    /// Parses a header from exactly `bytes` (the already length-delimited
    /// header block described by the outer 4-byte prefix).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] on any tag/wire-type violation,
    /// duplicate field, or invariant violation.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut header = Self::default();
        let mut seen = TagSet::default();
        let mut cursor = 0usize;

        while cursor < bytes.len() {
            let (tag, tag_len) = decode_uvarint(&bytes[cursor..])?;
            cursor += tag_len;

            let wire_type_byte = *bytes
                .get(cursor)
                .ok_or_else(|| ProtocolError::malformed("truncated field: missing wire type"))?;
            cursor += 1;
            let wire_type = WireType::from_u8(wire_type_byte)?;

            let (value, value_len) = read_value(&bytes[cursor..], wire_type)?;
            cursor += value_len;

            if matches!(tag, TAG_CONTENT_LENGTH | TAG_STATUS | TAG_COMPRESSION) && !seen.insert(tag)
            {
                return Err(ProtocolError::malformed(format!("duplicate field for tag {tag}")));
            }

            match tag {
                TAG_CONTENT_LENGTH => header.content_length = expect_uvarint(&value)?,
                TAG_PRESHARED_KEY => header.preshared_key = Some(expect_fixed16(&value)?),
                TAG_STATUS => header.status = Status::from_u8(expect_byte(&value)?)?,
                TAG_METADATA => header.metadata = decode_metadata(&value)?,
                TAG_SYNC_REQUEST => header.sync_request = expect_byte(&value)? != 0,
                TAG_SYNC_RESPONSE => header.sync_response = expect_byte(&value)? != 0,
                TAG_SENDER_TIMESTAMP => header.sender_timestamp = Some(expect_svarint(&value)?),
                TAG_EXPIRATION => header.expiration = Some(expect_svarint(&value)?),
                TAG_CONVERSATION_ID => {
                    header.conversation_id = Some(ConversationId(expect_fixed16(&value)?));
                },
                TAG_COMPRESSION => header.compression = Compression::from_u8(expect_byte(&value)?)?,
                // Unknown tag: the wire-type length rule already consumed the
                // right number of bytes above, so there is nothing left to do.
                _ => {},
            }
        }

        header.validate()?;
        Ok(header)
    }
}

#[derive(Default)]
struct TagSet(u16);

impl TagSet {
    /// Returns `true` if `tag` was not already present.
    fn insert(&mut self, tag: u64) -> bool {
        let bit = 1u16 << tag;
        if self.0 & bit != 0 {
            return false;
        }
        self.0 |= bit;
        true
    }
}

fn write_field(
    dst: &mut Vec<u8>,
    tag: u64,
    wire_type: WireType,
    write_value: impl FnOnce(&mut Vec<u8>),
) {
    encode_uvarint(tag, dst);
    dst.push(wire_type as u8);
    write_value(dst);
}

/// Reads one value according to `wire_type`, returning the raw value bytes
/// (sans any length prefix) and the number of bytes consumed from `src`.
fn read_value(src: &[u8], wire_type: WireType) -> Result<(Vec<u8>, usize)> {
    match wire_type {
        WireType::Varint => {
            let (_, consumed) = decode_uvarint(src)?;
            Ok((src[..consumed].to_vec(), consumed))
        },
        WireType::Byte => {
            let byte =
                *src.first().ok_or_else(|| ProtocolError::malformed("truncated byte field"))?;
            Ok((vec![byte], 1))
        },
        WireType::Fixed16 => {
            if src.len() < 16 {
                return Err(ProtocolError::malformed("truncated fixed16 field"));
            }
            Ok((src[..16].to_vec(), 16))
        },
        WireType::LengthDelimited => {
            let (len, len_bytes) = decode_uvarint(src)?;
            let len = usize::try_from(len)
                .map_err(|_| ProtocolError::malformed("length-delimited field too large"))?;
            let end = len_bytes
                .checked_add(len)
                .ok_or_else(|| ProtocolError::malformed("length-delimited field overflow"))?;
            if src.len() < end {
                return Err(ProtocolError::malformed("truncated length-delimited field"));
            }
            Ok((src[len_bytes..end].to_vec(), end))
        },
    }
}

fn expect_uvarint(value: &[u8]) -> Result<u64> {
    let (v, _) = decode_uvarint(value)?;
    Ok(v)
}

fn expect_svarint(value: &[u8]) -> Result<i64> {
    let (v, _) = decode_svarint(value)?;
    Ok(v)
}

fn expect_byte(value: &[u8]) -> Result<u8> {
    value.first().copied().ok_or_else(|| ProtocolError::malformed("empty byte field"))
}

fn expect_fixed16(value: &[u8]) -> Result<[u8; 16]> {
    value.try_into().map_err(|_| ProtocolError::malformed("expected 16-byte field"))
}

fn encode_metadata(metadata: &Metadata, dst: &mut Vec<u8>) {
    encode_uvarint(metadata.len() as u64, dst);
    for (key, value) in metadata {
        encode_uvarint(key.len() as u64, dst);
        dst.extend_from_slice(key.as_bytes());
        match value {
            MetadataValue::Text(s) => {
                dst.push(0);
                encode_uvarint(s.len() as u64, dst);
                dst.extend_from_slice(s.as_bytes());
            },
            MetadataValue::Int(i) => {
                dst.push(1);
                encode_svarint(*i, dst);
            },
            MetadataValue::Bool(b) => {
                dst.push(2);
                dst.push(u8::from(*b));
            },
            MetadataValue::Bytes(bytes) => {
                dst.push(3);
                encode_uvarint(bytes.len() as u64, dst);
                dst.extend_from_slice(bytes);
            },
        }
    }
}

fn decode_metadata(src: &[u8]) -> Result<Metadata> {
    let mut map = Metadata::new();
    let (count, mut cursor) = decode_uvarint(src)?;

    for _ in 0..count {
        let (key_len, key_len_bytes) = decode_uvarint(&src[cursor..])?;
        cursor += key_len_bytes;
        let key_len =
            usize::try_from(key_len).map_err(|_| ProtocolError::malformed("metadata key too long"))?;
        let key_end = cursor
            .checked_add(key_len)
            .ok_or_else(|| ProtocolError::malformed("metadata key overflow"))?;
        let key_bytes = src
            .get(cursor..key_end)
            .ok_or_else(|| ProtocolError::malformed("truncated metadata key"))?;
        let key = String::from_utf8(key_bytes.to_vec())
            .map_err(|_| ProtocolError::malformed("metadata key is not valid UTF-8"))?;
        cursor = key_end;

        let kind = *src
            .get(cursor)
            .ok_or_else(|| ProtocolError::malformed("truncated metadata value kind"))?;
        cursor += 1;

        let value = match kind {
            0 => {
                let (len, len_bytes) = decode_uvarint(&src[cursor..])?;
                cursor += len_bytes;
                let len = usize::try_from(len)
                    .map_err(|_| ProtocolError::malformed("metadata text too long"))?;
                let end = cursor
                    .checked_add(len)
                    .ok_or_else(|| ProtocolError::malformed("metadata text overflow"))?;
                let text_bytes = src
                    .get(cursor..end)
                    .ok_or_else(|| ProtocolError::malformed("truncated metadata text"))?;
                let text = String::from_utf8(text_bytes.to_vec())
                    .map_err(|_| ProtocolError::malformed("metadata text is not valid UTF-8"))?;
                cursor = end;
                MetadataValue::Text(text)
            },
            1 => {
                let (i, consumed) = decode_svarint(&src[cursor..])?;
                cursor += consumed;
                MetadataValue::Int(i)
            },
            2 => {
                let b = *src
                    .get(cursor)
                    .ok_or_else(|| ProtocolError::malformed("truncated metadata bool"))?;
                cursor += 1;
                MetadataValue::Bool(b != 0)
            },
            3 => {
                let (len, len_bytes) = decode_uvarint(&src[cursor..])?;
                cursor += len_bytes;
                let len = usize::try_from(len)
                    .map_err(|_| ProtocolError::malformed("metadata bytes too long"))?;
                let end = cursor
                    .checked_add(len)
                    .ok_or_else(|| ProtocolError::malformed("metadata bytes overflow"))?;
                let bytes = src
                    .get(cursor..end)
                    .ok_or_else(|| ProtocolError::malformed("truncated metadata bytes"))?;
                cursor = end;
                MetadataValue::Bytes(bytes.to_vec())
            },
            other => {
                return Err(ProtocolError::malformed(format!(
                    "unknown metadata value kind {other}"
                )));
            },
        };

        map.insert(key, value);
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_minimal_header() {
        let header = Header::normal(5);
        let mut buf = Vec::new();
        header.encode_into(&mut buf);
        let decoded = Header::decode(&buf).expect("should decode");
        assert_eq!(header, decoded);
    }

    #[test]
    fn round_trips_full_header() {
        let mut metadata = Metadata::new();
        metadata.insert("k".to_string(), MetadataValue::Text("v".to_string()));

        let header = Header {
            content_length: 3,
            preshared_key: None,
            status: Status::Normal,
            metadata,
            sync_request: true,
            sync_response: false,
            sender_timestamp: Some(1_000),
            expiration: Some(2_000),
            conversation_id: Some(ConversationId([7; 16])),
            compression: Compression::None,
        };
        let mut buf = Vec::new();
        header.encode_into(&mut buf);
        let decoded = Header::decode(&buf).expect("should decode");
        assert_eq!(header, decoded);
    }

    #[test]
    fn unknown_tag_is_skipped() {
        let header = Header::normal(0);
        let mut buf = Vec::new();
        header.encode_into(&mut buf);

        // Append a field under an unassigned tag (31) with a length-delimited
        // wire type; a forward-compatible decoder must skip it cleanly.
        encode_uvarint(31, &mut buf);
        buf.push(3); // LengthDelimited
        encode_uvarint(2, &mut buf);
        buf.extend_from_slice(b"hi");

        let decoded = Header::decode(&buf).expect("should decode despite unknown tag");
        assert_eq!(decoded.content_length, 0);
    }

    #[test]
    fn duplicate_content_length_is_malformed() {
        let mut buf = Vec::new();
        write_field(&mut buf, TAG_CONTENT_LENGTH, WireType::Varint, |b| encode_uvarint(1, b));
        write_field(&mut buf, TAG_CONTENT_LENGTH, WireType::Varint, |b| encode_uvarint(2, b));
        write_field(&mut buf, TAG_STATUS, WireType::Byte, |b| b.push(0));
        write_field(&mut buf, TAG_COMPRESSION, WireType::Byte, |b| b.push(0));

        assert!(Header::decode(&buf).is_err());
    }

    #[test]
    fn sync_request_and_response_together_is_malformed() {
        let header = Header {
            sync_request: true,
            sync_response: true,
            expiration: Some(10),
            conversation_id: Some(ConversationId([0; 16])),
            ..Header::default()
        };
        assert!(header.validate().is_err());
    }

    #[test]
    fn preshared_key_outside_auth_requested_is_malformed() {
        let header = Header { preshared_key: Some([0; 16]), ..Header::default() };
        assert!(header.validate().is_err());
    }
}
