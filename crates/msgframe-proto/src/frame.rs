//! Frame type combining header and payload.
//!
//! A `Frame` is the logical unit that travels the wire as:
//! `[4-byte LE header length N] [N bytes of TLV header] [ContentLength bytes of payload]`.
//!
//! This module operates on fully-buffered byte slices; the actual
//! incremental, possibly-streamed read off a live socket is
//! `ConnectionIO`'s job (see `msgframe-core`), which reads the 4-byte prefix
//! and header block itself and hands only the header to [`Header::decode`].

use bytes::{BufMut, Bytes};

use crate::{
    errors::{ProtocolError, Result},
    header::{Header, MAX_CONTENT_LENGTH},
};

/// Complete protocol message (header + payload).
///
/// # Invariants
///
/// - Size consistency: `payload.len()` always matches `header.content_length`.
///   Enforced by [`Frame::new`] and re-verified by [`Frame::decode`].
/// - Size limit: `payload.len()` must not exceed [`MAX_CONTENT_LENGTH`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The structured header.
    pub header: Header,
    /// Raw payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Builds a frame, setting `header.content_length` to match `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLarge`] if `payload` exceeds
    /// [`MAX_CONTENT_LENGTH`], or a validation error if `header`'s other
    /// fields violate [`Header::validate`]'s invariants.
    pub fn new(mut header: Header, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();

        if payload.len() as u64 > MAX_CONTENT_LENGTH {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_CONTENT_LENGTH as usize,
            });
        }

        header.content_length = payload.len() as u64;
        header.validate()?;

        Ok(Self { header, payload })
    }

    /// Encodes this frame as `[4-byte LE header length][header][payload]`
    /// into `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLarge`] if the header's declared
    /// content length no longer matches the payload (should not happen for
    /// frames built via [`Frame::new`]).
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        if self.payload.len() as u64 != self.header.content_length {
            return Err(ProtocolError::malformed(
                "header.content_length does not match payload length",
            ));
        }

        let mut header_bytes = Vec::new();
        self.header.encode_into(&mut header_bytes);

        let header_len = u32::try_from(header_bytes.len()).map_err(|_| {
            ProtocolError::PayloadTooLarge { size: header_bytes.len(), max: u32::MAX as usize }
        })?;

        dst.put_u32_le(header_len);
        dst.put_slice(&header_bytes);
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Decodes a frame from a fully-buffered slice containing at least one
    /// complete frame at its start.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::FrameTruncated`] if `bytes` ends before the header
    ///   or payload is complete.
    /// - [`ProtocolError::Malformed`] if the header violates the TLV grammar
    ///   or a data invariant.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(ProtocolError::FrameTruncated { expected: 4, actual: bytes.len() });
        }

        let header_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let header_start = 4;
        let header_end = header_start.checked_add(header_len).ok_or(ProtocolError::Malformed {
            reason: "header length overflow".to_string(),
        })?;

        if bytes.len() < header_end {
            return Err(ProtocolError::FrameTruncated {
                expected: header_len,
                actual: bytes.len().saturating_sub(header_start),
            });
        }

        let header = Header::decode(&bytes[header_start..header_end])?;

        let content_length = header.content_length;
        if content_length > MAX_CONTENT_LENGTH {
            return Err(ProtocolError::PayloadTooLarge {
                size: content_length as usize,
                max: MAX_CONTENT_LENGTH as usize,
            });
        }

        let payload_start = header_end;
        let payload_end = payload_start.checked_add(content_length as usize).ok_or(
            ProtocolError::PayloadTooLarge {
                size: content_length as usize,
                max: MAX_CONTENT_LENGTH as usize,
            },
        )?;

        if bytes.len() < payload_end {
            return Err(ProtocolError::FrameTruncated {
                expected: content_length as usize,
                actual: bytes.len().saturating_sub(payload_start),
            });
        }

        let payload = Bytes::copy_from_slice(&bytes[payload_start..payload_end]);

        Ok(Self { header, payload })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::header::Status;

    impl Arbitrary for Frame {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            any::<Vec<u8>>()
                .prop_filter_map("payload within size limit", |payload_bytes| {
                    Frame::new(Header::normal(0), payload_bytes).ok()
                })
                .boxed()
        }
    }

    proptest! {
        #[test]
        fn frame_round_trip(frame in any::<Frame>()) {
            let mut wire = Vec::new();
            frame.encode(&mut wire).expect("should encode");

            let parsed = Frame::decode(&wire).expect("should decode");
            prop_assert_eq!(frame.payload, parsed.payload);
        }
    }

    #[test]
    fn frame_with_payload() {
        let header = Header { status: Status::Normal, ..Header::default() };
        let payload_bytes = vec![1, 2, 3, 4];
        let frame = Frame::new(header, payload_bytes.clone()).expect("should build");

        assert_eq!(frame.header.content_length, payload_bytes.len() as u64);

        let mut wire = Vec::new();
        frame.encode(&mut wire).expect("should encode");

        let parsed = Frame::decode(&wire).expect("should decode");
        assert_eq!(frame.payload, parsed.payload);
    }

    #[test]
    fn reject_truncated_frame() {
        let frame = Frame::new(Header::normal(0), vec![1, 2, 3, 4]).expect("should build");
        let mut wire = Vec::new();
        frame.encode(&mut wire).expect("should encode");

        // Chop off the payload entirely; only the header survives.
        let header_only = &wire[..wire.len() - 4];
        let result = Frame::decode(header_only);
        assert!(matches!(result, Err(ProtocolError::FrameTruncated { .. })));
    }

    #[test]
    fn reject_oversized_payload() {
        // `Frame::new` always recomputes content_length from the payload it
        // is given, so to exercise the oversized-content-length decode path
        // we forge a header directly instead of going through `Frame::new`.
        let mut forged_header = Vec::new();
        Header { content_length: MAX_CONTENT_LENGTH + 1, ..Header::default() }
            .encode_into(&mut forged_header);

        let mut wire = Vec::new();
        wire.extend_from_slice(&(forged_header.len() as u32).to_le_bytes());
        wire.extend_from_slice(&forged_header);

        let result = Frame::decode(&wire);
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
    }
}
