//! The concurrent I/O core: one reader, one writer,
//! mutual exclusion, and the buffered/streamed delivery split.
//!
//! Generic over the transport (`S: AsyncRead + AsyncWrite`) so the same
//! implementation serves plain TCP and TLS-wrapped TCP alike; `msgframe-client`
//! and `msgframe-server` each instantiate it with their own concrete stream
//! type instead of duplicating the read/write choreography.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use msgframe_proto::{Frame, Header, MAX_CONTENT_LENGTH, MAX_HEADER_LENGTH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::SessionError;
use crate::session::{on_header, HeaderDecision};

/// Forwards `AsyncRead` through a held `MutexGuard` so the reader lock stays
/// taken for as long as a streamed payload is being consumed. `MutexGuard`
/// is itself `Unpin`, so this needs no unsafe pin projection.
struct LockedReader<'a, S>(MutexGuard<'a, ReadHalf<S>>);

impl<S: AsyncRead + Unpin> AsyncRead for LockedReader<'_, S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.0).poll_read(cx, buf)
    }
}

/// Where the payload bytes for a decoded header come from.
pub enum PayloadSource<'a, S> {
    /// The payload was read fully into memory.
    Buffered(Bytes),
    /// A bounded reader yielding exactly `content_length` bytes before EOF.
    /// Holds the reader-half lock for its lifetime: the next call to
    /// [`ConnectionIO::read_message`] blocks until this is dropped, which is
    /// what gives the streamed path its backpressure.
    Streamed {
        /// How many bytes remain.
        content_length: u64,
        /// The bounded reader itself.
        reader: tokio::io::Take<LockedReader<'a, S>>,
    },
}

/// Owns one bidirectional transport. The reader half and writer half are
/// guarded by separate locks so a long write never blocks an in-flight read
/// (or vice versa); holding both at once across a suspension point is
/// forbidden, which this API's shape makes structurally hard to violate
/// (`read_message`/`write_frame` each take only one guard).
pub struct ConnectionIO<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
}

impl<S> ConnectionIO<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Splits `stream` into independently-locked read/write halves.
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self { reader: Mutex::new(read_half), writer: Mutex::new(write_half) }
    }

    /// Reads one message: the 4-byte length prefix, the TLV header, and
    /// then either the full payload or a bounded reader over it, depending
    /// on `on_header`'s classification, `allow_streaming`, and whether
    /// `content_length` clears `stream_threshold`.
    ///
    /// Holds the reader lock for the duration of this call, and (in the
    /// streamed case) for as long as the caller holds onto the returned
    /// [`PayloadSource::Streamed`] reader.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::PeerClosed`] on a clean EOF before any bytes
    /// of the next frame arrive, or [`SessionError::Malformed`] if the
    /// length prefix exceeds [`MAX_HEADER_LENGTH`] or the header fails to
    /// decode. The length-prefix check runs before any allocation, so a
    /// peer claiming an implausible header size fails fast instead of
    /// forcing a multi-gigabyte buffer.
    pub async fn read_message(
        &self,
        allow_streaming: bool,
        stream_threshold: u64,
    ) -> Result<(Header, PayloadSource<'_, S>), SessionError> {
        let mut guard = self.reader.lock().await;

        let mut len_buf = [0u8; 4];
        match guard.read_exact(&mut len_buf).await {
            Ok(_) => {},
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(SessionError::PeerClosed);
            },
            Err(e) => return Err(io_to_session_error(e)),
        }
        let header_len = u32::from_le_bytes(len_buf);
        if header_len > MAX_HEADER_LENGTH {
            return Err(SessionError::Malformed(format!(
                "header length {header_len} exceeds maximum {MAX_HEADER_LENGTH}"
            )));
        }
        let header_len = header_len as usize;

        let mut header_buf = vec![0u8; header_len];
        guard.read_exact(&mut header_buf).await.map_err(io_to_session_error)?;
        let header = Header::decode(&header_buf)
            .map_err(|e| SessionError::Malformed(e.to_string()))?;

        let content_length = header.content_length;
        if content_length > MAX_CONTENT_LENGTH {
            return Err(SessionError::Malformed(format!(
                "content_length {content_length} exceeds maximum {MAX_CONTENT_LENGTH}"
            )));
        }

        let may_stream = allow_streaming && on_header(&header) == HeaderDecision::MayStream;
        if may_stream && content_length >= stream_threshold {
            let bounded = AsyncReadExt::take(LockedReader(guard), content_length);
            return Ok((header, PayloadSource::Streamed { content_length, reader: bounded }));
        }

        let mut payload = BytesMut::zeroed(content_length as usize);
        guard.read_exact(&mut payload).await.map_err(io_to_session_error)?;
        Ok((header, PayloadSource::Buffered(payload.freeze())))
    }

    /// Encodes and writes `frame` atomically with respect to other writers.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::WriteRejected`] if the underlying transport
    /// rejects the write (closed, broken pipe, ...).
    pub async fn write_frame(&self, frame: &Frame) -> Result<(), SessionError> {
        let mut wire = Vec::new();
        frame.encode(&mut wire).map_err(|e| SessionError::Malformed(e.to_string()))?;

        let mut guard = self.writer.lock().await;
        guard
            .write_all(&wire)
            .await
            .map_err(|e| SessionError::WriteRejected(e.to_string()))?;
        guard.flush().await.map_err(|e| SessionError::WriteRejected(e.to_string()))
    }

    /// Shuts down the write half, then the read half. Safe to call more
    /// than once; subsequent calls are no-ops since `shutdown` on an
    /// already-shut-down half returns `Ok(())`.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl<'a, S> PayloadSource<'a, S>
where
    S: AsyncRead + Unpin + Send,
{
    /// Drains a streamed payload into memory. Used by a caller that decided,
    /// after seeing `content_length`, that it would rather buffer after
    /// all (no streamed handler registered on this header despite a
    /// `MayStream` classification).
    ///
    /// # Errors
    ///
    /// Propagates the underlying transport's read error.
    pub async fn into_buffered(self) -> Result<Bytes, SessionError> {
        match self {
            Self::Buffered(bytes) => Ok(bytes),
            Self::Streamed { content_length, mut reader } => {
                let mut buf = BytesMut::zeroed(content_length as usize);
                reader.read_exact(&mut buf).await.map_err(io_to_session_error)?;
                Ok(buf.freeze())
            },
        }
    }

    /// Exposes the streamed reader as a boxed `AsyncRead`, for handing to an
    /// application-registered streamed handler. Returns `None` if the
    /// payload was already buffered.
    pub fn into_reader(self) -> Option<Pin<Box<dyn AsyncRead + Send + 'a>>> {
        match self {
            Self::Buffered(_) => None,
            Self::Streamed { reader, .. } => Some(Box::pin(reader)),
        }
    }
}

fn io_to_session_error(err: io::Error) -> SessionError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        SessionError::PeerClosed
    } else {
        SessionError::WriteRejected(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use msgframe_proto::{Header, Status};
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn round_trips_a_buffered_message() {
        let (client, server) = duplex(4096);
        let client_io = ConnectionIO::new(client);
        let server_io = ConnectionIO::new(server);

        let frame = Frame::new(Header::normal(5), Bytes::from_static(b"hello")).unwrap();
        client_io.write_frame(&frame).await.unwrap();

        let (header, payload) = server_io.read_message(false, u64::MAX).await.unwrap();
        assert_eq!(header.status, Status::Normal);
        let bytes = payload.into_buffered().await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn large_payload_streams_when_allowed() {
        let (client, server) = duplex(1 << 20);
        let client_io = ConnectionIO::new(client);
        let server_io = ConnectionIO::new(server);

        let big = vec![7u8; 2048];
        let frame = Frame::new(Header::normal(0), big.clone()).unwrap();
        client_io.write_frame(&frame).await.unwrap();

        let (_header, payload) = server_io.read_message(true, 1024).await.unwrap();
        assert!(matches!(payload, PayloadSource::Streamed { .. }));
        let drained = payload.into_buffered().await.unwrap();
        assert_eq!(drained.len(), big.len());
    }

    #[tokio::test]
    async fn peer_closing_before_a_frame_is_peer_closed() {
        let (client, server) = duplex(4096);
        let server_io = ConnectionIO::new(server);
        drop(client);

        let err = server_io.read_message(false, u64::MAX).await.unwrap_err();
        assert_eq!(err, SessionError::PeerClosed);
    }

    #[tokio::test]
    async fn an_implausible_header_length_fails_before_allocating() {
        let (mut client, server) = duplex(64);
        let server_io = ConnectionIO::new(server);

        client.write_all(&0x7FFF_FFFFu32.to_le_bytes()).await.unwrap();

        let err = server_io.read_message(false, u64::MAX).await.unwrap_err();
        assert!(matches!(err, SessionError::Malformed(_)));
    }
}
