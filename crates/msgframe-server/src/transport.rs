//! TCP/TLS listener for the server endpoint.
//!
//! A plain `TcpListener`, optionally upgrading accepted connections with
//! `rustls`/`tokio-rustls`. Certificate loading (`load_tls_config`) and the
//! self-signed fallback (`write_self_signed_pair`) build a
//! `rustls::ServerConfig` directly.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig as RustlsServerConfig};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::error::ServerError;

/// TLS options for [`Listener::bind`]. The caller passes `None` for plain
/// TCP (development / tests only).
#[derive(Debug, Clone)]
pub struct ServerTlsConfig {
    /// PEM file holding the server's certificate chain.
    pub cert_path: std::path::PathBuf,
    /// PEM file holding the private key matching `cert_path`.
    pub key_path: std::path::PathBuf,
    /// Requires the client to present a certificate during the handshake,
    /// verified against `client_ca_path`.
    pub mutually_authenticate: bool,
    /// PEM file of CA certificates trusted to sign client certificates.
    /// Required when `mutually_authenticate` is set.
    pub client_ca_path: Option<std::path::PathBuf>,
    /// Bounds how long a single accepted connection's TLS handshake may
    /// take before it is abandoned.
    pub handshake_timeout: Duration,
}

/// Either a plain TCP stream or one upgraded with TLS. `ConnectionIO` is
/// generic over the transport; the server instantiates it with this one
/// concrete type per accepted connection.
pub enum ServerStream {
    /// Unencrypted TCP.
    Plain(TcpStream),
    /// TLS over TCP.
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A bound TCP socket, optionally paired with a TLS acceptor.
pub struct Listener {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    handshake_timeout: Duration,
}

impl Listener {
    /// Binds `address` and, if `tls` is `Some`, loads the certificate chain
    /// and key it names. Callers wanting a self-signed fallback should
    /// generate one with [`write_self_signed_pair`] first and point `tls`
    /// at the resulting paths.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be parsed or
    /// bound, and [`ServerError::TlsConfig`] if the TLS material is missing
    /// or malformed.
    pub async fn bind(address: &str, tls: Option<&ServerTlsConfig>) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::Bind(address.to_owned(), e.to_string()))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(address.to_owned(), e.to_string()))?;

        let acceptor = match tls {
            Some(tls) => Some(TlsAcceptor::from(Arc::new(load_tls_config(tls)?))),
            None => None,
        };

        let handshake_timeout = tls.map_or(Duration::from_secs(5), |t| t.handshake_timeout);

        tracing::info!(%addr, tls = acceptor.is_some(), "listening");

        Ok(Self { listener, acceptor, handshake_timeout })
    }

    /// Accepts one raw TCP connection. Deliberately does not perform the TLS
    /// handshake: the accept policy (`PermittedIPs`, then `MaxConnections`)
    /// must run on the peer address first, and a handshake is expensive
    /// enough that a rejected peer should never be made to pay for one.
    /// Call [`Listener::upgrade`] once the caller has cleared those checks.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if `accept` itself fails.
    pub async fn accept_tcp(&self) -> Result<(TcpStream, SocketAddr), ServerError> {
        let (tcp, addr) = self.listener.accept().await?;
        Ok((tcp, addr))
    }

    /// Upgrades an already-accepted TCP stream to TLS under
    /// `handshake_timeout`, or returns it unchanged if no TLS acceptor is
    /// configured.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::TlsHandshake`] if the handshake fails or times
    /// out.
    pub async fn upgrade(&self, tcp: TcpStream, addr: SocketAddr) -> Result<ServerStream, ServerError> {
        let Some(acceptor) = &self.acceptor else {
            return Ok(ServerStream::Plain(tcp));
        };

        let stream = tokio::time::timeout(self.handshake_timeout, acceptor.accept(tcp))
            .await
            .map_err(|_| ServerError::TlsHandshake(format!("handshake with {addr} timed out")))?
            .map_err(|e| ServerError::TlsHandshake(e.to_string()))?;

        Ok(ServerStream::Tls(Box::new(stream)))
    }

    /// The address the listener actually bound to (useful when `address`
    /// asked for an ephemeral port).
    ///
    /// # Errors
    ///
    /// Propagates the underlying `TcpListener::local_addr` error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

fn load_tls_config(tls: &ServerTlsConfig) -> Result<RustlsServerConfig, ServerError> {
    let certs = load_certs(&tls.cert_path)?;
    let key = load_private_key(&tls.key_path)?;

    let builder = RustlsServerConfig::builder();

    let builder = if tls.mutually_authenticate {
        let ca_path = tls.client_ca_path.as_ref().ok_or_else(|| {
            ServerError::TlsConfig("MutuallyAuthenticate requires client_ca_path".to_owned())
        })?;
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path)? {
            roots
                .add(cert)
                .map_err(|e| ServerError::TlsConfig(format!("bad client CA certificate: {e}")))?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| ServerError::TlsConfig(format!("client verifier: {e}")))?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    builder
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::TlsConfig(format!("invalid TLS config: {e}")))
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, ServerError> {
    let file = std::fs::File::open(path)
        .map_err(|e| ServerError::TlsConfig(format!("failed to read {}: {e}", path.display())))?;
    let mut reader = io::BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::TlsConfig(format!("failed to parse {}: {e}", path.display())))
}

fn load_private_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>, ServerError> {
    let file = std::fs::File::open(path)
        .map_err(|e| ServerError::TlsConfig(format!("failed to read {}: {e}", path.display())))?;
    let mut reader = io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ServerError::TlsConfig(format!("failed to parse {}: {e}", path.display())))?
        .ok_or_else(|| ServerError::TlsConfig(format!("no private key found in {}", path.display())))
}

/// Generates a self-signed certificate for `localhost` and writes the
/// certificate/key PEM pair to `cert_path`/`key_path`, so callers can point
/// an ordinary [`ServerTlsConfig`] at the result instead of this crate
/// needing a second, parallel way to build a `rustls::ServerConfig`.
/// Development and test use only — demo binaries and `tests/scenarios.rs`
/// are the only callers.
///
/// # Errors
///
/// Returns [`ServerError::TlsConfig`] if certificate generation fails, or
/// [`ServerError::Io`] if the PEM files cannot be written.
pub fn write_self_signed_pair(cert_path: &Path, key_path: &Path) -> Result<(), ServerError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])
        .map_err(|e| ServerError::TlsConfig(format!("failed to generate self-signed cert: {e}")))?;

    std::fs::write(cert_path, cert.cert.pem())?;
    std::fs::write(key_path, cert.key_pair.serialize_pem())?;

    tracing::warn!("using a generated self-signed certificate - not for production use");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_plain_tcp_on_ephemeral_port() {
        let listener = Listener::bind("127.0.0.1:0", None).await.expect("bind should succeed");
        let addr = listener.local_addr().expect("local_addr should succeed");
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn rejects_invalid_address() {
        let result = Listener::bind("not-an-address", None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn binds_tls_with_a_self_signed_certificate() {
        let dir = tempfile::tempdir().expect("tempdir should create");
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        write_self_signed_pair(&cert_path, &key_path).expect("self-signed cert should generate");

        let tls = ServerTlsConfig {
            cert_path,
            key_path,
            mutually_authenticate: false,
            client_ca_path: None,
            handshake_timeout: Duration::from_secs(1),
        };

        let listener = Listener::bind("127.0.0.1:0", Some(&tls)).await.expect("bind should succeed");
        let addr = listener.local_addr().expect("local_addr should succeed");
        assert_ne!(addr.port(), 0);
    }
}
