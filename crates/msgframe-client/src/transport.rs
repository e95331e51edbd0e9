//! TCP/TLS transport for the client endpoint.
//!
//! Plain TCP, optionally upgraded via `rustls`/`tokio-rustls`. The wire
//! protocol here is the length-prefixed TLV stream `msgframe-proto` owns, so
//! there is no multiplexed-stream layer to bridge -- one stream carries
//! every frame, in order, for the session's whole life, and
//! `msgframe_core::ConnectionIO` already knows how to drive it.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::ClientConfig as RustlsClientConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::ClientError;

/// TLS options for [`connect`]. The caller passes `None` for plain TCP.
#[derive(Debug, Clone)]
pub struct ClientTlsConfig {
    /// Name presented via the TLS handshake's SNI extension and checked
    /// against the server's certificate.
    pub server_name: String,
    /// Skip certificate chain validation entirely. Development only.
    pub accept_invalid_certificates: bool,
    /// PEM file of CA certificates to trust. Required unless
    /// `accept_invalid_certificates` is set.
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate presented for mutual authentication.
    pub client_cert_path: Option<PathBuf>,
    /// Private key matching `client_cert_path`.
    pub client_key_path: Option<PathBuf>,
}

/// Either a plain TCP stream or one upgraded with TLS. `ConnectionIO` is
/// generic over the transport; this is the one concrete type the client
/// endpoint instantiates it with, so the session logic above never needs to
/// know which mode is in effect.
pub enum ClientStream {
    /// Unencrypted TCP.
    Plain(TcpStream),
    /// TLS over TCP.
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ClientStream {
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

impl AsyncWrite for ClientStream {
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

/// Opens a TCP connection to `host:port`, optionally upgrading it to TLS,
/// the whole operation bounded by `connect_timeout`.
///
/// # Errors
///
/// Returns [`ClientError::TimeoutConnecting`] if the TCP connect or the TLS
/// handshake does not complete in time, and [`ClientError::TlsHandshake`] if
/// the handshake itself fails.
pub(crate) async fn connect(
    host: &str,
    port: u16,
    local_port: u16,
    connect_timeout: Duration,
    tls: Option<&ClientTlsConfig>,
) -> Result<ClientStream, ClientError> {
    let target = format!("{host}:{port}");

    let tcp = tokio::time::timeout(connect_timeout, connect_tcp(host, port, local_port))
        .await
        .map_err(|_| ClientError::TimeoutConnecting(target.clone()))??;

    let Some(tls) = tls else {
        return Ok(ClientStream::Plain(tcp));
    };

    let rustls_config = build_rustls_config(tls)?;
    let connector = TlsConnector::from(Arc::new(rustls_config));
    let server_name = ServerName::try_from(tls.server_name.clone())
        .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;

    let stream = tokio::time::timeout(connect_timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| ClientError::TimeoutConnecting(target))?
        .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;

    Ok(ClientStream::Tls(Box::new(stream)))
}

async fn connect_tcp(host: &str, port: u16, local_port: u16) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in tokio::net::lookup_host((host, port)).await? {
        let socket = if addr.is_ipv6() { TcpSocket::new_v6()? } else { TcpSocket::new_v4()? };
        if local_port != 0 {
            let bind_addr: SocketAddr = if addr.is_ipv6() {
                (Ipv6Addr::UNSPECIFIED, local_port).into()
            } else {
                (Ipv4Addr::UNSPECIFIED, local_port).into()
            };
            socket.bind(bind_addr)?;
        }
        match socket.connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")))
}

fn build_rustls_config(tls: &ClientTlsConfig) -> Result<RustlsClientConfig, ClientError> {
    if tls.accept_invalid_certificates {
        return Ok(RustlsClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth());
    }

    let mut roots = rustls::RootCertStore::empty();
    if let Some(path) = &tls.ca_cert_path {
        for cert in load_certs(path)? {
            roots
                .add(cert)
                .map_err(|e| ClientError::TlsHandshake(format!("bad CA certificate: {e}")))?;
        }
    }
    build_with_roots(roots, tls)
}

fn build_with_roots(
    roots: rustls::RootCertStore,
    tls: &ClientTlsConfig,
) -> Result<RustlsClientConfig, ClientError> {
    let builder = RustlsClientConfig::builder().with_root_certificates(roots);

    match (&tls.client_cert_path, &tls.client_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ClientError::TlsHandshake(format!("client certificate rejected: {e}")))
        },
        _ => Ok(builder.with_no_client_auth()),
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let file = std::fs::File::open(path)?;
    let mut reader = io::BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::TlsHandshake(format!("failed to read {}: {e}", path.display())))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ClientError> {
    let file = std::fs::File::open(path)?;
    let mut reader = io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ClientError::TlsHandshake(format!("failed to read {}: {e}", path.display())))?
        .ok_or_else(|| ClientError::TlsHandshake(format!("no private key found in {}", path.display())))
}

/// Accepts any certificate chain. Installed only when
/// `accept_invalid_certificates` is set; development and test use only.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
