//! msgframe server binary.
//!
//! # Usage
//!
//! ```bash
//! # Start with self-signed certificate (development)
//! msgframe-server --bind 0.0.0.0:4433
//!
//! # Start with TLS certificate and a preshared key (production)
//! msgframe-server --bind 0.0.0.0:4433 --cert cert.pem --key key.pem --psk 00112233445566778899aabbccddeeff
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use msgframe_core::ServerConfig;
use msgframe_server::transport::ServerTlsConfig;
use msgframe_server::ServerEndpoint;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// msgframe protocol server
#[derive(Parser, Debug)]
#[command(name = "msgframe-server")]
#[command(about = "msgframe messaging protocol server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:4433")]
    bind: String,

    /// Path to TLS certificate (PEM format)
    #[arg(short, long)]
    cert: Option<PathBuf>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Require clients to present a certificate signed by this CA during the
    /// TLS handshake
    #[arg(long)]
    client_ca: Option<PathBuf>,

    /// Require the TLS client-certificate handshake named by `--client-ca`
    #[arg(long, default_value_t = false)]
    mutually_authenticate: bool,

    /// 16-byte preshared key clients must present, as 32 hex characters.
    /// Omit to accept every client without a challenge.
    #[arg(long)]
    psk: Option<String>,

    /// Literal IPv4/IPv6 addresses allowed to connect. Repeat the flag for
    /// more than one. Omit to allow any address.
    #[arg(long = "permitted-ip")]
    permitted_ips: Vec<IpAddr>,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Disconnect a client after this many idle seconds with no frames in
    /// either direction. Zero disables the watchdog.
    #[arg(long, default_value = "0")]
    idle_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_psk(hex: &str) -> Result<[u8; 16], Box<dyn std::error::Error>> {
    let bytes = hex::decode(hex)?;
    let key: [u8; 16] =
        bytes.try_into().map_err(|_| "preshared key must be exactly 16 bytes (32 hex characters)")?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::parse_psk;

    #[test]
    fn rejects_wrong_length() {
        assert!(parse_psk("aabb").is_err());
        assert!(parse_psk(&"ab".repeat(17)).is_err());
    }

    #[test]
    fn rejects_non_hex() {
        assert!(parse_psk("not-hex-at-all-not-hex-at-all!!").is_err());
    }

    proptest! {
        #[test]
        fn any_16_bytes_round_trips_through_hex(bytes in prop::array::uniform16(any::<u8>())) {
            let key = parse_psk(&hex::encode(bytes)).expect("16 bytes should parse");
            prop_assert_eq!(key, bytes);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("msgframe server starting");
    tracing::info!(bind = %args.bind, "binding");

    let preshared_key = args.psk.as_deref().map(parse_psk).transpose()?;

    let tls = match (&args.cert, &args.key) {
        (Some(cert_path), Some(key_path)) => Some(ServerTlsConfig {
            cert_path: cert_path.clone(),
            key_path: key_path.clone(),
            mutually_authenticate: args.mutually_authenticate,
            client_ca_path: args.client_ca.clone(),
            handshake_timeout: Duration::from_secs(5),
        }),
        (None, None) => {
            tracing::warn!("no TLS certificate provided - generating a self-signed certificate");
            tracing::warn!("this is NOT suitable for production use");
            let dir = std::env::temp_dir();
            let cert_path = dir.join("msgframe-server-self-signed.cert.pem");
            let key_path = dir.join("msgframe-server-self-signed.key.pem");
            msgframe_server::transport::write_self_signed_pair(&cert_path, &key_path)?;
            Some(ServerTlsConfig {
                cert_path,
                key_path,
                mutually_authenticate: args.mutually_authenticate,
                client_ca_path: args.client_ca.clone(),
                handshake_timeout: Duration::from_secs(5),
            })
        },
        _ => return Err("--cert and --key must be provided together".into()),
    };

    let config = ServerConfig {
        max_connections: args.max_connections,
        permitted_ips: args.permitted_ips,
        preshared_key,
        idle_client_timeout: Duration::from_secs(args.idle_timeout_secs),
        mutually_authenticate: args.mutually_authenticate,
        ..ServerConfig::default()
    };

    let (server, mut events) = ServerEndpoint::start(&args.bind, config, tls.as_ref()).await?;
    tracing::info!(addr = %server.local_addr()?, "server listening");

    while let Some(event) = events.recv().await {
        tracing::debug!(?event, "server event");
    }

    Ok(())
}
