//! Plain option structs carrying the documented defaults. Constructed via
//! builder-style setters; never via inheritance or trait objects.

use std::net::IpAddr;
use std::time::Duration;

/// TCP keepalive triad, only meaningful when `enable_tcp_keepalives` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpKeepalive {
    /// Idle time before the first probe.
    pub time: Duration,
    /// Interval between probes.
    pub interval: Duration,
    /// Probes sent before the connection is considered dead.
    pub retry_count: u32,
}

impl Default for TcpKeepalive {
    fn default() -> Self {
        Self {
            time: Duration::from_secs(30),
            interval: Duration::from_secs(5),
            retry_count: 3,
        }
    }
}

/// Shared options for both client and server endpoints.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Read/write buffer size. Must be > 0.
    pub stream_buffer_size: usize,
    /// Payloads at or above this size are streamed to the registered
    /// handler rather than materialized in memory.
    pub max_proxied_stream_size: u64,
    /// Enables TCP keepalive probes using `tcp_keepalive`.
    pub enable_tcp_keepalives: bool,
    /// The keepalive triad, used only when `enable_tcp_keepalives` is set.
    pub tcp_keepalive: TcpKeepalive,
    /// Enables verbose per-frame tracing at `DEBUG` level.
    pub debug_messages: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            stream_buffer_size: 65_536,
            max_proxied_stream_size: 64 * 1024 * 1024,
            enable_tcp_keepalives: false,
            tcp_keepalive: TcpKeepalive::default(),
            debug_messages: false,
        }
    }
}

impl TransportConfig {
    /// Sets `stream_buffer_size`.
    #[must_use]
    pub fn with_stream_buffer_size(mut self, size: usize) -> Self {
        self.stream_buffer_size = size;
        self
    }

    /// Sets `max_proxied_stream_size`.
    #[must_use]
    pub fn with_max_proxied_stream_size(mut self, size: u64) -> Self {
        self.max_proxied_stream_size = size;
        self
    }

    /// Enables TCP keepalives with the given triad.
    #[must_use]
    pub fn with_tcp_keepalive(mut self, keepalive: TcpKeepalive) -> Self {
        self.enable_tcp_keepalives = true;
        self.tcp_keepalive = keepalive;
        self
    }

    /// Enables verbose per-frame tracing.
    #[must_use]
    pub fn with_debug_messages(mut self, enabled: bool) -> Self {
        self.debug_messages = enabled;
        self
    }
}

/// Client-side connection options.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Options shared with the server.
    pub transport: TransportConfig,
    /// Maximum time `connect` may take, including the TLS handshake.
    pub connect_timeout: Duration,
    /// Local port to bind before connecting; 0 selects an ephemeral port.
    pub local_port: u16,
    /// How long the connection may sit idle (no inbound or outbound frame)
    /// before the client disconnects. Zero disables the watchdog.
    pub idle_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            connect_timeout: Duration::from_secs(5),
            local_port: 0,
            idle_timeout: Duration::from_secs(0),
        }
    }
}

impl ClientConfig {
    /// Sets `connect_timeout`.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets `local_port`.
    #[must_use]
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    /// Sets `idle_timeout`.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Server-side listener and per-connection options.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Options shared with the client.
    pub transport: TransportConfig,
    /// Maximum number of simultaneously connected clients. Must be > 0.
    pub max_connections: usize,
    /// Literal IPv4/IPv6 addresses allowed to connect. An empty list means
    /// allow-all.
    pub permitted_ips: Vec<IpAddr>,
    /// 16-byte preshared key clients must present before leaving `PreAuth`.
    /// `None` disables the challenge.
    pub preshared_key: Option<[u8; 16]>,
    /// How long a connected client may go without sending a frame before the
    /// server disconnects it. Zero disables the watchdog.
    pub idle_client_timeout: Duration,
    /// Requires the client to present a certificate during the TLS
    /// handshake. Only meaningful when TLS is configured.
    pub mutually_authenticate: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            max_connections: 4_096,
            permitted_ips: Vec::new(),
            preshared_key: None,
            idle_client_timeout: Duration::from_secs(0),
            mutually_authenticate: false,
        }
    }
}

impl ServerConfig {
    /// Sets `max_connections`.
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Restricts inbound connections to `ips`; an empty list allows all.
    #[must_use]
    pub fn with_permitted_ips(mut self, ips: Vec<IpAddr>) -> Self {
        self.permitted_ips = ips;
        self
    }

    /// Requires clients to authenticate with `key` before leaving `PreAuth`.
    #[must_use]
    pub fn with_preshared_key(mut self, key: [u8; 16]) -> Self {
        self.preshared_key = Some(key);
        self
    }

    /// Sets `idle_client_timeout`.
    #[must_use]
    pub fn with_idle_client_timeout(mut self, timeout: Duration) -> Self {
        self.idle_client_timeout = timeout;
        self
    }

    /// Requires mutual TLS authentication.
    #[must_use]
    pub fn with_mutual_authentication(mut self, enabled: bool) -> Self {
        self.mutually_authenticate = enabled;
        self
    }

    /// `true` if `ip` may connect under `permitted_ips` (allow-all when
    /// empty).
    #[must_use]
    pub fn allows_ip(&self, ip: IpAddr) -> bool {
        self.permitted_ips.is_empty() || self.permitted_ips.contains(&ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let transport = TransportConfig::default();
        assert_eq!(transport.stream_buffer_size, 65_536);
        assert_eq!(transport.max_proxied_stream_size, 64 * 1024 * 1024);

        let server = ServerConfig::default();
        assert_eq!(server.max_connections, 4_096);
        assert!(server.preshared_key.is_none());
    }

    #[test]
    fn empty_permitted_ips_allows_everything() {
        let server = ServerConfig::default();
        assert!(server.allows_ip("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn nonempty_permitted_ips_is_a_allowlist() {
        let server =
            ServerConfig::default().with_permitted_ips(vec!["10.0.0.1".parse().unwrap()]);
        assert!(server.allows_ip("10.0.0.1".parse().unwrap()));
        assert!(!server.allows_ip("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn builder_setters_compose() {
        let client = ClientConfig::default()
            .with_connect_timeout(Duration::from_secs(2))
            .with_local_port(4000);
        assert_eq!(client.connect_timeout, Duration::from_secs(2));
        assert_eq!(client.local_port, 4000);
    }
}
