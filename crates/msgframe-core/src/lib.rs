//! Sans-IO session state machine and concurrent I/O core for the msgframe
//! wire protocol.
//!
//! Layering: [`msgframe_proto`] owns the wire format; this crate owns
//! connection lifecycle (`session`), the reader/writer core that drives it
//! off a real transport (`connection_io`), synchronous request/response
//! correlation (`sync_registry`), the environment abstraction used for
//! deterministic tests (`env`), and shared configuration (`config`).
//! `msgframe-client`/`msgframe-server` add the TCP/TLS transport and the
//! public, role-specific API on top.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod connection_io;
pub mod env;
pub mod error;
pub mod session;
pub mod sync_registry;

pub use config::{ClientConfig, ServerConfig, TcpKeepalive, TransportConfig};
pub use connection_io::{ConnectionIO, PayloadSource};
pub use env::{Environment, RealEnvironment};
pub use error::SessionError;
pub use session::{
    DisconnectReason, HeaderDecision, InboundPayload, Role, Session, SessionAction, SessionConfig,
    SessionEvent, SessionState,
};
pub use sync_registry::{SyncRegistry, SyncResponse, MIN_TIMEOUT};
