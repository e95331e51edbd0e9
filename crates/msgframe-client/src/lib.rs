//! Client endpoint for the msgframe wire protocol.
//!
//! # Architecture
//!
//! [`ClientEndpoint`] wraps one [`msgframe_core::Session`] over a real TCP
//! (optionally TLS-wrapped) connection. The session itself stays pure --
//! every decision it makes comes back as a list of
//! [`msgframe_core::SessionAction`]s -- and this crate is the thin shell
//! that actually writes bytes to the socket, spawns the reader task, and
//! turns [`msgframe_core::SessionEvent`]s into the [`ClientEvent`]s callers
//! see.
//!
//! # Components
//!
//! - [`ClientEndpoint`]: connect, authenticate, send, and disconnect
//! - [`ClientEvent`]: events delivered over the channel returned by
//!   [`ClientEndpoint::connect`]
//! - [`ClientError`]: the error type every fallible method here returns
//! - [`transport::ClientTlsConfig`]: optional TLS parameters for `connect`

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod client;
mod error;
mod event;
pub mod transport;

pub use client::ClientEndpoint;
pub use error::ClientError;
pub use event::ClientEvent;
pub use transport::ClientTlsConfig;
