//! # rendezvous-transport
//!
//! Transport abstraction layer for the Rendezvous relay.
//!
//! The relay never holds sockets directly. It addresses sessions by an
//! opaque connection handle and asks a [`PushTransport`] to deliver bytes.
//! A push either succeeds, fails with [`PushError::Gone`] (the session no
//! longer exists and its registry entry should be dropped), or fails with
//! anything else, which is fatal for the event being handled.
//!
//! ```rust,ignore
//! use rendezvous_transport::{LocalHub, PushTransport};
//!
//! let hub = LocalHub::new();
//! let mut rx = hub.register("conn_1");
//! hub.push("conn_1", bytes::Bytes::from_static(b"hello")).await?;
//! ```

pub mod hub;
pub mod traits;

pub use hub::{LocalHub, Outbound};
pub use traits::{ConnectionHandle, PushError, PushTransport};
