//! # rendezvous-protocol
//!
//! Wire protocol definitions for the Rendezvous relay.
//!
//! Clients speak plain JSON text frames over a WebSocket. Every structured
//! frame carries an `eventType` discriminator; the server stamps its own
//! clock into `st` before anything leaves the relay.
//!
//! ## Event Types
//!
//! - `connect` / `disconnect` - Presence events fanned out by the server
//! - `ping` / `pong` - Keep-alive with an optional echoed correlation token
//! - `requestList` / `list` - Snapshot of connected identities
//! - `match`, `extendChat`, `matchCancel`, `matchResponse` - Point-to-point notify
//!
//! ## Example
//!
//! ```rust
//! use rendezvous_protocol::{classify, Inbound, KEEP_ALIVE_TOKEN};
//!
//! assert!(matches!(classify(KEEP_ALIVE_TOKEN), Inbound::KeepAlive));
//! assert!(matches!(classify("not json"), Inbound::Opaque(_)));
//! ```

pub mod codec;
pub mod events;

pub use codec::{classify, encode, Inbound, InboundEvent, ProtocolError};
pub use events::{
    server_time, AidEntry, EventType, ListReply, NotifyFields, Pong, PresenceEvent,
    KEEP_ALIVE_TOKEN,
};
