//! # rendezvous-core
//!
//! Connection registry and fan-out protocol for the Rendezvous relay.
//!
//! This crate provides the building blocks every transport event flows
//! through:
//!
//! - **Store** - Identity to connection-handle registry with reverse lookup
//! - **Presence** - Connect/disconnect lifecycle and presence events
//! - **Router** - Classifies inbound frames and routes them to one or many
//! - **Fanout** - Concurrent delivery with lazy stale-connection cleanup
//! - **Dispatch** - Fire-and-forget hand-off to a background fan-out worker
//! - **Matching** - Append-only match result log with single terminal write
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│   Router    │────▶│  Dispatch   │────▶│   Fanout    │
//! │   event     │     │  Presence   │     └─────────────┘     └─────────────┘
//! └─────────────┘     └─────────────┘                                │
//!                        │       │                                   ▼
//!                        ▼       ▼                            ┌─────────────┐
//!                ┌──────────┐ ┌─────────────┐                 │    Store    │
//!                │ Matching │ │    Store    │                 └─────────────┘
//!                └──────────┘ └─────────────┘
//! ```
//!
//! Components hold no state of their own between events; everything shared
//! lives behind the [`ConnectionStore`] and [`MatchResultStore`] traits.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod fanout;
pub mod matching;
pub mod presence;
pub mod router;
pub mod store;

pub use config::{AudienceScope, RelayConfig};
pub use dispatch::{
    Dispatcher, FanoutJob, FanoutWorker, InlineDispatcher, JobReport, QueueDispatcher,
};
pub use error::{RelayError, StoreError};
pub use fanout::{Audience, BroadcastReport, Delivery, Fanout};
pub use matching::{
    MatchCoordinator, MatchResultRecord, MatchResultStore, MatchTerminal,
    MemoryMatchResultStore, TerminalOutcome,
};
pub use presence::PresenceManager;
pub use router::{FrameOutcome, Router};
pub use store::{ConnectionRecord, ConnectionStore, MemoryConnectionStore};
