//! Error types for the relay core.
//!
//! Missing records are not errors: lookups return `Option`. A push that
//! fails with "connection gone" is handled by cleanup and never surfaces
//! here.

use rendezvous_protocol::ProtocolError;
use rendezvous_transport::PushError;
use thiserror::Error;

/// Storage errors. Always fatal for the operation that hit them.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Storage error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Non-terminal push failure.
    #[error("Push failed: {0}")]
    Push(#[from] PushError),

    /// Encoding failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The fan-out worker is no longer accepting jobs.
    #[error("Fan-out dispatcher closed")]
    DispatchClosed,
}
