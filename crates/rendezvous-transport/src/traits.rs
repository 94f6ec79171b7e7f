//! Transport abstraction traits for Rendezvous.
//!
//! These traits define the "push to connection" capability the relay core
//! consumes, keeping it independent of the socket layer.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

static HANDLE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Transport-assigned identifier for one live socket session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub String);

impl ConnectionHandle {
    /// Create a connection handle from an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, process-unique connection handle.
    #[must_use]
    pub fn generate() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let counter = HANDLE_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", timestamp, counter))
    }

    /// Get the handle as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionHandle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionHandle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Push errors.
#[derive(Debug, Clone, Error)]
pub enum PushError {
    /// The remote endpoint no longer exists. Terminal for that handle only.
    #[error("Connection gone: {0}")]
    Gone(String),

    /// Failed to hand the payload to the connection.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl PushError {
    /// Whether this is the terminal "connection gone" signal.
    #[must_use]
    pub fn is_gone(&self) -> bool {
        matches!(self, PushError::Gone(_))
    }
}

/// Addressable, at-most-once, best-effort delivery to a connection handle.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Push a payload to a connection.
    async fn push(&self, handle: &str, payload: Bytes) -> Result<(), PushError>;

    /// Close a connection from the server side.
    ///
    /// Transports without a close capability treat this as a no-op.
    async fn disconnect(&self, handle: &str) -> Result<(), PushError> {
        let _ = handle;
        Ok(())
    }

    /// Get the transport name.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_generation() {
        let h1 = ConnectionHandle::generate();
        let h2 = ConnectionHandle::generate();
        assert_ne!(h1, h2);
        assert!(h1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_handle_from_string() {
        let handle: ConnectionHandle = "c1".into();
        assert_eq!(handle.as_str(), "c1");
        assert_eq!(handle.to_string(), "c1");
    }

    #[test]
    fn test_gone_classification() {
        assert!(PushError::Gone("c1".into()).is_gone());
        assert!(!PushError::SendFailed("boom".into()).is_gone());
        assert!(!PushError::Other("boom".into()).is_gone());
    }
}
