//! In-process transport backing live WebSocket sessions.
//!
//! Each session registers an unbounded channel; its socket task drains the
//! receiver and writes to the wire. A handle that is unknown, or whose
//! receiver has been dropped, is reported as [`PushError::Gone`].

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::traits::{PushError, PushTransport};

/// An item queued for a session's socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A text payload to write.
    Payload(Bytes),
    /// The server is closing this session.
    Close,
}

/// Registry of live sessions, keyed by connection handle.
#[derive(Debug, Default)]
pub struct LocalHub {
    sessions: DashMap<String, mpsc::UnboundedSender<Outbound>>,
}

impl LocalHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and get the receiver its socket task drains.
    ///
    /// Registering an existing handle replaces the previous session.
    pub fn register(&self, handle: impl Into<String>) -> mpsc::UnboundedReceiver<Outbound> {
        let handle = handle.into();
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(connection = %handle, "Session registered");
        self.sessions.insert(handle, tx);
        rx
    }

    /// Remove a session.
    ///
    /// Returns `true` if the session was registered.
    pub fn unregister(&self, handle: &str) -> bool {
        let removed = self.sessions.remove(handle).is_some();
        if removed {
            debug!(connection = %handle, "Session unregistered");
        }
        removed
    }

    /// Check if a session is registered.
    #[must_use]
    pub fn is_registered(&self, handle: &str) -> bool {
        self.sessions.contains_key(handle)
    }

    /// Get the number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if no sessions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn send(&self, handle: &str, item: Outbound) -> Result<(), PushError> {
        let Some(tx) = self.sessions.get(handle).map(|s| s.value().clone()) else {
            return Err(PushError::Gone(handle.to_string()));
        };

        if tx.send(item).is_err() {
            // Socket task has exited without unregistering.
            self.sessions.remove(handle);
            return Err(PushError::Gone(handle.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PushTransport for LocalHub {
    async fn push(&self, handle: &str, payload: Bytes) -> Result<(), PushError> {
        trace!(connection = %handle, bytes = payload.len(), "Push");
        self.send(handle, Outbound::Payload(payload))
    }

    async fn disconnect(&self, handle: &str) -> Result<(), PushError> {
        let result = self.send(handle, Outbound::Close);
        self.sessions.remove(handle);
        match result {
            Err(e) if e.is_gone() => Ok(()),
            other => other,
        }
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_to_registered_session() {
        let hub = LocalHub::new();
        let mut rx = hub.register("c1");

        hub.push("c1", Bytes::from_static(b"hello")).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(Outbound::Payload(Bytes::from_static(b"hello")))
        );
    }

    #[tokio::test]
    async fn test_push_to_unknown_handle_is_gone() {
        let hub = LocalHub::new();
        let err = hub.push("missing", Bytes::new()).await.unwrap_err();
        assert!(err.is_gone());
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_gone() {
        let hub = LocalHub::new();
        let rx = hub.register("c1");
        drop(rx);

        let err = hub.push("c1", Bytes::new()).await.unwrap_err();
        assert!(err.is_gone());
        assert!(!hub.is_registered("c1"));
    }

    #[tokio::test]
    async fn test_disconnect_sends_close() {
        let hub = LocalHub::new();
        let mut rx = hub.register("c1");

        hub.disconnect("c1").await.unwrap();

        assert_eq!(rx.recv().await, Some(Outbound::Close));
        assert!(!hub.is_registered("c1"));
        // Closing twice is harmless.
        hub.disconnect("c1").await.unwrap();
    }

    #[test]
    fn test_register_unregister() {
        let hub = LocalHub::new();
        let _rx = hub.register("c1");
        let _rx2 = hub.register("c2");
        assert_eq!(hub.len(), 2);

        assert!(hub.unregister("c1"));
        assert!(!hub.unregister("c1"));
        assert_eq!(hub.len(), 1);
    }
}
