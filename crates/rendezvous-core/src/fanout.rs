//! Concurrent delivery to connection handles.
//!
//! A push that reports [`PushError::Gone`](rendezvous_transport::PushError)
//! removes the recipient's registry entry and counts as handled. Any other
//! push failure is fatal for the job, but only after every sibling push in
//! the same fan-out has completed.

use bytes::Bytes;
use futures_util::future::join_all;
use rendezvous_transport::PushTransport;
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::error::RelayError;
use crate::store::ConnectionStore;

/// The set of connections a broadcast targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Audience {
    /// Every connection.
    All,
    /// Connections in one channel.
    Channel(String),
}

impl Audience {
    /// The channel filter for store queries.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        match self {
            Audience::All => None,
            Audience::Channel(name) => Some(name),
        }
    }
}

/// Result of a single push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The transport accepted the payload.
    Delivered,
    /// The connection was gone; its record has been removed.
    Stale,
}

/// Summary of a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Recipients the payload was handed to.
    pub delivered: usize,
    /// Recipients found gone and cleaned up.
    pub stale: usize,
}

/// Delivers payloads to one or many connections.
pub struct Fanout {
    store: Arc<dyn ConnectionStore>,
    transport: Arc<dyn PushTransport>,
}

impl Fanout {
    /// Create a fan-out executor.
    #[must_use]
    pub fn new(store: Arc<dyn ConnectionStore>, transport: Arc<dyn PushTransport>) -> Self {
        Self { store, transport }
    }

    /// Get the connection store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ConnectionStore> {
        &self.store
    }

    /// Push to one handle, cleaning up if it is gone.
    ///
    /// # Errors
    ///
    /// Returns an error on a non-terminal push failure, or if cleanup fails.
    pub async fn deliver(&self, handle: &str, payload: Bytes) -> Result<Delivery, RelayError> {
        match self.transport.push(handle, payload).await {
            Ok(()) => {
                trace!(connection = %handle, "Delivered");
                Ok(Delivery::Delivered)
            }
            Err(e) if e.is_gone() => {
                info!(connection = %handle, "Found stale connection");
                self.store.remove(handle).await?;
                Ok(Delivery::Stale)
            }
            Err(e) => Err(RelayError::Push(e)),
        }
    }

    /// Direct reply to the sender of a frame.
    ///
    /// # Errors
    ///
    /// Returns an error on a non-terminal push failure.
    pub async fn reply(&self, handle: &str, payload: Bytes) -> Result<Delivery, RelayError> {
        self.deliver(handle, payload).await
    }

    /// Deliver to exactly the current connection of `target`.
    ///
    /// Returns `None` if the target has no live connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails or the push fails non-terminally.
    pub async fn notify(
        &self,
        target: &str,
        payload: Bytes,
    ) -> Result<Option<Delivery>, RelayError> {
        let Some(handle) = self.store.get_handle(target).await? else {
            debug!(target = %target, "Notify target not connected");
            return Ok(None);
        };
        self.deliver(&handle, payload).await.map(Some)
    }

    /// Deliver to every connection in `audience` except `skip`.
    ///
    /// All pushes run concurrently and are awaited before any fatal error
    /// is returned.
    ///
    /// # Errors
    ///
    /// Returns the first fatal push or storage error.
    pub async fn broadcast(
        &self,
        payload: Bytes,
        audience: &Audience,
        skip: Option<&str>,
    ) -> Result<BroadcastReport, RelayError> {
        let recipients = self.store.list_all(audience.channel()).await?;

        let pushes = recipients
            .iter()
            .filter(|r| skip != Some(r.connection_handle.as_str()))
            .map(|r| self.deliver(&r.connection_handle, payload.clone()));

        let mut report = BroadcastReport::default();
        let mut fatal = None;
        for outcome in join_all(pushes).await {
            match outcome {
                Ok(Delivery::Delivered) => report.delivered += 1,
                Ok(Delivery::Stale) => report.stale += 1,
                Err(e) => {
                    fatal.get_or_insert(e);
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        debug!(
            audience = ?audience,
            delivered = report.delivered,
            stale = report.stale,
            "Broadcast complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::MemoryConnectionStore;
    use async_trait::async_trait;
    use rendezvous_transport::{LocalHub, Outbound, PushError};
    use std::collections::HashSet;
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Transport that fails with a fixed error for chosen handles and
    /// forwards everything else to a hub.
    pub(crate) struct FaultyTransport {
        pub hub: LocalHub,
        pub gone: HashSet<String>,
        pub broken: HashSet<String>,
    }

    #[async_trait]
    impl PushTransport for FaultyTransport {
        async fn push(&self, handle: &str, payload: Bytes) -> Result<(), PushError> {
            if self.gone.contains(handle) {
                return Err(PushError::Gone(handle.to_string()));
            }
            if self.broken.contains(handle) {
                return Err(PushError::SendFailed("socket reset".into()));
            }
            self.hub.push(handle, payload).await
        }

        fn name(&self) -> &'static str {
            "faulty"
        }
    }

    async fn setup(
        names: &[&str],
        gone: &[&str],
        broken: &[&str],
    ) -> (
        Fanout,
        Arc<MemoryConnectionStore>,
        Vec<UnboundedReceiver<Outbound>>,
    ) {
        let store = Arc::new(MemoryConnectionStore::new());
        let hub = LocalHub::new();
        let mut receivers = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let handle = format!("c{}", i + 1);
            store.put(name, &handle, None).await.unwrap();
            receivers.push(hub.register(handle));
        }
        let transport = FaultyTransport {
            hub,
            gone: gone.iter().map(|s| s.to_string()).collect(),
            broken: broken.iter().map(|s| s.to_string()).collect(),
        };
        let fanout = Fanout::new(store.clone(), Arc::new(transport));
        (fanout, store, receivers)
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let (fanout, _store, mut rx) = setup(&["alice", "bob", "carol"], &[], &[]).await;

        let report = fanout
            .broadcast(Bytes::from_static(b"hi"), &Audience::All, Some("c1"))
            .await
            .unwrap();

        assert_eq!(report, BroadcastReport { delivered: 2, stale: 0 });
        assert!(rx[0].try_recv().is_err());
        assert!(rx[1].try_recv().is_ok());
        assert!(rx[2].try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_cleans_up_gone_recipient() {
        let (fanout, store, mut rx) = setup(&["alice", "bob", "carol", "dave"], &["c3"], &[]).await;

        let report = fanout
            .broadcast(Bytes::from_static(b"hi"), &Audience::All, None)
            .await
            .unwrap();

        assert_eq!(report, BroadcastReport { delivered: 3, stale: 1 });
        assert_eq!(store.get_identity("c3").await.unwrap(), None);
        assert_eq!(store.count().await.unwrap(), 3);
        for i in [0, 1, 3] {
            assert_eq!(
                rx[i].try_recv().unwrap(),
                Outbound::Payload(Bytes::from_static(b"hi"))
            );
        }
    }

    #[tokio::test]
    async fn test_broadcast_fatal_error_after_all_pushes() {
        let (fanout, store, mut rx) = setup(&["alice", "bob", "carol"], &["c3"], &["c1"]).await;

        let err = fanout
            .broadcast(Bytes::from_static(b"hi"), &Audience::All, None)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Push(PushError::SendFailed(_))));
        // Siblings still completed.
        assert!(rx[1].try_recv().is_ok());
        assert_eq!(store.get_identity("c3").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_broadcast_to_channel() {
        let store = Arc::new(MemoryConnectionStore::new());
        let hub = Arc::new(LocalHub::new());
        store.put("alice", "c1", Some("red")).await.unwrap();
        store.put("bob", "c2", Some("blue")).await.unwrap();
        let mut rx1 = hub.register("c1");
        let mut rx2 = hub.register("c2");
        let fanout = Fanout::new(store, hub);

        let report = fanout
            .broadcast(
                Bytes::from_static(b"hi"),
                &Audience::Channel("red".into()),
                None,
            )
            .await
            .unwrap();

        assert_eq!(report.delivered, 1);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_to_empty_audience() {
        let (fanout, _store, _rx) = setup(&[], &[], &[]).await;
        let report = fanout
            .broadcast(Bytes::from_static(b"hi"), &Audience::All, None)
            .await
            .unwrap();
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_notify() {
        let (fanout, store, mut rx) = setup(&["alice", "bob"], &[], &[]).await;

        let delivery = fanout
            .notify("bob", Bytes::from_static(b"match"))
            .await
            .unwrap();
        assert_eq!(delivery, Some(Delivery::Delivered));
        assert!(rx[1].try_recv().is_ok());
        assert!(rx[0].try_recv().is_err());

        assert_eq!(
            fanout.notify("nobody", Bytes::new()).await.unwrap(),
            None
        );
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_notify_gone_target() {
        let (fanout, store, _rx) = setup(&["alice", "bob"], &["c2"], &[]).await;

        let delivery = fanout.notify("bob", Bytes::new()).await.unwrap();
        assert_eq!(delivery, Some(Delivery::Stale));
        assert_eq!(store.get_handle("bob").await.unwrap(), None);
    }
}
