//! Presence tracking for Rendezvous.
//!
//! Each connection moves `Disconnected -> Connected -> Disconnected`. A
//! reconnect of the same identity replaces the previous registry entry, and
//! with eviction enabled also closes the previous session first.

use rendezvous_protocol::{codec, server_time, PresenceEvent};
use rendezvous_transport::PushTransport;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{AudienceScope, RelayConfig};
use crate::dispatch::{Dispatcher, FanoutJob};
use crate::error::RelayError;
use crate::store::ConnectionStore;

/// Handles connect and disconnect events.
pub struct PresenceManager {
    store: Arc<dyn ConnectionStore>,
    transport: Arc<dyn PushTransport>,
    dispatcher: Arc<dyn Dispatcher>,
    config: RelayConfig,
}

impl PresenceManager {
    /// Create a presence manager.
    #[must_use]
    pub fn new(
        store: Arc<dyn ConnectionStore>,
        transport: Arc<dyn PushTransport>,
        dispatcher: Arc<dyn Dispatcher>,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            transport,
            dispatcher,
            config,
        }
    }

    /// Register a new connection and announce it.
    ///
    /// Returns the presence event that was handed off for fan-out.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the dispatcher is closed.
    pub async fn connect(
        &self,
        identity: &str,
        handle: &str,
        channel: Option<&str>,
    ) -> Result<PresenceEvent, RelayError> {
        if self.config.evict_on_reconnect {
            self.evict_previous(identity, handle).await?;
        }

        self.store.put(identity, handle, channel).await?;
        let user_count = self.store.count().await?;

        let event = PresenceEvent::connect(identity, user_count, server_time());
        self.dispatcher
            .dispatch(FanoutJob::Broadcast {
                payload: codec::encode(&event)?,
                audience: self.config.audience_for(channel),
                skip: Some(handle.to_string()),
            })
            .await?;

        info!(
            identity = %identity,
            connection = %handle,
            channel = ?channel,
            users = user_count,
            "Connected"
        );
        Ok(event)
    }

    /// Remove a connection and announce its departure.
    ///
    /// The handle may already have been evicted or cleaned up; the event is
    /// then announced without a `source`. Under channel scope such a handle
    /// has no channel to announce to, so nothing is sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the dispatcher is closed.
    pub async fn disconnect(&self, handle: &str) -> Result<PresenceEvent, RelayError> {
        let record = self.store.record_for_handle(handle).await?;
        if record.is_none() {
            debug!(connection = %handle, "Disconnect of unregistered handle");
        }

        self.store.remove(handle).await?;
        let user_count = self.store.count().await?;

        let channel = record.as_ref().and_then(|r| r.channel_name.as_deref());
        let audience = self.config.audience_for(channel);
        let source = record.as_ref().map(|r| r.identity.clone());

        let event = PresenceEvent::disconnect(source, user_count, server_time());
        if record.is_none() && self.config.audience == AudienceScope::Channel {
            debug!(connection = %handle, "Unscoped disconnect not announced");
            return Ok(event);
        }

        self.dispatcher
            .dispatch(FanoutJob::Broadcast {
                payload: codec::encode(&event)?,
                audience,
                skip: Some(handle.to_string()),
            })
            .await?;

        info!(
            identity = ?event.source,
            connection = %handle,
            users = user_count,
            "Disconnected"
        );
        Ok(event)
    }

    async fn evict_previous(&self, identity: &str, handle: &str) -> Result<(), RelayError> {
        let Some(previous) = self.store.get_handle(identity).await? else {
            return Ok(());
        };
        if previous == handle {
            return Ok(());
        }

        self.store.remove(&previous).await?;
        if let Err(e) = self.transport.disconnect(&previous).await {
            warn!(identity = %identity, connection = %previous, error = %e, "Failed to close evicted session");
        }
        info!(identity = %identity, previous = %previous, connection = %handle, "Evicted previous connection");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::InlineDispatcher;
    use crate::fanout::Fanout;
    use crate::store::MemoryConnectionStore;
    use rendezvous_protocol::EventType;
    use rendezvous_transport::{LocalHub, Outbound};
    use serde_json::Value;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        presence: PresenceManager,
        store: Arc<MemoryConnectionStore>,
        hub: Arc<LocalHub>,
    }

    fn fixture(config: RelayConfig) -> Fixture {
        let store = Arc::new(MemoryConnectionStore::new());
        let hub = Arc::new(LocalHub::new());
        let fanout = Arc::new(Fanout::new(store.clone(), hub.clone()));
        let presence = PresenceManager::new(
            store.clone(),
            hub.clone(),
            Arc::new(InlineDispatcher::new(fanout)),
            config,
        );
        Fixture {
            presence,
            store,
            hub,
        }
    }

    fn next_json(rx: &mut UnboundedReceiver<Outbound>) -> Value {
        match rx.try_recv().expect("expected a frame") {
            Outbound::Payload(bytes) => serde_json::from_slice(&bytes).unwrap(),
            Outbound::Close => panic!("unexpected close"),
        }
    }

    #[tokio::test]
    async fn test_connect_registers_and_announces() {
        let f = fixture(RelayConfig::default());
        let mut alice_rx = f.hub.register("c1");
        f.presence.connect("alice", "c1", None).await.unwrap();

        let mut bob_rx = f.hub.register("c2");
        let event = f.presence.connect("bob", "c2", None).await.unwrap();

        assert_eq!(event.event_type, EventType::Connect);
        assert_eq!(event.user_count, Some(2));
        assert_eq!(f.store.get_handle("bob").await.unwrap().as_deref(), Some("c2"));
        assert_eq!(f.store.get_identity("c2").await.unwrap().as_deref(), Some("bob"));

        let seen = next_json(&mut alice_rx);
        assert_eq!(seen["eventType"], "connect");
        assert_eq!(seen["source"], "bob");
        assert_eq!(seen["userCount"], 2);
        assert!(seen["st"].is_u64());
        // The connecting session is skipped.
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconnect_evicts_previous_session() {
        let f = fixture(RelayConfig::default());
        let mut old_rx = f.hub.register("c1");
        f.presence.connect("alice", "c1", None).await.unwrap();

        let _new_rx = f.hub.register("c2");
        let event = f.presence.connect("alice", "c2", None).await.unwrap();

        assert_eq!(event.user_count, Some(1));
        assert_eq!(f.store.get_handle("alice").await.unwrap().as_deref(), Some("c2"));
        assert_eq!(f.store.get_identity("c1").await.unwrap(), None);
        assert_eq!(old_rx.try_recv().unwrap(), Outbound::Close);
        assert!(!f.hub.is_registered("c1"));
    }

    #[tokio::test]
    async fn test_reconnect_without_eviction_keeps_single_record() {
        let f = fixture(RelayConfig {
            evict_on_reconnect: false,
            ..Default::default()
        });
        let mut old_rx = f.hub.register("c1");
        f.presence.connect("alice", "c1", None).await.unwrap();
        let _new_rx = f.hub.register("c2");
        f.presence.connect("alice", "c2", None).await.unwrap();

        assert_eq!(f.store.count().await.unwrap(), 1);
        assert_eq!(f.store.get_identity("c1").await.unwrap(), None);
        // The old session is left open but no longer addressable.
        assert!(f.hub.is_registered("c1"));
        assert!(old_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_announces_departure() {
        let f = fixture(RelayConfig::default());
        let mut alice_rx = f.hub.register("c1");
        f.presence.connect("alice", "c1", None).await.unwrap();
        let _bob_rx = f.hub.register("c2");
        f.presence.connect("bob", "c2", None).await.unwrap();
        let _ = next_json(&mut alice_rx);

        let event = f.presence.disconnect("c2").await.unwrap();

        assert_eq!(event.source.as_deref(), Some("bob"));
        assert_eq!(event.user_count, Some(1));
        assert_eq!(f.store.get_identity("c2").await.unwrap(), None);

        let seen = next_json(&mut alice_rx);
        assert_eq!(seen["eventType"], "disconnect");
        assert_eq!(seen["source"], "bob");
    }

    #[tokio::test]
    async fn test_disconnect_of_unknown_handle_omits_source() {
        let f = fixture(RelayConfig::default());
        let mut alice_rx = f.hub.register("c1");
        f.presence.connect("alice", "c1", None).await.unwrap();

        let event = f.presence.disconnect("ghost").await.unwrap();

        assert_eq!(event.source, None);
        let seen = next_json(&mut alice_rx);
        assert!(seen.get("source").is_none());
        assert_eq!(seen["userCount"], 1);
    }

    #[tokio::test]
    async fn test_channel_scope_limits_presence_audience() {
        let f = fixture(RelayConfig {
            audience: AudienceScope::Channel,
            ..Default::default()
        });
        let mut red_rx = f.hub.register("c1");
        f.presence.connect("alice", "c1", Some("red")).await.unwrap();
        let mut blue_rx = f.hub.register("c2");
        f.presence.connect("bob", "c2", Some("blue")).await.unwrap();

        let _carol_rx = f.hub.register("c3");
        f.presence.connect("carol", "c3", Some("red")).await.unwrap();

        assert_eq!(next_json(&mut red_rx)["source"], "carol");
        assert!(blue_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_channel_scope_skips_unresolved_disconnect() {
        let f = fixture(RelayConfig {
            audience: AudienceScope::Channel,
            ..Default::default()
        });
        let mut red_rx = f.hub.register("c1");
        f.presence.connect("alice", "c1", Some("red")).await.unwrap();
        let mut blue_rx = f.hub.register("c2");
        f.presence.connect("bob", "c2", Some("blue")).await.unwrap();

        let event = f.presence.disconnect("ghost").await.unwrap();
        assert_eq!(event.source, None);
        assert_eq!(event.user_count, Some(2));
        assert!(red_rx.try_recv().is_err());
        assert!(blue_rx.try_recv().is_err());
    }
}
