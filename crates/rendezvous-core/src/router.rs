//! Inbound frame routing for Rendezvous.
//!
//! Every text frame received on an established connection goes through
//! [`Router::handle_frame`], which classifies it and picks one of three
//! delivery shapes:
//!
//! - a direct reply to the sender (`ping`, `requestList`)
//! - a point-to-point notify to one target identity (`match` and friends)
//! - a broadcast to the sender's audience, skipping the sender
//!
//! Replies are pushed on the caller's task. Notifies and broadcasts are
//! handed to the [`Dispatcher`].

use bytes::Bytes;
use rand::seq::SliceRandom;
use rendezvous_protocol::{
    classify, codec, server_time, EventType, Inbound, InboundEvent, ListReply, Pong,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::config::{AudienceScope, RelayConfig};
use crate::dispatch::{Dispatcher, FanoutJob};
use crate::error::RelayError;
use crate::fanout::{Audience, Fanout};
use crate::matching::MatchCoordinator;
use crate::store::ConnectionStore;

/// What the router did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Answered a keep-alive or `ping` directly.
    Pong,
    /// Answered `requestList` with `count` identities.
    Listed { count: usize },
    /// Handed a notify-class event to its target. `target` is `None` when
    /// the event named nobody and was dropped.
    Notified {
        kind: EventType,
        target: Option<String>,
    },
    /// Broadcast a stamped event.
    Broadcast,
    /// Relayed an unparseable frame untouched.
    Opaque,
}

/// Classifies inbound frames and routes them.
pub struct Router {
    fanout: Arc<Fanout>,
    dispatcher: Arc<dyn Dispatcher>,
    matches: MatchCoordinator,
    config: RelayConfig,
}

impl Router {
    /// Create a router.
    #[must_use]
    pub fn new(
        fanout: Arc<Fanout>,
        dispatcher: Arc<dyn Dispatcher>,
        matches: MatchCoordinator,
        config: RelayConfig,
    ) -> Self {
        Self {
            fanout,
            dispatcher,
            matches,
            config,
        }
    }

    fn store(&self) -> &Arc<dyn ConnectionStore> {
        self.fanout.store()
    }

    /// Route one inbound text frame from `handle`.
    ///
    /// # Errors
    ///
    /// Returns an error if a store operation fails, a direct reply fails
    /// non-terminally, or the dispatcher is closed. Malformed frames are not
    /// errors.
    pub async fn handle_frame(&self, handle: &str, frame: &str) -> Result<FrameOutcome, RelayError> {
        match classify(frame) {
            Inbound::KeepAlive => {
                trace!(connection = %handle, "Keep-alive");
                self.pong(handle, None).await
            }
            Inbound::Opaque(raw) => {
                debug!(connection = %handle, len = raw.len(), "Relaying opaque frame");
                self.dispatcher
                    .dispatch(FanoutJob::Broadcast {
                        payload: Bytes::from(raw),
                        audience: Audience::All,
                        skip: Some(handle.to_string()),
                    })
                    .await?;
                Ok(FrameOutcome::Opaque)
            }
            Inbound::Event(event) => match event.kind() {
                Some(EventType::Ping) => {
                    let t = event.get("t").cloned();
                    self.pong(handle, t).await
                }
                Some(EventType::RequestList) => self.list(handle, &event).await,
                Some(kind) if kind.is_notify() => self.notify(handle, event, kind).await,
                _ => self.broadcast(handle, event).await,
            },
        }
    }

    async fn pong(&self, handle: &str, t: Option<Value>) -> Result<FrameOutcome, RelayError> {
        if self.config.touch_on_keepalive {
            self.store().touch_ping(handle).await?;
        }
        let payload = codec::encode(&Pong::new(server_time(), t))?;
        self.fanout.reply(handle, payload).await?;
        Ok(FrameOutcome::Pong)
    }

    async fn list(&self, handle: &str, event: &InboundEvent) -> Result<FrameOutcome, RelayError> {
        let audience = self.sender_audience(handle).await?;
        let mut identities: Vec<String> = self
            .store()
            .list_all(audience.channel())
            .await?
            .into_iter()
            .map(|record| record.identity)
            .collect();

        // A non-numeric limit is ignored.
        if let Some(limit) = event.get("limit").and_then(Value::as_u64) {
            identities.shuffle(&mut rand::rng());
            identities.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }

        let reply = ListReply::new(identities, server_time());
        let count = reply.user_count;
        self.fanout.reply(handle, codec::encode(&reply)?).await?;

        debug!(connection = %handle, audience = ?audience, count, "Listed connections");
        Ok(FrameOutcome::Listed { count })
    }

    async fn notify(
        &self,
        handle: &str,
        mut event: InboundEvent,
        kind: EventType,
    ) -> Result<FrameOutcome, RelayError> {
        let fields = event.notify_fields();
        let sender = self.store().get_identity(handle).await?;
        event.stamp(server_time(), sender.as_deref());

        let Some(target) = fields.target.clone() else {
            warn!(connection = %handle, event = %kind, "Notify without target dropped");
            return Ok(FrameOutcome::Notified { kind, target: None });
        };

        match (sender.as_deref(), fields.t) {
            (Some(sender), Some(t)) => match kind {
                EventType::Match => {
                    self.matches.record_match_request(sender, &target, t).await?;
                }
                EventType::MatchResponse => {
                    self.matches
                        .record_match_response(sender, &target, t, &fields)
                        .await?;
                }
                EventType::MatchCancel => {
                    self.matches
                        .record_match_cancel(sender, &target, t, &fields)
                        .await?;
                }
                _ => {}
            },
            _ if kind == EventType::ExtendChat => {}
            (sender, t) => {
                warn!(
                    connection = %handle,
                    event = %kind,
                    sender = ?sender,
                    t = ?t,
                    "Match bookkeeping skipped"
                );
            }
        }

        self.dispatcher
            .dispatch(FanoutJob::Notify {
                target: target.clone(),
                payload: event.encode()?,
            })
            .await?;

        debug!(connection = %handle, event = %kind, target = %target, "Notify dispatched");
        Ok(FrameOutcome::Notified {
            kind,
            target: Some(target),
        })
    }

    async fn broadcast(
        &self,
        handle: &str,
        mut event: InboundEvent,
    ) -> Result<FrameOutcome, RelayError> {
        let sender = self.store().record_for_handle(handle).await?;
        event.stamp(server_time(), sender.as_ref().map(|r| r.identity.as_str()));

        let channel = sender.as_ref().and_then(|r| r.channel_name.as_deref());
        self.dispatcher
            .dispatch(FanoutJob::Broadcast {
                payload: event.encode()?,
                audience: self.config.audience_for(channel),
                skip: Some(handle.to_string()),
            })
            .await?;

        debug!(connection = %handle, event = ?event.tag(), "Broadcast dispatched");
        Ok(FrameOutcome::Broadcast)
    }

    async fn sender_audience(&self, handle: &str) -> Result<Audience, RelayError> {
        if self.config.audience == AudienceScope::Global {
            return Ok(Audience::All);
        }
        let record = self.store().record_for_handle(handle).await?;
        Ok(self
            .config
            .audience_for(record.as_ref().and_then(|r| r.channel_name.as_deref())))
    }
}
