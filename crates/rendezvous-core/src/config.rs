//! Relay policy configuration.

use serde::{Deserialize, Serialize};

use crate::fanout::Audience;

/// Which connections form the audience of presence, listing, and broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudienceScope {
    /// Every connection is one global audience.
    #[default]
    Global,
    /// Connections are partitioned by the channel they joined with.
    Channel,
}

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Audience scope for this deployment.
    pub audience: AudienceScope,
    /// Close and remove a previous session when an identity reconnects.
    pub evict_on_reconnect: bool,
    /// Refresh `lastPingAt` on keep-alive and `ping` frames.
    pub touch_on_keepalive: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            audience: AudienceScope::Global,
            evict_on_reconnect: true,
            touch_on_keepalive: true,
        }
    }
}

impl RelayConfig {
    /// Resolve the audience for a connection in the given channel.
    ///
    /// Under channel scope, a connection without a channel falls back to the
    /// global audience.
    #[must_use]
    pub fn audience_for(&self, channel: Option<&str>) -> Audience {
        match (self.audience, channel) {
            (AudienceScope::Channel, Some(name)) => Audience::Channel(name.to_string()),
            _ => Audience::All,
        }
    }
}
