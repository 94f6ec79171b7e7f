//! Connection registry for Rendezvous.
//!
//! Maps an identity to at most one live connection handle, with a reverse
//! lookup from handle to identity and an optional channel partition.

use async_trait::async_trait;
use dashmap::DashMap;
use rendezvous_protocol::server_time;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, trace};

use crate::error::StoreError;

/// A live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    /// Identity (primary key).
    pub identity: String,
    /// Transport handle (secondary index).
    pub connection_handle: String,
    /// Channel the connection joined, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    /// When the connection was registered.
    pub connected_at: u64,
    /// Last keep-alive seen on this connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ping_at: Option<u64>,
}

impl ConnectionRecord {
    /// Create a new record stamped with the current server time.
    #[must_use]
    pub fn new(
        identity: impl Into<String>,
        connection_handle: impl Into<String>,
        channel_name: Option<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            connection_handle: connection_handle.into(),
            channel_name,
            connected_at: server_time(),
            last_ping_at: None,
        }
    }
}

/// Key-value connection registry with a handle index.
///
/// Operations on a missing key are no-ops. Lookups return `None` for
/// "not found"; `Err` is reserved for storage failures.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Upsert the record for `identity`, replacing any prior record.
    async fn put(
        &self,
        identity: &str,
        handle: &str,
        channel: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Reverse lookup of the identity owning `handle`.
    async fn get_identity(&self, handle: &str) -> Result<Option<String>, StoreError>;

    /// Current handle of `identity`.
    async fn get_handle(&self, identity: &str) -> Result<Option<String>, StoreError>;

    /// Full record of `identity`.
    async fn get_record(&self, identity: &str) -> Result<Option<ConnectionRecord>, StoreError>;

    /// Remove the record owning `handle`. No-op if none does.
    async fn remove(&self, handle: &str) -> Result<(), StoreError>;

    /// All records, optionally restricted to one channel.
    async fn list_all(&self, channel: Option<&str>) -> Result<Vec<ConnectionRecord>, StoreError>;

    /// Live connection count. May be approximate.
    async fn count(&self) -> Result<usize, StoreError>;

    /// Refresh `last_ping_at` for the identity owning `handle`.
    async fn touch_ping(&self, handle: &str) -> Result<(), StoreError>;

    /// Record owning `handle`, resolved through the handle index.
    async fn record_for_handle(&self, handle: &str) -> Result<Option<ConnectionRecord>, StoreError> {
        let Some(identity) = self.get_identity(handle).await? else {
            return Ok(None);
        };
        Ok(self
            .get_record(&identity)
            .await?
            .filter(|record| record.connection_handle == handle))
    }
}

/// In-memory connection store.
///
/// Keeps the "one record per identity" and "one record per handle"
/// invariants under concurrent writers by only ever removing index entries
/// that still point at the record being replaced.
#[derive(Debug, Default)]
pub struct MemoryConnectionStore {
    /// Records by identity.
    records: DashMap<String, ConnectionRecord>,
    /// Handle index (handle -> identity).
    handles: DashMap<String, String>,
}

impl MemoryConnectionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the channel names in use with their connection counts.
    #[must_use]
    pub fn channel_counts(&self) -> Vec<(String, usize)> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for record in self.records.iter() {
            if let Some(channel) = &record.channel_name {
                *counts.entry(channel.clone()).or_default() += 1;
            }
        }
        counts.into_iter().collect()
    }
}

#[async_trait]
impl ConnectionStore for MemoryConnectionStore {
    async fn put(
        &self,
        identity: &str,
        handle: &str,
        channel: Option<&str>,
    ) -> Result<(), StoreError> {
        let record = ConnectionRecord::new(identity, handle, channel.map(str::to_owned));

        if let Some(prev) = self.records.insert(identity.to_string(), record) {
            if prev.connection_handle != handle {
                self.handles
                    .remove_if(&prev.connection_handle, |_, owner| owner == identity);
                debug!(
                    identity = %identity,
                    previous = %prev.connection_handle,
                    connection = %handle,
                    "Replaced connection record"
                );
            }
        }

        if let Some(prev_owner) = self
            .handles
            .insert(handle.to_string(), identity.to_string())
        {
            if prev_owner != identity {
                self.records
                    .remove_if(&prev_owner, |_, r| r.connection_handle == handle);
            }
        }

        trace!(identity = %identity, connection = %handle, "Connection stored");
        Ok(())
    }

    async fn get_identity(&self, handle: &str) -> Result<Option<String>, StoreError> {
        Ok(self.handles.get(handle).map(|owner| owner.value().clone()))
    }

    async fn get_handle(&self, identity: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .records
            .get(identity)
            .map(|r| r.connection_handle.clone()))
    }

    async fn get_record(&self, identity: &str) -> Result<Option<ConnectionRecord>, StoreError> {
        Ok(self.records.get(identity).map(|r| r.value().clone()))
    }

    async fn remove(&self, handle: &str) -> Result<(), StoreError> {
        let Some(identity) = self.get_identity(handle).await? else {
            trace!(connection = %handle, "Remove of unknown handle");
            return Ok(());
        };

        self.records
            .remove_if(&identity, |_, r| r.connection_handle == handle);
        self.handles.remove_if(handle, |_, owner| *owner == identity);

        debug!(identity = %identity, connection = %handle, "Connection removed");
        Ok(())
    }

    async fn list_all(&self, channel: Option<&str>) -> Result<Vec<ConnectionRecord>, StoreError> {
        Ok(self
            .records
            .iter()
            .filter(|r| channel.map_or(true, |c| r.channel_name.as_deref() == Some(c)))
            .map(|r| r.value().clone())
            .collect())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.records.len())
    }

    async fn touch_ping(&self, handle: &str) -> Result<(), StoreError> {
        let Some(identity) = self.get_identity(handle).await? else {
            return Ok(());
        };
        if let Some(mut record) = self.records.get_mut(&identity) {
            if record.connection_handle == handle {
                record.last_ping_at = Some(server_time());
            }
        }
        Ok(())
    }
}
