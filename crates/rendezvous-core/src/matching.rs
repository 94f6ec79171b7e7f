//! Match result bookkeeping.
//!
//! Every match request opens a row keyed by `(source, timestamp)`. The first
//! response or cancellation closes it; later terminal writes for the same
//! key are rejected by a conditional write and reported as
//! [`TerminalOutcome::AlreadyClosed`]. A response carrying neither an
//! acceptance nor a reason is not terminal and writes nothing. Rows are
//! never deleted.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rendezvous_protocol::{server_time, NotifyFields};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::StoreError;

/// Reason recorded when the requester withdraws a match.
pub const CANCELED_REASON: &str = "canceled";

/// One match request and its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResultRecord {
    /// Requesting identity (partition key).
    pub source: String,
    /// Client timestamp of the request (sort key).
    pub timestamp: u64,
    /// Requested identity.
    pub target: String,
    /// Server time when the request was recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_timestamp: Option<u64>,
    /// Server time when the row was closed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_server_timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl MatchResultRecord {
    /// Create an open row.
    #[must_use]
    pub fn open(source: impl Into<String>, target: impl Into<String>, timestamp: u64) -> Self {
        Self {
            source: source.into(),
            timestamp,
            target: target.into(),
            server_timestamp: Some(server_time()),
            response_timestamp: None,
            response_server_timestamp: None,
            channel_name: None,
            result: None,
            reason: None,
        }
    }

    /// Whether a terminal event has already been written.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.result.is_some() || self.reason.is_some()
    }

    fn apply(&mut self, terminal: MatchTerminal, response_server_timestamp: u64) {
        self.target = terminal.target;
        self.response_timestamp = terminal.response_timestamp;
        self.response_server_timestamp = Some(response_server_timestamp);
        self.channel_name = terminal.channel_name;
        self.result = terminal.result;
        self.reason = terminal.reason;
    }
}

/// Terminal fields written when a row is closed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchTerminal {
    pub target: String,
    pub response_timestamp: Option<u64>,
    pub result: Option<bool>,
    pub reason: Option<String>,
    pub channel_name: Option<String>,
}

impl MatchTerminal {
    /// Whether writing these fields would close a row.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.result.is_some() || self.reason.is_some()
    }
}

/// Outcome of a terminal write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalOutcome {
    /// This call closed the row.
    Closed,
    /// An earlier terminal event already closed the row; nothing written.
    AlreadyClosed,
    /// The event carried no result or reason; nothing written.
    Incomplete,
}

/// Ordered append store for match results, keyed by `(source, timestamp)`.
#[async_trait]
pub trait MatchResultStore: Send + Sync {
    /// Strongly consistent read of one row.
    async fn get(&self, source: &str, timestamp: u64)
        -> Result<Option<MatchResultRecord>, StoreError>;

    /// Insert `record` unless its key exists. Returns `true` if inserted.
    async fn put_if_absent(&self, record: MatchResultRecord) -> Result<bool, StoreError>;

    /// Write the terminal fields only if the row has none yet.
    ///
    /// A missing row is created closed. Returns `true` if this call wrote.
    async fn close_if_open(
        &self,
        source: &str,
        timestamp: u64,
        terminal: MatchTerminal,
        response_server_timestamp: u64,
    ) -> Result<bool, StoreError>;
}

/// In-memory match result store.
#[derive(Debug, Default)]
pub struct MemoryMatchResultStore {
    rows: DashMap<(String, u64), MatchResultRecord>,
}

impl MemoryMatchResultStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl MatchResultStore for MemoryMatchResultStore {
    async fn get(
        &self,
        source: &str,
        timestamp: u64,
    ) -> Result<Option<MatchResultRecord>, StoreError> {
        Ok(self
            .rows
            .get(&(source.to_string(), timestamp))
            .map(|r| r.value().clone()))
    }

    async fn put_if_absent(&self, record: MatchResultRecord) -> Result<bool, StoreError> {
        match self.rows.entry((record.source.clone(), record.timestamp)) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(true)
            }
        }
    }

    async fn close_if_open(
        &self,
        source: &str,
        timestamp: u64,
        terminal: MatchTerminal,
        response_server_timestamp: u64,
    ) -> Result<bool, StoreError> {
        match self.rows.entry((source.to_string(), timestamp)) {
            Entry::Occupied(mut row) => {
                if row.get().is_closed() {
                    return Ok(false);
                }
                row.get_mut().apply(terminal, response_server_timestamp);
                Ok(true)
            }
            Entry::Vacant(slot) => {
                let mut record = MatchResultRecord {
                    server_timestamp: None,
                    ..MatchResultRecord::open(source, terminal.target.clone(), timestamp)
                };
                record.apply(terminal, response_server_timestamp);
                slot.insert(record);
                Ok(true)
            }
        }
    }
}

/// Records match requests and their single terminal outcome.
#[derive(Clone)]
pub struct MatchCoordinator {
    store: Arc<dyn MatchResultStore>,
}

impl MatchCoordinator {
    /// Create a coordinator over a match result store.
    #[must_use]
    pub fn new(store: Arc<dyn MatchResultStore>) -> Self {
        Self { store }
    }

    /// Open a row for a match request. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn record_match_request(
        &self,
        source: &str,
        target: &str,
        timestamp: u64,
    ) -> Result<bool, StoreError> {
        let created = self
            .store
            .put_if_absent(MatchResultRecord::open(source, target, timestamp))
            .await?;

        if created {
            info!(source = %source, target = %target, timestamp, "Match requested");
        } else {
            debug!(source = %source, timestamp, "Match request already recorded");
        }
        Ok(created)
    }

    /// Close the row `(source, timestamp)` unless a terminal event beat us.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn record_match_terminal(
        &self,
        source: &str,
        timestamp: u64,
        terminal: MatchTerminal,
    ) -> Result<TerminalOutcome, StoreError> {
        if !terminal.is_terminal() {
            warn!(
                source = %source,
                timestamp,
                "Terminal event without result or reason skipped"
            );
            return Ok(TerminalOutcome::Incomplete);
        }

        let result = terminal.result;
        let written = self
            .store
            .close_if_open(source, timestamp, terminal, server_time())
            .await?;

        if written {
            info!(source = %source, timestamp, result = ?result, "Match closed");
            Ok(TerminalOutcome::Closed)
        } else {
            debug!(source = %source, timestamp, "Duplicate terminal write ignored");
            Ok(TerminalOutcome::AlreadyClosed)
        }
    }

    /// Close the responder's view of a request: the row belongs to the
    /// requester, who is the `target` of the response.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn record_match_response(
        &self,
        responder: &str,
        requester: &str,
        timestamp: u64,
        fields: &NotifyFields,
    ) -> Result<TerminalOutcome, StoreError> {
        self.record_match_terminal(
            requester,
            timestamp,
            MatchTerminal {
                target: responder.to_string(),
                response_timestamp: fields.rt,
                result: fields.is_accept,
                reason: fields.reject_reason.clone(),
                channel_name: fields.channel_name.clone(),
            },
        )
        .await
    }

    /// Close the canceller's own request: the row belongs to the sender of
    /// the cancel, whose `target` is the identity it had asked.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn record_match_cancel(
        &self,
        canceller: &str,
        target: &str,
        timestamp: u64,
        fields: &NotifyFields,
    ) -> Result<TerminalOutcome, StoreError> {
        self.record_match_terminal(
            canceller,
            timestamp,
            MatchTerminal {
                target: target.to_string(),
                response_timestamp: fields.rt,
                result: Some(false),
                reason: Some(CANCELED_REASON.to_string()),
                channel_name: fields.channel_name.clone(),
            },
        )
        .await
    }

    /// Read a row.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn get(
        &self,
        source: &str,
        timestamp: u64,
    ) -> Result<Option<MatchResultRecord>, StoreError> {
        self.store.get(source, timestamp).await
    }
}
