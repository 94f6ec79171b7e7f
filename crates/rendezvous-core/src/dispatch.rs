//! Fan-out invocation boundary.
//!
//! Presence and routing hand slow fan-out work to a [`Dispatcher`]. The
//! caller only learns whether the hand-off succeeded, never how delivery
//! went. [`QueueDispatcher`] decouples the two with an mpsc queue drained
//! by a [`FanoutWorker`]; [`InlineDispatcher`] runs the job on the caller's
//! task and is what tests and single-process deployments use.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::RelayError;
use crate::fanout::{Audience, BroadcastReport, Delivery, Fanout};

/// A unit of deferred fan-out work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanoutJob {
    /// Deliver to an audience, skipping one handle (usually the sender).
    Broadcast {
        payload: Bytes,
        audience: Audience,
        skip: Option<String>,
    },
    /// Deliver to exactly one identity.
    Notify { target: String, payload: Bytes },
}

/// Outcome of an executed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobReport {
    Broadcast(BroadcastReport),
    Notify(Option<Delivery>),
}

impl FanoutJob {
    /// Execute the job against a fan-out executor.
    ///
    /// # Errors
    ///
    /// Returns the fan-out's fatal error, if any.
    pub async fn execute(self, fanout: &Fanout) -> Result<JobReport, RelayError> {
        match self {
            FanoutJob::Broadcast {
                payload,
                audience,
                skip,
            } => fanout
                .broadcast(payload, &audience, skip.as_deref())
                .await
                .map(JobReport::Broadcast),
            FanoutJob::Notify { target, payload } => {
                fanout.notify(&target, payload).await.map(JobReport::Notify)
            }
        }
    }
}

/// Fire-and-forget hand-off of fan-out work.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Hand off a job.
    ///
    /// An `Err` means the hand-off itself failed; delivery failures of a
    /// deferred job are never reported back.
    async fn dispatch(&self, job: FanoutJob) -> Result<(), RelayError>;
}

/// Runs each job to completion on the calling task.
pub struct InlineDispatcher {
    fanout: Arc<Fanout>,
}

impl InlineDispatcher {
    #[must_use]
    pub fn new(fanout: Arc<Fanout>) -> Self {
        Self { fanout }
    }
}

#[async_trait]
impl Dispatcher for InlineDispatcher {
    async fn dispatch(&self, job: FanoutJob) -> Result<(), RelayError> {
        job.execute(&self.fanout).await.map(|_| ())
    }
}

/// Queues jobs for a [`FanoutWorker`].
#[derive(Clone)]
pub struct QueueDispatcher {
    tx: mpsc::UnboundedSender<FanoutJob>,
}

impl QueueDispatcher {
    /// Create a dispatcher and the worker that drains it.
    #[must_use]
    pub fn new(fanout: Arc<Fanout>) -> (Self, FanoutWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, FanoutWorker { rx, fanout })
    }
}

#[async_trait]
impl Dispatcher for QueueDispatcher {
    async fn dispatch(&self, job: FanoutJob) -> Result<(), RelayError> {
        self.tx.send(job).map_err(|_| RelayError::DispatchClosed)
    }
}

/// Background consumer of queued fan-out jobs.
///
/// Each job runs on its own task so one slow fan-out never holds up the
/// next.
pub struct FanoutWorker {
    rx: mpsc::UnboundedReceiver<FanoutJob>,
    fanout: Arc<Fanout>,
}

impl FanoutWorker {
    /// Drain the queue until every dispatcher is dropped.
    pub async fn run(mut self) {
        debug!("Fan-out worker started");
        while let Some(job) = self.rx.recv().await {
            let fanout = self.fanout.clone();
            tokio::spawn(async move {
                match job.execute(&fanout).await {
                    Ok(JobReport::Notify(None)) => {
                        warn!("Notify target not connected");
                    }
                    Ok(report) => debug!(report = ?report, "Fan-out job complete"),
                    Err(e) => error!(error = %e, "Fan-out job failed"),
                }
            });
        }
        debug!("Fan-out worker stopped");
    }

    /// Spawn the worker onto the runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
