//! Dispatch gateway.
//!
//! Slow side effects (LLM completion, SMTP delivery) go through the
//! `Executor` trait. `DirectExecutor` runs them inline; `QueuedExecutor`
//! hands them to a background worker as JSON payloads and waits for the
//! outcome, falling back to inline execution when the queue is full, the
//! worker is gone, or the wait times out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::QueueSettings;
use crate::error::DispatchError;
use crate::llm::{CompletionRequest, CompletionResponse, LlmClient};
use crate::mail::{MailTransport, OutboundEmail};

/// A dispatchable unit of work. Serialized to JSON on the queue path so the
/// payload format stays stable across worker restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    GenerateReply { request: CompletionRequest },
    DeliverEmail { email: OutboundEmail },
}

/// Result of an executed job.
#[derive(Debug)]
pub enum JobOutcome {
    Completion(CompletionResponse),
    Delivered,
}

impl JobOutcome {
    /// Unwrap a completion outcome; delivery outcomes carry no content.
    pub fn into_completion(self) -> Result<CompletionResponse, DispatchError> {
        match self {
            Self::Completion(response) => Ok(response),
            Self::Delivered => Err(DispatchError::Payload(
                "expected completion outcome, got delivery".to_string(),
            )),
        }
    }
}

/// Execution seam between the engine and slow side effects.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn invoke(&self, job: Job) -> Result<JobOutcome, DispatchError>;
}

// ── Direct execution ────────────────────────────────────────────────

/// Runs jobs inline on the caller's task.
pub struct DirectExecutor {
    llm: Arc<dyn LlmClient>,
    mail: Arc<dyn MailTransport>,
}

impl DirectExecutor {
    pub fn new(llm: Arc<dyn LlmClient>, mail: Arc<dyn MailTransport>) -> Self {
        Self { llm, mail }
    }
}

#[async_trait]
impl Executor for DirectExecutor {
    async fn invoke(&self, job: Job) -> Result<JobOutcome, DispatchError> {
        match job {
            Job::GenerateReply { request } => {
                let response = self.llm.complete(&request).await?;
                Ok(JobOutcome::Completion(response))
            }
            Job::DeliverEmail { email } => {
                self.mail.send(&email).await?;
                Ok(JobOutcome::Delivered)
            }
        }
    }
}

// ── Queued execution ────────────────────────────────────────────────

struct QueuedJob {
    /// Correlates worker-side log lines with the caller that queued the job.
    id: Uuid,
    payload: String,
    reply: oneshot::Sender<Result<JobOutcome, DispatchError>>,
}

/// Hands jobs to a background worker and waits for the outcome.
///
/// Every degraded path (full queue, dead worker, wait timeout) falls back to
/// inline execution. On timeout the queued job may still run to completion
/// in the worker, so a delivery job can be sent twice; operators accept that
/// over losing the reply.
pub struct QueuedExecutor {
    tx: mpsc::Sender<QueuedJob>,
    fallback: DirectExecutor,
    wait_timeout: Duration,
}

impl QueuedExecutor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        mail: Arc<dyn MailTransport>,
        settings: &QueueSettings,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.capacity.max(1));
        spawn_worker(rx, DirectExecutor::new(Arc::clone(&llm), Arc::clone(&mail)));
        Self {
            tx,
            fallback: DirectExecutor::new(llm, mail),
            wait_timeout: settings.wait_timeout,
        }
    }
}

fn spawn_worker(mut rx: mpsc::Receiver<QueuedJob>, executor: DirectExecutor) {
    tokio::spawn(async move {
        while let Some(queued) = rx.recv().await {
            let result = match serde_json::from_str::<Job>(&queued.payload) {
                Ok(job) => executor.invoke(job).await,
                Err(e) => Err(DispatchError::Payload(format!("worker decode: {e}"))),
            };
            debug!(job_id = %queued.id, ok = result.is_ok(), "Queued job executed");
            // Receiver gone means the caller already fell back inline.
            let _ = queued.reply.send(result);
        }
        debug!("Dispatch worker stopped");
    });
}

#[async_trait]
impl Executor for QueuedExecutor {
    async fn invoke(&self, job: Job) -> Result<JobOutcome, DispatchError> {
        let payload =
            serde_json::to_string(&job).map_err(|e| DispatchError::Payload(e.to_string()))?;
        let id = Uuid::new_v4();
        let (reply_tx, reply_rx) = oneshot::channel();

        if self
            .tx
            .try_send(QueuedJob {
                id,
                payload,
                reply: reply_tx,
            })
            .is_err()
        {
            warn!(job_id = %id, "Dispatch queue unavailable, running job inline");
            return self.fallback.invoke(job).await;
        }

        match tokio::time::timeout(self.wait_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                warn!(job_id = %id, "Dispatch worker dropped the job, running inline");
                self.fallback.invoke(job).await
            }
            Err(_) => {
                warn!(
                    job_id = %id,
                    timeout_secs = self.wait_timeout.as_secs(),
                    "Queued job timed out, running inline"
                );
                self.fallback.invoke(job).await
            }
        }
    }
}
