//! Periodic inbox polling.
//!
//! One loop fetches unseen emails and feeds them to the automation engine
//! sequentially. A fetch error aborts only the current cycle; a per-email
//! failure is logged and the loop moves on. The stop signal pre-empts the
//! inter-cycle sleep but never an email already being processed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::MIN_POLL_INTERVAL;
use crate::engine::AutomationEngine;
use crate::mail::MailTransport;

pub struct InboxPoller {
    engine: Arc<AutomationEngine>,
    mail: Arc<dyn MailTransport>,
    interval: Duration,
}

/// Handle to a running poll loop.
pub struct PollerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollerHandle {
    /// Signal the loop to stop and wait for it to finish the current cycle.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Poller task failed to shut down cleanly");
        }
    }
}

impl InboxPoller {
    pub fn new(
        engine: Arc<AutomationEngine>,
        mail: Arc<dyn MailTransport>,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            mail,
            interval: interval.max(MIN_POLL_INTERVAL),
        }
    }

    /// Start the poll loop on a background task.
    pub fn spawn(self) -> PollerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let interval = self.interval;
        info!(interval_secs = interval.as_secs(), "Inbox poller started");
        let task = tokio::spawn(self.run(stop_rx));
        PollerHandle {
            stop: stop_tx,
            task,
        }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        loop {
            self.poll_once().await;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = stop.changed() => {}
            }
            if *stop.borrow() {
                info!("Inbox poller stopped");
                return;
            }
        }
    }

    /// One poll cycle: fetch, then process each email in its own unit of
    /// work. Fully handled emails are moved out of the inbox, best effort.
    pub async fn poll_once(&self) {
        let emails = match self.mail.fetch_unseen().await {
            Ok(emails) => emails,
            Err(e) => {
                warn!(error = %e, "Skipping poll cycle, inbox fetch failed");
                return;
            }
        };
        if emails.is_empty() {
            return;
        }
        info!(count = emails.len(), "Fetched new emails");

        for email in emails {
            let outcome = match self.engine.process_inbound(&email).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(
                        external_id = email.message_id.as_deref().unwrap_or(""),
                        error = %e,
                        "Failed to process inbound email"
                    );
                    continue;
                }
            };
            if !outcome.requires_human {
                if let Err(e) = self.mail.mark_processed(email.uid).await {
                    warn!(
                        uid = email.uid,
                        error = %e,
                        "Could not move email to processed folder"
                    );
                }
            }
        }
    }
}
