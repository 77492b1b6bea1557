use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use avtomail::config::Settings;
use avtomail::dispatch::{DirectExecutor, Executor, QueuedExecutor};
use avtomail::engine::AutomationEngine;
use avtomail::language::ScriptDetector;
use avtomail::llm::OllamaClient;
use avtomail::mail::{MailTransport, SmtpImapTransport};
use avtomail::poller::InboxPoller;
use avtomail::store::{LibSqlStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let settings = Settings::from_env().context("Failed to load configuration")?;
    tracing::info!(
        model = %settings.llm.model,
        auto_send = settings.auto_send_replies,
        queue_enabled = settings.queue.enabled,
        "Avtomail v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let store: Arc<dyn Store> = Arc::new(
        LibSqlStore::new_local(Path::new(&settings.database_path))
            .await
            .with_context(|| format!("Failed to open database at {}", settings.database_path))?,
    );

    let mail: Arc<dyn MailTransport> = Arc::new(SmtpImapTransport::new(
        settings.imap.clone(),
        settings.smtp.clone(),
    ));
    let llm = Arc::new(OllamaClient::new(settings.llm.clone()));

    let executor: Arc<dyn Executor> = if settings.queue.enabled {
        Arc::new(QueuedExecutor::new(
            llm,
            Arc::clone(&mail),
            &settings.queue,
        ))
    } else {
        Arc::new(DirectExecutor::new(llm, Arc::clone(&mail)))
    };

    let detector = Arc::new(ScriptDetector::new(settings.language_min_chars));
    let engine = Arc::new(AutomationEngine::new(
        settings.clone(),
        store,
        executor,
        detector,
    ));

    if !settings.imap.is_configured() {
        tracing::warn!("IMAP credentials missing, inbox polling disabled");
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        return Ok(());
    }

    let poller = InboxPoller::new(engine, mail, settings.poll_interval);
    let handle = poller.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");
    handle.stop().await;

    Ok(())
}
