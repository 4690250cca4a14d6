//! Courier daemon entry point.
//!
//! Reads newline-delimited wire payloads from stdin, feeds them through
//! batch receive jobs and keeps processing queued work until interrupted.

use std::sync::Arc;

use courier_common::{Config, get_metrics};
use courier_core::memory::{MemoryStore, StaticAccountState};
use courier_core::{JsonEnvelopeParser, MessageReceiveParameters};
use courier_queue::{
    BatchReceiveFactory, BatchReceiveJob, CommunityDeleteFactory, FileJobStorage, JobQueue,
    JobRegistry, ReceiveContext, RetryConfig, TrimThreadFactory,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Waits for SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Submit buffered payloads as batch receive jobs.
async fn flush(
    queue: &JobQueue,
    ctx: &Arc<ReceiveContext>,
    buffer: &mut Vec<MessageReceiveParameters>,
    batch_size: usize,
) {
    if buffer.is_empty() {
        return;
    }
    for job in BatchReceiveJob::chunked(std::mem::take(buffer), None, ctx, batch_size) {
        if let Err(e) = queue.submit(job).await {
            error!(error = %e, "Failed to submit batch receive job");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,courier_queue=debug".into()),
        )
        .init();

    info!("Starting courier...");

    let config = Config::load()?;
    let batch_size = config.queue.receive_batch_size.max(1);

    let storage = Arc::new(FileJobStorage::open(&config.storage.jobs_dir).await?);
    info!(dir = %config.storage.jobs_dir, "Job storage ready");

    let store = Arc::new(MemoryStore::new());
    let account = Arc::new(StaticAccountState::from_config(&config.identity));
    if config.identity.account_id.is_empty() {
        warn!("No local account id configured; own messages will not be recognized");
    }
    let parser = Arc::new(JsonEnvelopeParser::new(account.clone(), store.clone()));
    let receive = Arc::new(ReceiveContext::new(
        parser,
        store.clone(),
        store.clone(),
        account,
    ));

    let registry = JobRegistry::new()
        .with(BatchReceiveFactory::new(receive.clone()))
        .with(TrimThreadFactory::new(store.clone()))
        .with(CommunityDeleteFactory::new(store.clone()));

    let queue = JobQueue::new(storage, registry, RetryConfig::from(&config.queue));
    let router = queue.start()?;
    let resumed = queue.resume_all().await?;
    info!(resumed, "Job queue started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut buffer = Vec::with_capacity(batch_size);
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    buffer.push(MessageReceiveParameters::new(line.into_bytes()));
                    if buffer.len() >= batch_size {
                        flush(&queue, &receive, &mut buffer, batch_size).await;
                    }
                }
                Ok(None) => {
                    flush(&queue, &receive, &mut buffer, batch_size).await;
                    info!("Input closed; waiting for queued jobs");
                    stdin_open = false;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read input");
                    flush(&queue, &receive, &mut buffer, batch_size).await;
                    stdin_open = false;
                }
            },
        }
    }

    flush(&queue, &receive, &mut buffer, batch_size).await;
    queue.shutdown();
    if let Err(e) = router.await {
        error!(error = %e, "Job router task failed");
    }

    let metrics = get_metrics().snapshot();
    info!(
        submitted = metrics.jobs_submitted,
        succeeded = metrics.jobs_succeeded,
        failed = metrics.jobs_failed_permanently,
        received = metrics.messages_received,
        dropped = metrics.messages_dropped,
        "Courier stopped"
    );
    Ok(())
}
