//! Serve command — runs every enabled inbox plus both pipelines.
//!
//! Startup sequence:
//! 1. Validate config
//! 2. Open store, build credential cipher and ingestion queue
//! 3. Start the channel registry (one adapter per enabled inbox)
//! 4. Spawn the ingestion pipeline and the dispatcher
//! 5. Wait for Ctrl+C (SIGHUP reloads inboxes on unix)
//! 6. Cancel, close the registry, wait for the pipelines

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use deskmail_channels::registry::default_initializer;
use deskmail_channels::ChannelRegistry;
use deskmail_core::bus::IngestQueue;
use deskmail_core::config::Config;
use deskmail_core::crypto::CredentialCipher;
use deskmail_core::events::{EventFanout, LoggingSink};
use deskmail_pipeline::{DispatchSettings, Dispatcher, IngestPipeline};

use crate::helpers;

pub async fn run(config: Config) -> Result<()> {
    if let Err(problems) = config.validate() {
        for p in &problems {
            error!(problem = %p, "invalid configuration");
            eprintln!("  ✗ {p}");
        }
        bail!("configuration has {} problem(s)", problems.len());
    }

    let store = helpers::open_store(&config).await?;
    let cipher = Arc::new(
        CredentialCipher::new(&config.app.encryption_key).context("invalid encryption key")?,
    );
    let queue = Arc::new(IngestQueue::new(config.message.incoming_queue_size));
    let shutdown_timeout = config.registry.shutdown_timeout();

    let registry = Arc::new(ChannelRegistry::new(
        store.clone(),
        cipher,
        queue.clone(),
        shutdown_timeout,
    ));
    let init = default_initializer();
    let running = registry
        .start(&init)
        .await
        .context("failed to start inboxes")?;

    let ingest = Arc::new(IngestPipeline::new(
        store.clone(),
        queue,
        EventFanout::new(vec![Arc::new(LoggingSink)]),
        config.message.incoming_queue_workers,
        config.message.incoming_max_attempts,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        registry.clone(),
        DispatchSettings::from_config(&config.message),
    ));

    let cancel = CancellationToken::new();
    let tasks = TaskTracker::new();
    tasks.spawn(ingest.clone().run(cancel.child_token()));
    tasks.spawn(dispatcher.run(cancel.child_token()));
    tasks.close();

    helpers::print_banner();
    println!("  Store:     {}", helpers::expand_tilde(&config.store.path).display());
    println!("  Inboxes:   {running} running");
    println!(
        "  Workers:   {} ingest / {} dispatch",
        config.message.incoming_queue_workers, config.message.outgoing_queue_workers
    );
    println!();
    println!("  Ctrl+C to stop");
    println!();
    info!(inboxes = running, "deskmail serving");

    let mut hangup = Hangup::new()?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl+C")?;
                break;
            }
            _ = hangup.recv() => {
                match registry.reload(&init).await {
                    Ok(summary) => info!(?summary, "inboxes reloaded"),
                    Err(e) => error!(error = %e, "inbox reload failed"),
                }
            }
        }
    }

    println!();
    println!("  Shutting down...");
    info!("received Ctrl+C, shutting down");
    cancel.cancel();
    registry.close().await;
    if tokio::time::timeout(shutdown_timeout, tasks.wait()).await.is_err() {
        warn!(timeout = ?shutdown_timeout, "pipelines did not stop in time");
    }

    let counts = ingest.stats().snapshot();
    info!(
        inserted = counts.inserted,
        duplicates = counts.duplicates,
        dropped = counts.dropped,
        "ingestion totals"
    );
    println!("  Deskmail stopped. Goodbye!");
    Ok(())
}

// ─────────────────────────────────────────────
// SIGHUP
// ─────────────────────────────────────────────

#[cfg(unix)]
struct Hangup(tokio::signal::unix::Signal);

#[cfg(unix)]
impl Hangup {
    fn new() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        let sig = signal(SignalKind::hangup()).context("failed to listen for SIGHUP")?;
        Ok(Self(sig))
    }

    async fn recv(&mut self) {
        if self.0.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
struct Hangup;

#[cfg(not(unix))]
impl Hangup {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}
