use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod broker;
mod client_pool;
mod config;
mod dns;
mod event_store;
mod forwarder;
mod lifecycle;
mod message;
mod recorder;
mod sender;
mod unavailability;
mod virtual_mta;

use crate::broker::{MemoryBroker, MessageBroker};
use crate::client_pool::SmtpClientPool;
use crate::config::Config;
use crate::dns::{HickoryMxResolver, MxResolver};
use crate::event_store::{EventStore, MemoryEventStore, SqliteEventStore};
use crate::forwarder::EventForwarder;
use crate::lifecycle::LifeCycle;
use crate::recorder::{MemoryStateStore, OutcomeRecorder};
use crate::sender::MessageSender;
use crate::unavailability::UnavailabilityRegistry;
use crate::virtual_mta::VirtualMtaSelector;

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
#[clap(rename_all = "kebab_case")]
enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

/// Caravel outbound delivery daemon.
#[derive(Debug, Parser)]
#[command(about)]
struct Opt {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/caravel/caraveld.toml")]
    config: PathBuf,

    /// How diagnostic logs render. full, compact and pretty are intended
    /// for human consumption.
    ///
    /// json outputs machine readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();
    init_diagnostic_logging(opts.diag_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async move { run(opts).await })
}

fn init_diagnostic_logging(format: DiagnosticFormat) -> anyhow::Result<()> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter, Layer};

    let layer = fmt::layer().with_thread_names(true);
    let layer = match format {
        DiagnosticFormat::Pretty => layer.pretty().boxed(),
        DiagnosticFormat::Full => layer.boxed(),
        DiagnosticFormat::Compact => layer.compact().boxed(),
        DiagnosticFormat::Json => layer.json().boxed(),
    };

    let env_filter = EnvFilter::try_new(
        std::env::var("CARAVELD_LOG")
            .as_deref()
            .unwrap_or("caraveld=info"),
    )?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .init();
    Ok(())
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    let config = Config::load(&opts.config)?;

    let lifecycle = LifeCycle::new();
    let handle = lifecycle.handle();

    let registry = Arc::new(UnavailabilityRegistry::new());
    let selector = Arc::new(VirtualMtaSelector::new(config.virtual_mta_groups.clone())?);
    let pool = Arc::new(SmtpClientPool::new(
        config.pool.clone(),
        config.smtp_client_timeouts,
        registry.clone(),
    ));
    let sweeper = pool.start_sweep(handle.subscribe());

    let events: Arc<dyn EventStore> = match &config.event_db_path {
        Some(path) => Arc::new(SqliteEventStore::open(path)?),
        None => Arc::new(MemoryEventStore::new()),
    };
    let state = Arc::new(MemoryStateStore::new());
    let recorder = Arc::new(OutcomeRecorder::new(state, events.clone()));

    // The durable broker is an integration seam; the in-memory broker
    // keeps a standalone daemon runnable
    let broker: Arc<dyn MessageBroker> = Arc::new(MemoryBroker::new(Duration::from_secs(60)));
    let resolver: Arc<dyn MxResolver> =
        Arc::new(HickoryMxResolver::new().context("initializing DNS resolver")?);

    let sender = Arc::new(MessageSender::new(
        broker,
        resolver,
        selector,
        pool,
        recorder,
        registry,
        config.max_time_in_queue(),
    ));
    let sender_worker = sender.start(&handle);

    let forwarder_worker = EventForwarder::spawn(
        events,
        config.event_forwarding_http_post_url.clone(),
        handle.clone(),
    );

    tracing::info!("caraveld started");
    lifecycle.wait_for_shutdown().await;

    sender_worker.await.ok();
    if let Some(worker) = forwarder_worker {
        worker.await.ok();
    }
    sweeper.await.ok();

    tracing::info!("caraveld stopped");
    Ok(())
}
