//! PriceWire Notification Dispatcher (pricewire-nd)
//!
//! Service responsible for tier-aware fan-out of confirmed glitches:
//! per-tier delays, per-user dedup and preference filtering, and
//! multi-channel delivery.

use anyhow::Result;
use clap::Parser;
use pricewire_common::bus::{StreamBus, STREAM_ANOMALY_CONFIRMED};
use pricewire_common::consumer::{ConsumerConfig, StreamConsumer};
use pricewire_common::db::init_database;
use pricewire_common::delay::DelayQueue;
use pricewire_common::kv::KvStore;
use pricewire_common::metrics::{DlqInspector, Metrics};
use pricewire_common::shutdown::ShutdownCoordinator;
use pricewire_nd::channels::ProviderRegistry;
use pricewire_nd::config::DispatcherConfig;
use pricewire_nd::dispatch::{ConfirmedGlitchHandler, Dispatcher, NotifyJobHandler, NOTIFY_QUEUE};
use pricewire_nd::policy::TierPolicy;
use pricewire_nd::{build_router, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Consumer group name of this worker
const CONSUMER_GROUP: &str = "dispatcher";

/// PriceWire Notification Dispatcher - tier-aware glitch fan-out
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory (overrides PRICEWIRE_DATA_DIR)
    #[arg(short, long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Host address to bind the inspection API to
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Port to bind the inspection API to
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("pricewire_nd={log_level},pricewire_common={log_level}").into()),
        )
        .init();

    info!(
        "Starting PriceWire Dispatcher (pricewire-nd) v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let mut config = DispatcherConfig::from_env(args.data_dir.as_deref())?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    info!("Data directory: {}", config.core.data_dir.display());
    let db = init_database(&config.core.database_path()).await?;

    let bus = StreamBus::new(db.clone());
    let kv = KvStore::new(db.clone());
    let metrics = Metrics::new(kv.clone());
    let delay = DelayQueue::new(db.clone());

    let shutdown = ShutdownCoordinator::new(config.core.graceful_shutdown_timeout_ms);
    shutdown.listen();

    let providers = Arc::new(
        ProviderRegistry::from_config(&config).map_err(|e| anyhow::anyhow!(e))?,
    );
    let broadcast_http = reqwest::Client::builder()
        .user_agent(concat!("pricewire/", env!("CARGO_PKG_VERSION")))
        .timeout(pricewire_nd::channels::PROVIDER_TIMEOUT)
        .build()?;

    let dispatcher = Arc::new(Dispatcher::new(
        db.clone(),
        kv.clone(),
        delay.clone(),
        metrics.clone(),
        TierPolicy::standard(),
        providers,
        config.core.notify_dedup_ttl_seconds,
        config.broadcast.clone(),
        broadcast_http,
    ));

    // Inspection API with graceful shutdown.
    let state = AppState::new(db.clone(), metrics.clone(), DlqInspector::new(bus.clone()));
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr()).await?;
    info!("Inspection API listening on http://{}", config.bind_addr());
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.wait().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "inspection API server failed");
            }
        });
    }

    // Delay-queue consumer for scheduled dispatch jobs.
    let job_consumer = {
        let delay = delay.clone();
        let handler = Arc::new(NotifyJobHandler::new(Arc::clone(&dispatcher)));
        let shutdown = Arc::clone(&shutdown);
        let concurrency = config.notify_concurrency;
        tokio::spawn(async move {
            if let Err(e) = delay.consume(NOTIFY_QUEUE, handler, concurrency, shutdown).await {
                error!(error = %e, "dispatch job consumer failed");
            }
        })
    };

    let handler = Arc::new(ConfirmedGlitchHandler::new(dispatcher));
    let consumer = StreamConsumer::new(
        bus,
        kv,
        metrics,
        Arc::clone(&shutdown),
        ConsumerConfig::from_core(&config.core),
    );

    let run_result = consumer
        .run(STREAM_ANOMALY_CONFIRMED, CONSUMER_GROUP, handler)
        .await;

    // Fatal consumer errors also need the cleanup pass before exiting.
    shutdown.trigger();
    shutdown.register_cleanup("join-job-consumer", move || async move {
        let _ = job_consumer.await;
    });
    shutdown.register_cleanup("close-database", {
        let db = db.clone();
        move || async move { db.close().await }
    });
    let clean = shutdown.run_cleanup().await;

    match run_result {
        Err(e) => {
            error!(error = %e, "dispatcher worker failed");
            std::process::exit(1);
        }
        Ok(()) if !clean => {
            error!("graceful shutdown exceeded its budget");
            std::process::exit(1);
        }
        Ok(()) => {
            info!("PriceWire Dispatcher stopped cleanly");
            Ok(())
        }
    }
}
