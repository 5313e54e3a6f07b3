//! PriceWire Validator Daemon (pricewire-vd)
//!
//! Service responsible for AI validation of detected pricing anomalies:
//! weighted model routing, circuit breaking, and confirmed-glitch emission.

use anyhow::Result;
use clap::Parser;
use pricewire_common::bus::{StreamBus, STREAM_ANOMALY_DETECTED};
use pricewire_common::consumer::{ConsumerConfig, StreamConsumer};
use pricewire_common::db::init_database;
use pricewire_common::kv::KvStore;
use pricewire_common::metrics::{DlqInspector, Metrics};
use pricewire_common::shutdown::ShutdownCoordinator;
use pricewire_vd::config::ValidatorConfig;
use pricewire_vd::llm::ChatClient;
use pricewire_vd::router::{catalog, ModelRouter, RouterConfig};
use pricewire_vd::validator::ValidatorHandler;
use pricewire_vd::{build_router, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Consumer group name of this worker
const CONSUMER_GROUP: &str = "validator";

/// PriceWire Validator Daemon - AI validation of pricing anomalies
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
                .unwrap_or_else(|_| format!("pricewire_vd={log_level},pricewire_common={log_level}").into()),
        )
        .init();

    info!(
        "Starting PriceWire Validator (pricewire-vd) v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let mut config = ValidatorConfig::from_env(args.data_dir.as_deref())?;
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

    let shutdown = ShutdownCoordinator::new(config.core.graceful_shutdown_timeout_ms);
    shutdown.listen();

    // Model router with mirrored state from any previous run.
    let router = Arc::new(ModelRouter::new(
        catalog::load_catalog(&config.disabled_models),
        kv.clone(),
        RouterConfig::from_core(&config.core),
    ));
    router.hydrate().await?;
    info!("Model router hydrated ({} catalog entries)", router.stats().await.len());

    let llm = Arc::new(ChatClient::new(&config.llm_api_url, config.llm_api_key.clone())?);

    // Inspection API with graceful shutdown.
    let state = AppState::new(
        metrics.clone(),
        DlqInspector::new(bus.clone()),
        Arc::clone(&router),
    );
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

    let handler = Arc::new(ValidatorHandler::new(
        router,
        llm,
        bus.clone(),
        db.clone(),
        metrics.clone(),
    ));
    let consumer = StreamConsumer::new(
        bus,
        kv,
        metrics,
        Arc::clone(&shutdown),
        ConsumerConfig::from_core(&config.core),
    );

    let run_result = consumer
        .run(STREAM_ANOMALY_DETECTED, CONSUMER_GROUP, handler)
        .await;

    // Fatal consumer errors also need the cleanup pass before exiting.
    shutdown.trigger();
    shutdown.register_cleanup("close-database", {
        let db = db.clone();
        move || async move { db.close().await }
    });
    let clean = shutdown.run_cleanup().await;

    match run_result {
        Err(e) => {
            error!(error = %e, "validator worker failed");
            std::process::exit(1);
        }
        Ok(()) if !clean => {
            error!("graceful shutdown exceeded its budget");
            std::process::exit(1);
        }
        Ok(()) => {
            info!("PriceWire Validator stopped cleanly");
            Ok(())
        }
    }
}
