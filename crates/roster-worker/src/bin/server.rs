//! roster server binary.
//!
//! Reads `config.toml` (or the path given with `--config`), opens the SQLite
//! store, starts the job workers and serves the JSON API under `/api`.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context as _;
use axum::Router;
use clap::Parser;
use roster_core::{pipeline::Pipeline, store::PatientStore};
use roster_store_sqlite::SqliteStore;
use roster_worker::{
  ServerConfig,
  config::expand_tilde,
  queue::JobQueue,
  registry::HttpRegistryClient,
  throttle::Throttled,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

const OUTBOX_BATCH: usize = 100;
const OUTBOX_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(author, version, about = "Patient identity resolution server")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml")]
  config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let server_cfg = ServerConfig::load(&cli.config)
    .with_context(|| format!("failed to load config from {:?}", cli.config))?;

  let store_path = expand_tilde(&server_cfg.store_path);
  let store = Arc::new(
    SqliteStore::open(&store_path)
      .await
      .with_context(|| format!("failed to open store at {store_path:?}"))?,
  );

  let registry = HttpRegistryClient::new(server_cfg.registry.client())
    .context("failed to build registry client")?;
  let registry = Arc::new(Throttled::new(registry, server_cfg.registry.throttle()));

  let (dispatcher, queue) = JobQueue::channel();
  let dispatcher = Arc::new(dispatcher);
  let pipeline = Pipeline::new(
    store.clone(),
    registry,
    dispatcher.clone(),
    server_cfg.pipeline_config(),
  )
  .context("invalid search step tables")?;
  queue.spawn_workers(Arc::new(pipeline), server_cfg.workers);

  tokio::spawn(publish_events(store.clone()));

  let app = Router::new()
    .nest("/api", roster_api::api_router(store, dispatcher))
    .layer(TraceLayer::new_for_http());
  let address = format!("{}:{}", server_cfg.host, server_cfg.port);

  tracing::info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app).await.context("server error")?;

  Ok(())
}

/// Drain the event outbox into the log, where the audit pipeline picks it
/// up.
async fn publish_events(store: Arc<SqliteStore>) {
  let mut ticker = tokio::time::interval(OUTBOX_INTERVAL);
  loop {
    ticker.tick().await;
    match store.drain_events(OUTBOX_BATCH).await {
      Ok(events) => {
        for event in events {
          tracing::info!(
            target: "roster::events",
            event_id = %event.event_id,
            kind = %event.kind,
            payload = %event.payload,
            recorded_at = %event.recorded_at,
            "domain event"
          );
        }
      }
      Err(e) => tracing::warn!(error = %e, "failed to drain event outbox"),
    }
  }
}
