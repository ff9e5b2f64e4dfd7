//! QuayDB standalone server.
//!
//! Hosts one replica over a backing engine process: binds the client API,
//! drives periodic checkpoints, and acts as the replication collaborator in
//! standalone mode (each applied write mints one committed decree).

mod service;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use quay_engine::{EngineConfig, ProcessEngine};
use quay_replica::{Replica, ReplicaConfig};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::service::DecreeCounter;

/// QuayDB - replicated-service adapter for an external key-value engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the backing engine binary
    #[arg(long)]
    engine: PathBuf,

    /// Replica data directory
    #[arg(long, default_value = "quay-data")]
    data_dir: PathBuf,

    /// Bind address for the client API
    #[arg(long, default_value = "127.0.0.1:7400")]
    bind: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds between automatic checkpoints (0 = never)
    #[arg(long, default_value_t = 60)]
    checkpoint_interval: u64,

    /// Checkpoint files retained after pruning (0 = keep all)
    #[arg(long, default_value_t = 3)]
    max_retained: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting QuayDB server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let engine = ProcessEngine::new(EngineConfig::new(&args.engine, &args.data_dir));
    let replica = Arc::new(Replica::new(
        ReplicaConfig::new(&args.data_dir),
        Box::new(engine),
    ));

    {
        let replica = Arc::clone(&replica);
        tokio::task::spawn_blocking(move || replica.start()).await??;
    }
    info!(
        committed = replica.committed_decree(),
        durable = replica.durable_decree(),
        "replica serving"
    );

    let decrees = Arc::new(DecreeCounter::new(replica.committed_decree()));

    if args.checkpoint_interval > 0 {
        tokio::spawn(checkpoint_driver(
            Arc::clone(&replica),
            Duration::from_secs(args.checkpoint_interval),
            args.max_retained,
        ));
    }

    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    info!(bind = %args.bind, "client API listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(%peer, "client connected");
                tokio::spawn(service::serve_connection(
                    Arc::clone(&replica),
                    Arc::clone(&decrees),
                    stream,
                ));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    let stopping = Arc::clone(&replica);
    tokio::task::spawn_blocking(move || stopping.stop(false)).await?;
    info!("server stopped");
    Ok(())
}

/// Periodically materializes a checkpoint and prunes old ones.
///
/// Recoverable failures are retried on the next tick; a fatal failure means
/// the durable baseline can no longer be verified and the process must not
/// keep serving.
async fn checkpoint_driver(replica: Arc<Replica>, every: Duration, max_retained: usize) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so a fresh start is not
    // followed by a pointless checkpoint of nothing.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let worker = Arc::clone(&replica);
        let result = tokio::task::spawn_blocking(move || worker.checkpoint()).await;

        match result {
            Ok(Ok(record)) => {
                debug!(decree = record.decree, "periodic checkpoint");
                if max_retained > 0 {
                    let pruner = Arc::clone(&replica);
                    if let Ok(Err(e)) =
                        tokio::task::spawn_blocking(move || pruner.prune_checkpoints(max_retained))
                            .await
                    {
                        warn!(error = %e, "checkpoint pruning failed");
                    }
                }
            }
            Ok(Err(e)) if e.is_fatal() => {
                error!(error = %e, "fatal checkpoint failure, stopping server");
                std::process::exit(1);
            }
            Ok(Err(e)) => warn!(error = %e, "checkpoint failed, will retry"),
            Err(e) => warn!(error = %e, "checkpoint task failed"),
        }
    }
}
