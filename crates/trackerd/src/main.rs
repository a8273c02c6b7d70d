//! trackerd - Overmesh bootstrap tracker.
//!
//! Runs the dissemination engine in tracker mode: in-memory store,
//! auto-join for every CID heard on the wire, no sync, destroy proofs kept
//! in `persistent-storage.data`, and protocol statistics on stdout.

mod config;
mod tracker;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use overmesh_core::member::KeyStrength;
use overmesh_engine::engine::Engine;
use overmesh_engine::scheduler::Scheduler;
use overmesh_engine::store::SyncStore;
use overmesh_net::endpoint::{Endpoint, NullEndpoint, UdpEndpoint};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use tracker::{load_persistent_storage, print_statistics, tracker_blueprint, TrackerShared};

const STRIKE_INTERVAL: Duration = Duration::from_secs(180);
const STATISTICS_INTERVAL: Duration = Duration::from_secs(300);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);
const OUTBOUND_QUEUE: usize = 1024;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("trackerd=info".parse().expect("static directive")))
        .init();

    let config = match Config::try_parse() {
        Ok(config) => config,
        Err(e) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        return ExitCode::FAILURE;
    }
    if config.profiler {
        warn!("--profiler is not supported in this build");
    }
    if config.memory_dump {
        warn!("--memory-dump is not supported in this build");
    }

    info!("trackerd v{}", env!("CARGO_PKG_VERSION"));
    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("tracker failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    // Trackers keep everything in memory; only destroy proofs persist.
    let store = Arc::new(SyncStore::temporary()?);
    let mut engine = Engine::new(store, NullEndpoint::new(), KeyStrength::VeryLow)?;

    let shared = Arc::new(TrackerShared {
        silent: config.silent,
        storage_path: config.storage_path(),
    });
    let blueprint_shared = shared.clone();
    engine.set_auto_join(Box::new(move |_| tracker_blueprint(blueprint_shared.clone())));

    let scheduler = Scheduler::spawn("overmesh-engine", engine);

    // Wire the endpoint into the engine thread.
    let bind_addr = SocketAddr::new(config.ip, config.port);
    let inbound_scheduler = scheduler.clone();
    let endpoint = UdpEndpoint::bind(
        bind_addr,
        OUTBOUND_QUEUE,
        Box::new(move |source, bytes| {
            let now = Instant::now();
            inbound_scheduler.register(move |engine: &mut Engine| {
                engine.on_incoming_packets(now, vec![(source, bytes)]);
            });
        }),
    )
    .await?;
    info!("listening on {}", endpoint.local_addr().unwrap_or(bind_addr));
    let endpoint: Arc<dyn Endpoint> = Arc::new(endpoint);
    let engine_endpoint = endpoint.clone();
    scheduler
        .call(move |engine| engine.set_endpoint(engine_endpoint))
        .map_err(|e| anyhow::anyhow!("engine stopped during startup: {e}"))?;

    // Replay previously destroyed overlays.
    let storage_path = shared.storage_path.clone();
    scheduler.register(move |engine| load_persistent_storage(engine, &storage_path));

    // Periodic work: strikes, buffer expiry, statistics.  Each generator
    // finishes at its next wake once shutdown starts.
    let handle = scheduler.clone();
    scheduler.register_generator(STRIKE_INTERVAL, 0, move |engine| {
        if handle.is_shutting_down() {
            return None;
        }
        engine.tick_strikes(Instant::now());
        Some(STRIKE_INTERVAL)
    });
    let handle = scheduler.clone();
    scheduler.register_generator(MAINTENANCE_INTERVAL, 0, move |engine| {
        if handle.is_shutting_down() {
            return None;
        }
        engine.tick_maintenance(Instant::now());
        Some(MAINTENANCE_INTERVAL)
    });
    if !config.silent {
        let handle = scheduler.clone();
        scheduler.register_generator(STATISTICS_INTERVAL, 0, move |engine| {
            if handle.is_shutting_down() {
                return None;
            }
            print_statistics(engine);
            Some(STATISTICS_INTERVAL)
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    if !scheduler.shutdown() {
        warn!("improper stop: engine tasks did not drain");
    }
    Ok(())
}
