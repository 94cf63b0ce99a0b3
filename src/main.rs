//! Postern - multi-session gateway for an E2E-encrypted chat network

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use postern::config::Args;
use postern::events::EventBus;
use postern::pipeline::SendPipeline;
use postern::server::{self, AppState};
use postern::store::StoreManager;
use postern::supervisor::Supervisor;
use postern::transport::{MemoryTransportFactory, TransportFactory};
use postern::{logging, PosternError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    if let Err(e) = args.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Hold the guard so the rotating log file flushes on exit
    let _log_guard = logging::init(&args.log_dir, &args.log_level)?;

    info!("======================================");
    info!("  Postern - chat network gateway");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!(
        "Mode: {}",
        if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" }
    );
    info!("Data dir: {}", args.data_dir.display());
    info!("Send spacing: {}s", args.send_spacing_secs);
    info!(
        "Duplicate window: {}s (max {})",
        args.duplicate_window().as_secs(),
        args.duplicate_max
    );
    info!(
        "Event bus: {} workers, {} slots",
        args.event_workers, args.event_queue_capacity
    );
    info!("======================================");

    let stores = StoreManager::new(args.data_dir.clone());
    stores
        .ensure_data_dir()
        .map_err(|e| anyhow::anyhow!("failed to create data directory: {}", e))?;

    let bus = Arc::new(EventBus::new(
        args.event_queue_capacity,
        args.event_workers,
    ));

    // The upstream protocol library plugs in behind the transport seam;
    // this build ships the loopback transport, which auto-links in dev mode.
    if !args.dev_mode {
        warn!("No vendor transport configured, using the loopback transport");
    }
    let factory: Arc<dyn TransportFactory> = Arc::new(MemoryTransportFactory::new(args.dev_mode));

    let supervisor = Supervisor::new(stores, factory, bus, args.session_config());

    // Every store file on disk is a latent session
    supervisor.restore_all().await;

    if let Some(max_idle) = args.idle_reap_threshold() {
        supervisor.spawn_reaper(args.reap_interval(), max_idle);
        info!(
            "Idle reaper enabled: threshold {}s, sweep every {}s",
            max_idle.as_secs(),
            args.reap_interval_secs
        );
    }

    let pipeline = Arc::new(
        SendPipeline::new(Arc::clone(&supervisor), args.pipeline_config())
            .map_err(|e| anyhow::anyhow!("{}", e))?,
    );

    let state = Arc::new(AppState::new(
        args,
        Arc::clone(&supervisor),
        pipeline,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_handle = tokio::spawn(server::run(Arc::clone(&state), shutdown_rx));

    wait_for_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    supervisor.shutdown(Duration::from_secs(5)).await;

    match tokio::time::timeout(Duration::from_secs(5), server_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => report_server_error(e),
        Ok(Err(join_err)) => error!("Server task failed: {}", join_err),
        Err(_) => warn!("Server did not stop within the shutdown deadline"),
    }

    info!("Postern exited");
    Ok(())
}

fn report_server_error(err: PosternError) {
    error!("Server error: {}", err);
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
