//! CLI entry point for the stm transcoding daemon
//!
//! Parses command line arguments, runs the startup sequence, and drives a
//! graceful shutdown on SIGINT/SIGTERM.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use stm_config::{Config, SharedConfig};
use stm_daemon::cleaner::Cleaner;
use stm_daemon::encode::EncodeDriver;
use stm_daemon::logging::init_logging;
use stm_daemon::media::{Ffmpeg, MediaToolkit};
use stm_daemon::metrics::Metrics;
use stm_daemon::scan::Scanner;
use stm_daemon::server::{run_server, AppState};
use stm_daemon::store::TaskStore;
use stm_daemon::worker::WorkerPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// stm - automated media transcoding daemon
#[derive(Parser, Debug)]
#[command(name = "stm")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Control-plane listen address
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration from {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    // Held until exit so buffered file output is flushed
    let _log_guard = init_logging(&config.log);
    info!(config = %args.config.display(), "stm starting");

    match run(config, args.listen).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "daemon failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config, listen: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let config = SharedConfig::new(config);

    let store = TaskStore::open(&config.database_path()).await?;
    // No task may survive a restart in the processing state
    let recovered = store.reset_processing_to_pending().await?;
    if recovered > 0 {
        info!(recovered, "interrupted tasks requeued");
    }

    let metrics = Metrics::new()?;
    let media: Arc<dyn MediaToolkit> = Arc::new(Ffmpeg::default());
    let scanner = Scanner::new(config.clone(), store.clone(), media.clone());
    let driver = EncodeDriver::new(config.clone(), store.clone(), media, metrics.clone());
    let pool = WorkerPool::new(config.clone(), store.clone(), driver, metrics.clone());
    let cleaner = Cleaner::new(config.clone(), store.clone(), metrics.clone());

    let shutdown = CancellationToken::new();

    let scan_handle = tokio::spawn({
        let scanner = scanner.clone();
        let token = shutdown.clone();
        async move { scanner.run_periodically(token).await }
    });
    let pool_handle = tokio::spawn({
        let pool = pool.clone();
        let token = shutdown.clone();
        async move { pool.run(token).await }
    });
    let cleaner_handle = tokio::spawn({
        let cleaner = cleaner.clone();
        let token = shutdown.clone();
        async move { cleaner.run(token).await }
    });

    let state = AppState {
        config,
        store,
        scanner,
        pool,
        cleaner,
        metrics,
    };
    let mut server_handle = tokio::spawn(run_server(state, listen, shutdown.clone()));

    info!("all services started");

    let server_finished = tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("shutdown signal received, draining");
            false
        }
        result = &mut server_handle => {
            match result {
                Ok(Err(e)) => error!(error = %e, "control plane failed"),
                Err(e) => error!(error = %e, "control plane panicked"),
                Ok(Ok(())) => warn!("control plane exited"),
            }
            true
        }
    };

    shutdown.cancel();

    // The pool drain waits for in-flight encodes; the rest exit promptly
    let _ = pool_handle.await;
    let _ = scan_handle.await;
    let _ = cleaner_handle.await;
    if !server_finished {
        let _ = server_handle.await;
    }

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
