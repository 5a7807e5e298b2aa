mod config;
mod dispatcher;
mod expiry;
mod merge_worker;
mod runner;
mod shutdown;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use conductor_engine::{Services, SystemClock};
use conductor_store::{NotifyHub, Store};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;
use crate::expiry::ExpiryWorker;
use crate::merge_worker::MergeWorker;
use crate::runner::{EchoRunner, GitUnavailable, NoopRealtime};

/// Conductor daemon — governed orchestration backbone for coding agents.
#[derive(Parser, Debug)]
#[command(name = "conductord", version, about)]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    /// Increase log verbosity (debug level).
    #[arg(short, long)]
    verbose: bool,

    /// Validate config and exit.
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::load_config(&cli.config)?;
    config::validate_config(&config)?;
    if cli.validate {
        println!("config is valid");
        return Ok(());
    }

    telemetry::init_telemetry(cli.verbose);
    info!(store = %config.store.path.display(), "conductord starting");

    let store = Store::open(&config.store.path)
        .await
        .map_err(|err| anyhow::anyhow!("failed to open store: {err}"))?;
    let notify = NotifyHub::default();
    let config = Arc::new(config);
    let services = Services::new(
        store,
        notify.clone(),
        Arc::new(SystemClock),
        config.clone(),
    );

    // Deployment seams. Real adapter and git backends are injected by the
    // embedding application; the bundled stand-ins keep queues moving.
    warn!("no adapter registry configured, using the echo runner");
    let agent_runner = Arc::new(EchoRunner);
    let git = Arc::new(GitUnavailable);
    let realtime = Arc::new(NoopRealtime);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher = Dispatcher::new(
        services.clone(),
        notify.clone(),
        agent_runner,
        realtime,
        config.dispatcher.clone(),
    );
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_rx.clone()));

    let merge_worker = MergeWorker::new(services.clone(), git, config.merge.clone());
    let merge_handle = tokio::spawn(merge_worker.run(shutdown_rx.clone()));

    let expiry_worker = ExpiryWorker::new(services.humans.clone(), config.human_loop.clone());
    let expiry_handle = tokio::spawn(expiry_worker.run(shutdown_rx));

    tokio::spawn(shutdown::signal_listener(shutdown_tx.clone()));

    let mut shutdown_watch = shutdown_tx.subscribe();
    loop {
        shutdown_watch.changed().await?;
        if *shutdown_watch.borrow() {
            break;
        }
    }

    info!("waiting for workers to stop");
    let _ = dispatcher_handle.await;
    let _ = merge_handle.await;
    let _ = expiry_handle.await;
    info!("conductord stopped");
    Ok(())
}
