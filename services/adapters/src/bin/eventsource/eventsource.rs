//! Event Source Binary
//!
//! Runs one adapter per descriptor file until Ctrl-C.

use anyhow::{bail, Context};
use clap::Parser;
use eventsource_adapters::config::load_descriptor;
use eventsource_adapters::{
    build_event_source, supervise, AdapterConfig, AdapterMetrics, Dispatch, Metrics,
    RelayDispatcher, StdoutDispatcher, SupervisedExit, VolumeSecretResolver,
};
use futures_util::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "eventsource")]
#[command(about = "Forward events from brokers and watched directories to a dispatch pipeline")]
struct Args {
    /// Descriptor file (YAML or JSON); repeat to run several adapters
    #[arg(short, long, required = true)]
    config: Vec<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Relay Unix socket to dispatch to
    #[arg(long, conflicts_with = "stdout")]
    relay: Option<PathBuf>,

    /// Write events to stdout as JSON lines (default when no relay is given)
    #[arg(long)]
    stdout: bool,
}

fn init_logging(args: &Args) {
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // stdout may carry events, so logs go to stderr
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if args.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = AdapterConfig::from_env();
    config.validate().context("invalid runtime configuration")?;

    let dispatch: Arc<dyn Dispatch> = match &args.relay {
        Some(socket) => {
            info!(socket = %socket.display(), "dispatching to relay");
            Arc::new(RelayDispatcher::new(socket))
        }
        None => Arc::new(StdoutDispatcher::new()),
    };

    let secrets = Arc::new(VolumeSecretResolver::new(&config.secrets_mount));
    let metrics = Arc::new(AdapterMetrics::new());
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let mut names = Vec::new();
    let mut runs = Vec::new();
    for path in &args.config {
        let descriptor = load_descriptor(path)
            .with_context(|| format!("failed to load descriptor {}", path.display()))?;
        let source = build_event_source(
            descriptor,
            &config,
            secrets.clone(),
            metrics.clone() as Arc<dyn Metrics>,
        )
        .with_context(|| format!("failed to build adapter for {}", path.display()))?;

        info!(
            event_source_name = %source.event_source_name(),
            event_name = %source.event_name(),
            event_source_type = %source.event_source_type(),
            "starting event source"
        );
        names.push((
            source.event_source_name().to_string(),
            source.event_name().to_string(),
        ));
        runs.push(supervise(source, shutdown_tx.subscribe(), dispatch.clone()));
    }

    let all_runs = join_all(runs);
    tokio::pin!(all_runs);

    let finished = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            info!("received shutdown signal");
            None
        }
        exits = &mut all_runs => {
            warn!("every event source stopped on its own");
            Some(exits)
        }
    };
    let _ = shutdown_tx.send(());
    let exits = match finished {
        Some(exits) => exits,
        None => all_runs.await,
    };

    let mut failures = 0usize;
    for ((event_source_name, event_name), exit) in names.into_iter().zip(exits) {
        let exit = exit.context("supervisor task failed")?;
        let snapshot = metrics.snapshot(&event_source_name, &event_name);
        match exit {
            SupervisedExit::Completed => info!(
                %event_source_name,
                %event_name,
                processed = snapshot.processed,
                failed = snapshot.failed,
                "event source stopped"
            ),
            SupervisedExit::Failed(e) => {
                failures += 1;
                error!(%event_source_name, %event_name, error = %e, "event source failed");
            }
            SupervisedExit::Panicked(message) => {
                failures += 1;
                error!(%event_source_name, %event_name, panic = %message, "event source panicked");
            }
        }
    }

    if failures > 0 {
        bail!("{failures} event source(s) did not stop cleanly");
    }
    Ok(())
}
