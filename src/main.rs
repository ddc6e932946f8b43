//! blocksignal: multi-source chain tip watcher and signal emitter.
//!
//! Wires the core together: config snapshot, dispatcher, runner, and
//! broadcast hub. Subscriber transport and the admin surface live
//! outside this binary; they consume the hub, the status channel, and
//! the config handle.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use blocksignal::config::{self, AppConfig, ConfigError};
use blocksignal::hub::SignalHub;
use blocksignal::lifecycle::{self, RunLock};
use blocksignal::runner::status::StatusStore;
use blocksignal::runner::Runner;
use blocksignal::source::dispatcher::Dispatcher;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "blocksignal.toml".to_string());
    let (cfg, used_defaults) = match AppConfig::load(Path::new(&config_path)) {
        Ok(cfg) => (cfg, false),
        Err(ConfigError::Io(_)) => (AppConfig::default(), true),
        // corrupt or invalid config is the one fatal boot condition
        Err(err) => return Err(err.into()),
    };

    // RUST_LOG wins; the config's level is the fallback
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.logging.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cfg.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }

    if used_defaults {
        info!(path = %config_path, "no config file, starting with defaults");
    }

    let _run_lock = RunLock::acquire(lifecycle::RUNNING_LOCK)?;
    info!("SYSTEM_START");

    let (config_handle, cfg_rx) = config::channel(cfg)?;
    info!(
        rule = %config_handle.current().classifier_rule,
        sources = config_handle.current().sources.len(),
        machines = config_handle.current().machines.len(),
        "configuration loaded"
    );

    let hub = Arc::new(SignalHub::new());
    let dispatcher = Arc::new(Dispatcher::new());
    let status = Arc::new(StatusStore::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner = Runner::new(
        cfg_rx,
        Arc::clone(&dispatcher),
        Arc::clone(&hub),
        Arc::clone(&status),
        shutdown_rx,
    );
    let runner_task = tokio::spawn(runner.run());

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    let _ = runner_task.await;

    // keep the config channel open for the runner's whole lifetime
    drop(config_handle);
    Ok(())
}
