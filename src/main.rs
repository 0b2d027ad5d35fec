//! CLI entry point for the namespace relay (nsrelay).

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use nix::unistd::Pid;

use nsrelay::cli::Cli;
use nsrelay::config::{load_config, load_default_config, RelayConfig};
use nsrelay::relay::RelayManager;
use nsrelay::utils::{init_debug_logging, is_debug_enabled, wait_for_exit};

/// How often the sandboxed process is checked for exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn load_settings(cli: &Cli) -> anyhow::Result<RelayConfig> {
    let mut config = match cli.get_settings_path() {
        Some(path) if path.exists() => load_config(&path)
            .with_context(|| format!("Error loading config from {}", path.display()))?,
        _ => load_default_config().context("Error loading default config")?,
    };
    config.forwards.extend(cli.forwards.iter().cloned());
    config.validate().context("Invalid forward")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // Initialize logging
    init_debug_logging(cli.debug);

    let config = match load_settings(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::from(1);
        }
    };

    let pid = Pid::from_raw(cli.pid);
    if config.enabled_count() == 0 {
        tracing::warn!("No forwards configured for pid {}", pid);
    }

    let mut manager = RelayManager::new();
    if let Err(e) = manager.setup(pid, &config.forwards).await {
        eprintln!("Failed to set up forwarding: {}", e);
        manager.shutdown().await;
        return ExitCode::from(1);
    }

    tracing::info!("Forwarding {} socket(s) for pid {}", manager.forward_count(), pid);
    if is_debug_enabled() {
        match serde_json::to_string_pretty(&manager.list_forwards()) {
            Ok(json) => tracing::debug!("Active forwards: {}", json),
            Err(e) => tracing::debug!("Could not render forward list: {}", e),
        }
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            }
            tracing::info!("Interrupted, stopping");
        }
        _ = wait_for_exit(pid, EXIT_POLL_INTERVAL) => {
            tracing::info!("Process {} exited, stopping", pid);
        }
    }

    // Cleanup
    manager.shutdown().await;
    ExitCode::SUCCESS
}
