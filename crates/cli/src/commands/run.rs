//! `run` command implementation.

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::hub::{AutoSessionConfig, HubRunner, RunnerConfig};

/// Execute the `run` command
pub async fn run_hub(args: &RunArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration");

    // Validate config path
    if !args.config.exists() {
        anyhow::bail!("Configuration file not found: {}", args.config.display());
    }

    // Load and parse configuration
    let mut config = config_loader::ConfigLoader::load_from_path(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    // Apply CLI overrides
    if let Some(ref bind) = args.bind {
        info!(bind = %bind, "Overriding bind address from CLI");
        config.server.bind_addr = bind.clone();
    }
    if let Some(port) = args.port {
        info!(port = %port, "Overriding port from CLI");
        config.server.port = port;
    }

    info!(
        controller_id = %config.server.controller_id,
        bind = %config.server.bind_addr,
        port = config.server.port,
        mode = ?config.session.mode,
        sinks = config.sinks.len(),
        "Configuration loaded"
    );

    // Dry run - just validate and exit
    if args.dry_run {
        info!("Dry run mode - configuration is valid, exiting");
        print_config_summary(&config);
        return Ok(());
    }

    // Build runner configuration
    let runner_config = RunnerConfig {
        config,
        duration: if args.duration == 0 {
            None
        } else {
            Some(Duration::from_secs(args.duration))
        },
        auto_session: if args.min_devices == 0 {
            None
        } else {
            Some(AutoSessionConfig {
                min_devices: args.min_devices,
                record_for: Duration::from_secs(args.session_duration),
            })
        },
        metrics_port: if args.metrics_port == 0 {
            None
        } else {
            Some(args.metrics_port)
        },
    };

    // Create and run the hub
    let runner = HubRunner::new(runner_config);

    // Setup graceful shutdown handler
    let shutdown_signal = setup_shutdown_signal();

    info!("Starting hub...");

    // Run hub with shutdown signal
    tokio::select! {
        result = runner.run() => {
            match result {
                Ok(stats) => {
                    info!(
                        duration_secs = stats.duration.as_secs_f64(),
                        devices_peak = stats.devices_peak,
                        sessions_run = stats.sessions_run,
                        "Hub completed successfully"
                    );

                    // Print detailed statistics
                    stats.print_summary();
                }
                Err(e) => {
                    return Err(e).context("Hub execution failed");
                }
            }
        }
        _ = shutdown_signal => {
            warn!("Received shutdown signal, stopping hub...");
        }
    }

    info!("Capture Hub finished");
    Ok(())
}

/// Setup Ctrl+C and SIGTERM signal handlers
async fn setup_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Print configuration summary for dry-run mode
fn print_config_summary(config: &contracts::HubConfig) {
    println!("\n=== Configuration Summary ===\n");
    println!("Server:");
    println!("  Controller id: {}", config.server.controller_id);
    println!(
        "  Listener: {}:{}",
        config.server.bind_addr, config.server.port
    );
    println!("\nClock sync:");
    println!(
        "  {} probes/round, resync every {}s",
        config.clock_sync.probes_per_round, config.clock_sync.resync_interval_s
    );
    println!("\nSession:");
    println!("  Mode: {:?}", config.session.mode);
    match config.session.quorum {
        Some(q) => println!("  Quorum: {}", q),
        None => println!("  Quorum: all armed members"),
    }

    if !config.sinks.is_empty() {
        println!("\nSinks ({}):", config.sinks.len());
        for sink in &config.sinks {
            println!("  - {} ({:?})", sink.name, sink.sink_type);
        }
    }

    println!();
}
