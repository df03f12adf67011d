//! `info` command implementation.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::cli::InfoArgs;

/// Configuration info for JSON output
#[derive(Serialize)]
struct ConfigInfo {
    server: ServerInfo,
    clock_sync: ClockSyncInfo,
    heartbeat: HeartbeatInfo,
    session: SessionInfo,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sinks: Vec<SinkInfo>,
}

#[derive(Serialize)]
struct ServerInfo {
    controller_id: String,
    bind_addr: String,
    port: u16,
}

#[derive(Serialize)]
struct ClockSyncInfo {
    probes_per_round: usize,
    probe_timeout_ms: u64,
    resync_interval_s: u64,
    rtt_ceiling_ms: u64,
}

#[derive(Serialize)]
struct HeartbeatInfo {
    interval_ms: u64,
    max_missed: u32,
}

#[derive(Serialize)]
struct SessionInfo {
    mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    quorum: Option<usize>,
    arming_timeout_ms: u64,
    start_delay_ms: u64,
    allow_late_join: bool,
}

#[derive(Serialize)]
struct SinkInfo {
    name: String,
    sink_type: String,
    queue_capacity: usize,
}

/// Execute the `info` command
pub fn run_info(args: &InfoArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration info");

    if !args.config.exists() {
        anyhow::bail!("Configuration file not found: {}", args.config.display());
    }

    let config = config_loader::ConfigLoader::load_from_path(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    if args.json {
        let info = build_config_info(&config, args);
        let json =
            serde_json::to_string_pretty(&info).context("Failed to serialize config info")?;
        println!("{}", json);
    } else {
        print_config_info(&config, args);
    }

    Ok(())
}

fn build_config_info(config: &contracts::HubConfig, args: &InfoArgs) -> ConfigInfo {
    let sinks = if args.sinks {
        config
            .sinks
            .iter()
            .map(|s| SinkInfo {
                name: s.name.clone(),
                sink_type: format!("{:?}", s.sink_type),
                queue_capacity: s.queue_capacity,
            })
            .collect()
    } else {
        Vec::new()
    };

    ConfigInfo {
        server: ServerInfo {
            controller_id: config.server.controller_id.clone(),
            bind_addr: config.server.bind_addr.clone(),
            port: config.server.port,
        },
        clock_sync: ClockSyncInfo {
            probes_per_round: config.clock_sync.probes_per_round,
            probe_timeout_ms: config.clock_sync.probe_timeout_ms,
            resync_interval_s: config.clock_sync.resync_interval_s,
            rtt_ceiling_ms: config.clock_sync.rtt_ceiling_ms,
        },
        heartbeat: HeartbeatInfo {
            interval_ms: config.heartbeat.interval_ms,
            max_missed: config.heartbeat.max_missed,
        },
        session: SessionInfo {
            mode: format!("{:?}", config.session.mode),
            quorum: config.session.quorum,
            arming_timeout_ms: config.session.arming_timeout_ms,
            start_delay_ms: config.session.start_delay_ms,
            allow_late_join: config.session.allow_late_join,
        },
        sinks,
    }
}

fn print_config_info(config: &contracts::HubConfig, args: &InfoArgs) {
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                 Capture Hub Configuration                    ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    println!("Server");
    println!("   ├─ Controller id: {}", config.server.controller_id);
    println!(
        "   └─ Listener: {}:{}",
        config.server.bind_addr, config.server.port
    );

    println!("\nClock sync");
    println!(
        "   ├─ Probes per round: {}",
        config.clock_sync.probes_per_round
    );
    println!(
        "   ├─ Probe timeout: {} ms",
        config.clock_sync.probe_timeout_ms
    );
    println!(
        "   ├─ Resync interval: {} s",
        config.clock_sync.resync_interval_s
    );
    println!("   └─ RTT ceiling: {} ms", config.clock_sync.rtt_ceiling_ms);

    println!("\nHeartbeat");
    println!("   ├─ Interval: {} ms", config.heartbeat.interval_ms);
    println!("   └─ Max missed: {}", config.heartbeat.max_missed);

    println!("\nSession");
    println!("   ├─ Mode: {:?}", config.session.mode);
    match config.session.quorum {
        Some(q) => println!("   ├─ Quorum: {}", q),
        None => println!("   ├─ Quorum: all armed members"),
    }
    println!(
        "   ├─ Arming timeout: {} ms",
        config.session.arming_timeout_ms
    );
    println!("   ├─ Start delay: {} ms", config.session.start_delay_ms);
    println!(
        "   └─ Late join: {}",
        if config.session.allow_late_join {
            "allowed"
        } else {
            "disabled"
        }
    );

    if !config.sinks.is_empty() {
        println!("\nSinks ({})", config.sinks.len());
        for (i, sink) in config.sinks.iter().enumerate() {
            let is_last = i == config.sinks.len() - 1;
            let prefix = if is_last { "└─" } else { "├─" };
            if args.sinks {
                println!(
                    "   {} {} ({:?}, queue {})",
                    prefix, sink.name, sink.sink_type, sink.queue_capacity
                );
            } else {
                println!("   {} {} ({:?})", prefix, sink.name, sink.sink_type);
            }
        }
    }

    println!();
}
