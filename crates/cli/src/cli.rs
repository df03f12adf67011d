//! CLI argument definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Capture Hub - multi-device capture synchronization hub
#[derive(Parser, Debug)]
#[command(
    name = "capture-hub",
    author,
    version,
    about = "Multi-device capture synchronization hub",
    long_about = "Coordinates a fleet of capture devices over TCP.\n\n\
                  Estimates each device's clock offset against the hub's reference \n\
                  clock, orchestrates synchronized start/stop of recording sessions, \n\
                  and tags incoming sensor events onto the common timeline before \n\
                  fanning them out to configured sinks."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "CAPTURE_HUB_VERBOSE")]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        default_value = "pretty",
        global = true,
        env = "CAPTURE_HUB_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the hub
    Run(RunArgs),

    /// Run a fleet of simulated capture devices against a hub
    Simulate(SimulateArgs),

    /// Validate configuration file without running
    Validate(ValidateArgs),

    /// Display configuration information
    Info(InfoArgs),
}

/// Arguments for the `run` command
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Path to configuration file (TOML or JSON)
    #[arg(short, long, default_value = "hub.toml", env = "CAPTURE_HUB_CONFIG")]
    pub config: PathBuf,

    /// Override listener bind address from configuration
    #[arg(long, env = "CAPTURE_HUB_BIND")]
    pub bind: Option<String>,

    /// Override listener port from configuration
    #[arg(long, env = "CAPTURE_HUB_PORT")]
    pub port: Option<u16>,

    /// Hub run time in seconds (0 = run until interrupted)
    #[arg(long, default_value = "0", env = "CAPTURE_HUB_DURATION")]
    pub duration: u64,

    /// Start a session automatically once this many devices are ready
    /// (0 = sessions are never started automatically)
    #[arg(long, default_value = "0", env = "CAPTURE_HUB_MIN_DEVICES")]
    pub min_devices: usize,

    /// Recording length for automatically started sessions, in seconds
    #[arg(long, default_value = "10", env = "CAPTURE_HUB_SESSION_DURATION")]
    pub session_duration: u64,

    /// Validate configuration and exit without running the hub
    #[arg(long)]
    pub dry_run: bool,

    /// Metrics server port (0 = disabled)
    #[arg(long, default_value = "9000", env = "CAPTURE_HUB_METRICS_PORT")]
    pub metrics_port: u16,
}

/// Arguments for the `simulate` command
#[derive(Parser, Debug, Clone)]
pub struct SimulateArgs {
    /// Hub address to connect to, `host:port`
    #[arg(short, long, default_value = "127.0.0.1:8080", env = "CAPTURE_HUB_SERVER")]
    pub server: String,

    /// Number of simulated devices to spawn
    #[arg(short, long, default_value = "3")]
    pub devices: usize,

    /// Device id prefix; devices are named `<prefix>-01`, `<prefix>-02`, ...
    #[arg(long, default_value = "sim")]
    pub id_prefix: String,

    /// Largest clock skew magnitude assigned to any device, in milliseconds.
    /// Devices are spread across [-max_skew_ms, +max_skew_ms].
    #[arg(long, default_value = "50")]
    pub max_skew_ms: i64,

    /// Random extra delay before answering sync probes, in milliseconds
    #[arg(long, default_value = "0")]
    pub reply_jitter_ms: u64,

    /// Do not acknowledge session commands (simulates misbehaving devices)
    #[arg(long)]
    pub no_ack: bool,

    /// Run time in seconds (0 = run until interrupted)
    #[arg(long, default_value = "0")]
    pub duration: u64,
}

/// Arguments for the `validate` command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to configuration file to validate
    #[arg(short, long, default_value = "hub.toml")]
    pub config: PathBuf,

    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `info` command
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "hub.toml")]
    pub config: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Show sink configuration
    #[arg(long)]
    pub sinks: bool,
}

/// Log output format
#[derive(ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}
