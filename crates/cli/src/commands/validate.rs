//! `validate` command implementation.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::cli::ValidateArgs;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    controller_id: String,
    listen_addr: String,
    session_mode: String,
    quorum: Option<usize>,
    sink_count: usize,
}

/// Execute the `validate` command
pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = %args.config.display(), "Validating configuration");

    let result = validate_config(args);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{}", json);
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.display().to_string();

    // Check file exists
    if !args.config.exists() {
        return ValidationResult {
            valid: false,
            config_path,
            error: Some(format!("File not found: {}", args.config.display())),
            warnings: None,
            summary: None,
        };
    }

    // Try to load and validate
    match config_loader::ConfigLoader::load_from_path(&args.config) {
        Ok(config) => {
            let warnings = collect_warnings(&config);

            ValidationResult {
                valid: true,
                config_path,
                error: None,
                warnings: if warnings.is_empty() {
                    None
                } else {
                    Some(warnings)
                },
                summary: Some(ConfigSummary {
                    controller_id: config.server.controller_id.clone(),
                    listen_addr: format!("{}:{}", config.server.bind_addr, config.server.port),
                    session_mode: format!("{:?}", config.session.mode),
                    quorum: config.session.quorum,
                    sink_count: config.sinks.len(),
                }),
            }
        }
        Err(e) => ValidationResult {
            valid: false,
            config_path,
            error: Some(e.to_string()),
            warnings: None,
            summary: None,
        },
    }
}

/// Collect configuration warnings (non-fatal issues)
fn collect_warnings(config: &contracts::HubConfig) -> Vec<String> {
    use contracts::SessionMode;

    let mut warnings = Vec::new();

    // Check for empty sinks
    if config.sinks.is_empty() {
        warnings.push("No sinks configured - tagged events will be dropped".to_string());
    }

    // Degraded mode without an explicit quorum still requires every armed
    // member, which defeats its purpose
    if config.session.mode == SessionMode::Degraded && config.session.quorum.is_none() {
        warnings.push(
            "session.mode is 'degraded' but no quorum is set - all armed members \
             are still required"
                .to_string(),
        );
    }

    // A heartbeat window longer than the arming window hides dead devices
    // from the arming decision
    let heartbeat_window_ms =
        config.heartbeat.interval_ms * (config.heartbeat.max_missed as u64 + 1);
    if heartbeat_window_ms > config.session.arming_timeout_ms * 4 {
        warnings.push(format!(
            "heartbeat loss detection takes up to {}ms, much longer than the \
             {}ms arming window",
            heartbeat_window_ms, config.session.arming_timeout_ms
        ));
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    if result.valid {
        println!("✓ Configuration is valid: {}", result.config_path);

        if let Some(ref summary) = result.summary {
            println!("\n  Controller: {}", summary.controller_id);
            println!("  Listener: {}", summary.listen_addr);
            println!("  Session mode: {}", summary.session_mode);
            match summary.quorum {
                Some(q) => println!("  Quorum: {}", q),
                None => println!("  Quorum: all armed members"),
            }
            println!("  Sinks: {}", summary.sink_count);
        }

        if let Some(ref warnings) = result.warnings {
            println!("\n⚠ Warnings:");
            for warning in warnings {
                println!("  - {}", warning);
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", result.config_path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {}", error);
        }
    }
}
