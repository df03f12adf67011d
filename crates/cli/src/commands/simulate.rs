//! `simulate` command implementation.

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{info, warn};

use device_sim::{DeviceSimConfig, SensorSpec, SimulatedDevice};

use crate::cli::SimulateArgs;

/// Execute the `simulate` command
pub async fn run_simulate(args: &SimulateArgs) -> Result<()> {
    if args.devices == 0 {
        anyhow::bail!("at least one device is required");
    }

    info!(
        server = %args.server,
        devices = args.devices,
        max_skew_ms = args.max_skew_ms,
        "Starting simulated device fleet"
    );

    let mut fleet = Vec::with_capacity(args.devices);
    for index in 0..args.devices {
        let device_id = format!("{}-{:02}", args.id_prefix, index + 1);
        let config = DeviceSimConfig {
            device_id: device_id.clone(),
            server_addr: args.server.clone(),
            clock_skew_nanos: skew_for(index, args.devices, args.max_skew_ms),
            sensors: vec![SensorSpec::gsr(32.0), SensorSpec::thermal(8.0)],
            reply_jitter_ms: args.reply_jitter_ms,
            ack_commands: !args.no_ack,
        };

        let device = SimulatedDevice::connect(config)
            .await
            .with_context(|| format!("Failed to connect device '{device_id}'"))?;
        info!(device = %device_id, "Device connected");
        fleet.push(device);
    }

    info!(devices = fleet.len(), "Fleet online");

    // Run until the duration elapses or a shutdown signal arrives
    let wait = async {
        if args.duration == 0 {
            std::future::pending::<()>().await;
        } else {
            tokio::time::sleep(Duration::from_secs(args.duration)).await;
            info!(secs = args.duration, "Run time elapsed");
        }
    };

    tokio::select! {
        _ = wait => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("Received shutdown signal, stopping fleet...");
        }
    }

    for device in fleet {
        device.stop().await;
    }

    info!("Fleet stopped");
    Ok(())
}

/// Spread device skews evenly across [-max_skew_ms, +max_skew_ms].
fn skew_for(index: usize, total: usize, max_skew_ms: i64) -> i64 {
    let max_nanos = max_skew_ms * 1_000_000;
    if total <= 1 {
        return max_nanos;
    }
    let span = 2 * max_nanos;
    -max_nanos + span * index as i64 / (total - 1) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skews_span_the_range() {
        assert_eq!(skew_for(0, 3, 50), -50_000_000);
        assert_eq!(skew_for(1, 3, 50), 0);
        assert_eq!(skew_for(2, 3, 50), 50_000_000);
    }

    #[test]
    fn test_single_device_gets_full_skew() {
        assert_eq!(skew_for(0, 1, 20), 20_000_000);
    }
}
