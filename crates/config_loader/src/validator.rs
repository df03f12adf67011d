//! Config validation
//!
//! Rules:
//! - field-level ranges via the `validator` derives on `HubConfig`
//! - sink names unique and non-empty
//! - udp sinks carry a parseable `addr` parameter
//! - sink queues hold at least one event
//! - quorum settings consistent with the session mode

use std::collections::HashSet;
use std::net::SocketAddr;

use contracts::{HubConfig, HubError, SessionMode, SinkType};
use validator::Validate;

/// Validate a parsed HubConfig
///
/// Returns the first error encountered, or Ok(()).
pub fn validate(config: &HubConfig) -> Result<(), HubError> {
    validate_field_rules(config)?;
    validate_session(config)?;
    validate_sinks(config)?;
    Ok(())
}

/// Run the derive-level range and length rules
fn validate_field_rules(config: &HubConfig) -> Result<(), HubError> {
    config
        .validate()
        .map_err(|e| HubError::config_validation("config", e.to_string()))
}

/// Quorum is only consulted in degraded mode; rejecting the combination
/// early beats silently ignoring it at arming time.
fn validate_session(config: &HubConfig) -> Result<(), HubError> {
    let session = &config.session;

    if let Some(quorum) = session.quorum {
        if quorum == 0 {
            return Err(HubError::config_validation(
                "session.quorum",
                "quorum must be >= 1",
            ));
        }
        if session.mode == SessionMode::Strict {
            return Err(HubError::config_validation(
                "session.quorum",
                "quorum has no effect in strict mode; use mode = \"degraded\"",
            ));
        }
    }

    Ok(())
}

/// Validate sink entries
fn validate_sinks(config: &HubConfig) -> Result<(), HubError> {
    let mut seen = HashSet::new();

    for (idx, sink) in config.sinks.iter().enumerate() {
        if sink.name.is_empty() {
            return Err(HubError::config_validation(
                format!("sinks[{idx}].name"),
                "sink name cannot be empty",
            ));
        }

        if !seen.insert(&sink.name) {
            return Err(HubError::config_validation(
                format!("sinks[name={}]", sink.name),
                "duplicate sink name",
            ));
        }

        if sink.queue_capacity == 0 {
            return Err(HubError::config_validation(
                format!("sinks[{}].queue_capacity", sink.name),
                "queue_capacity must be >= 1",
            ));
        }

        if sink.sink_type == SinkType::Udp {
            let addr = sink.params.get("addr").ok_or_else(|| {
                HubError::config_validation(
                    format!("sinks[{}].params.addr", sink.name),
                    "udp sink requires an 'addr' parameter",
                )
            })?;
            addr.parse::<SocketAddr>().map_err(|e| {
                HubError::config_validation(
                    format!("sinks[{}].params.addr", sink.name),
                    format!("invalid socket address '{addr}': {e}"),
                )
            })?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::SinkConfig;
    use std::collections::HashMap;

    fn config_with_sinks(sinks: Vec<SinkConfig>) -> HubConfig {
        HubConfig {
            sinks,
            ..Default::default()
        }
    }

    fn sink(name: &str, sink_type: SinkType) -> SinkConfig {
        SinkConfig {
            name: name.to_string(),
            sink_type,
            queue_capacity: 256,
            params: HashMap::new(),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&HubConfig::default()).is_ok());
    }

    #[test]
    fn test_field_rule_violation_reported() {
        let mut config = HubConfig::default();
        config.clock_sync.probes_per_round = 0;
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("probes_per_round"), "got: {err}");
    }

    #[test]
    fn test_duplicate_sink_name() {
        let config = config_with_sinks(vec![
            sink("out", SinkType::Log),
            sink("out", SinkType::Jsonl),
        ]);
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("duplicate sink name"), "got: {err}");
    }

    #[test]
    fn test_empty_sink_name() {
        let config = config_with_sinks(vec![sink("", SinkType::Log)]);
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("cannot be empty"), "got: {err}");
    }

    #[test]
    fn test_zero_queue_capacity() {
        let mut bad = sink("out", SinkType::Log);
        bad.queue_capacity = 0;
        let config = config_with_sinks(vec![bad]);
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("queue_capacity"), "got: {err}");
    }

    #[test]
    fn test_udp_sink_requires_addr() {
        let config = config_with_sinks(vec![sink("relay", SinkType::Udp)]);
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("'addr'"), "got: {err}");
    }

    #[test]
    fn test_udp_sink_rejects_bad_addr() {
        let mut relay = sink("relay", SinkType::Udp);
        relay
            .params
            .insert("addr".to_string(), "not-an-address".to_string());
        let config = config_with_sinks(vec![relay]);
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("invalid socket address"), "got: {err}");
    }

    #[test]
    fn test_quorum_with_strict_mode_rejected() {
        let mut config = HubConfig::default();
        config.session.mode = SessionMode::Strict;
        config.session.quorum = Some(2);
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("strict mode"), "got: {err}");
    }

    #[test]
    fn test_quorum_in_degraded_mode_accepted() {
        let mut config = HubConfig::default();
        config.session.mode = SessionMode::Degraded;
        config.session.quorum = Some(2);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_quorum_rejected() {
        let mut config = HubConfig::default();
        config.session.mode = SessionMode::Degraded;
        config.session.quorum = Some(0);
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("quorum must be >= 1"), "got: {err}");
    }
}
