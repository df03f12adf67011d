//! JsonlSink - appends tagged events to a JSON-lines file

use contracts::{EventSink, HubError, TaggedEvent};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::{debug, error, info, instrument};

/// Configuration for JsonlSink
#[derive(Debug, Clone)]
pub struct JsonlSinkConfig {
    /// Output directory; one file per hub run
    pub base_path: PathBuf,

    /// Explicit file name; defaults to a timestamped `capture-*.jsonl`
    pub file_name: Option<String>,
}

impl JsonlSinkConfig {
    /// Create config from params map
    pub fn from_params(params: &HashMap<String, String>) -> Self {
        let base_path = params
            .get("base_path")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./output"));
        let file_name = params.get("file_name").cloned();
        Self {
            base_path,
            file_name,
        }
    }
}

/// Sink that writes one JSON document per line, append-only.
///
/// Sinks run on their own worker task, so blocking file IO here never stalls
/// the tagging pipeline.
pub struct JsonlSink {
    name: String,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonlSink {
    pub fn new(name: impl Into<String>, config: JsonlSinkConfig) -> std::io::Result<Self> {
        fs::create_dir_all(&config.base_path)?;

        let file_name = config.file_name.unwrap_or_else(|| {
            format!(
                "capture-{}.jsonl",
                chrono::Utc::now().format("%Y%m%d-%H%M%S")
            )
        });
        let path = config.base_path.join(file_name);
        let writer = BufWriter::new(
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?,
        );

        info!(path = %path.display(), "jsonl sink opened");
        Ok(Self {
            name: name.into(),
            path,
            writer: Some(writer),
        })
    }

    /// Create from params map (for the factory)
    pub fn from_params(
        name: impl Into<String>,
        params: &HashMap<String, String>,
    ) -> std::io::Result<Self> {
        Self::new(name, JsonlSinkConfig::from_params(params))
    }

    /// Path of the file being written
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn append_line(&mut self, event: &TaggedEvent) -> std::io::Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "sink already closed")
        })?;
        serde_json::to_writer(&mut *writer, event)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writer.write_all(b"\n")
    }
}

impl EventSink for JsonlSink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        name = "jsonl_sink_write",
        skip(self, event),
        fields(sink = %self.name, device = %event.event.device_id)
    )]
    async fn write(&mut self, event: &TaggedEvent) -> Result<(), HubError> {
        self.append_line(event).map_err(|e| {
            error!(sink = %self.name, error = %e, "append failed");
            HubError::sink_write(&self.name, e.to_string())
        })
    }

    #[instrument(name = "jsonl_sink_flush", skip(self))]
    async fn flush(&mut self) -> Result<(), HubError> {
        if let Some(writer) = self.writer.as_mut() {
            writer
                .flush()
                .map_err(|e| HubError::sink_write(&self.name, e.to_string()))?;
        }
        Ok(())
    }

    #[instrument(name = "jsonl_sink_close", skip(self))]
    async fn close(&mut self) -> Result<(), HubError> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| HubError::sink_write(&self.name, e.to_string()))?;
        }
        debug!(sink = %self.name, "jsonl sink closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{DataEvent, DataEventKind};
    use tempfile::tempdir;

    fn tagged(nanos: i64) -> TaggedEvent {
        TaggedEvent {
            event: DataEvent::new(DataEventKind::ThermalFrame, "cam_1".into(), nanos),
            global_nanos: nanos + 5,
            uncertainty_nanos: 2,
            low_confidence: false,
        }
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_parseable_lines() {
        let dir = tempdir().unwrap();
        let config = JsonlSinkConfig {
            base_path: dir.path().to_path_buf(),
            file_name: Some("events.jsonl".to_string()),
        };

        let mut sink = JsonlSink::new("test_jsonl", config).unwrap();
        sink.write(&tagged(1)).await.unwrap();
        sink.write(&tagged(2)).await.unwrap();
        sink.close().await.unwrap();

        let content = fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: TaggedEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.global_nanos, 6);
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let dir = tempdir().unwrap();
        let config = JsonlSinkConfig {
            base_path: dir.path().to_path_buf(),
            file_name: Some("events.jsonl".to_string()),
        };

        let mut sink = JsonlSink::new("test_jsonl", config).unwrap();
        sink.close().await.unwrap();
        assert!(sink.write(&tagged(1)).await.is_err());
    }
}
