use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::config::AppConfig;
use crate::errors::AppResult;

const BUFFER_FILE_NAME: &str = "pipeline-events.jsonl";
const MAX_ROTATED_FILES: usize = 2;

/// Pipeline event names written to the buffer.
pub mod events {
    pub const CACHE_HIT: &str = "cache_hit";
    pub const CACHE_MISS: &str = "cache_miss";
    pub const PLACE_INFO_GENERATED: &str = "place_info_generated";
    pub const PLACE_INFO_FAILED: &str = "place_info_failed";
    pub const SERVICE_START: &str = "service_start";
}

/// Local JSONL event buffer. Events queue in memory and are appended to disk once a
/// batch fills up; the file is rotated when it would exceed its size budget.
#[derive(Clone)]
pub struct TelemetryClient {
    enabled: bool,
    queue: Arc<Mutex<Vec<PipelineEvent>>>,
    buffer_path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct PipelineEvent {
    pub name: &'static str,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl TelemetryClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self {
            enabled: config.telemetry_enabled,
            queue: Arc::new(Mutex::new(Vec::new())),
            buffer_path: config.data_dir.join(BUFFER_FILE_NAME),
            batch_size: config.telemetry_batch_size.max(1),
            max_file_bytes: config.telemetry_buffer_max_bytes,
        })
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            queue: Arc::new(Mutex::new(Vec::new())),
            buffer_path: PathBuf::from(BUFFER_FILE_NAME),
            batch_size: 1,
            max_file_bytes: 0,
        }
    }

    /// Queues an event. Write failures are logged and the batch is kept for the next flush.
    pub fn record(&self, name: &'static str, payload: Value) {
        if !self.enabled {
            return;
        }

        let mut queue = self.queue.lock();
        queue.push(PipelineEvent {
            name,
            timestamp: Utc::now(),
            payload,
        });
        if queue.len() >= self.batch_size {
            if let Err(err) = self.persist_locked(&mut queue) {
                warn!(target: "telemetry", error = %err, pending = queue.len(), "failed to persist events");
            }
        }
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn buffer_path(&self) -> &Path {
        &self.buffer_path
    }

    fn persist_locked(&self, queue: &mut Vec<PipelineEvent>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }

        let mut encoded = Vec::new();
        for event in queue.iter() {
            serde_json::to_writer(&mut encoded, event)?;
            encoded.push(b'\n');
        }

        self.rotate_if_needed(encoded.len() as u64)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.buffer_path)?;
        file.write_all(&encoded)?;
        file.flush()?;
        queue.clear();
        Ok(())
    }

    fn rotate_if_needed(&self, incoming_bytes: u64) -> AppResult<()> {
        let current = fs::metadata(&self.buffer_path)
            .map(|m| m.len())
            .unwrap_or(0);
        if current == 0 || current + incoming_bytes <= self.max_file_bytes {
            return Ok(());
        }

        let rotated = self.buffer_path.with_file_name(format!(
            "pipeline-events-{}.jsonl",
            Utc::now().format("%Y%m%d%H%M%S%3f")
        ));
        fs::rename(&self.buffer_path, rotated)?;
        self.prune_rotations()
    }

    fn prune_rotations(&self) -> AppResult<()> {
        let parent = self.buffer_path.parent().unwrap_or_else(|| Path::new("."));
        let mut rotations: Vec<PathBuf> = fs::read_dir(parent)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy())
                    .is_some_and(|name| name.starts_with("pipeline-events-") && name.ends_with(".jsonl"))
            })
            .collect();

        // Timestamped names sort chronologically.
        rotations.sort();
        let excess = rotations.len().saturating_sub(MAX_ROTATED_FILES);
        for path in rotations.into_iter().take(excess) {
            let _ = fs::remove_file(path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn config_in(dir: &Path, batch_size: usize, max_bytes: u64) -> AppConfig {
        AppConfig {
            data_dir: dir.to_path_buf(),
            telemetry_batch_size: batch_size,
            telemetry_buffer_max_bytes: max_bytes,
            ..AppConfig::default()
        }
    }

    #[test]
    fn writes_batch_once_full() {
        let dir = tempdir().unwrap();
        let client = TelemetryClient::new(&config_in(dir.path(), 2, 4096)).unwrap();

        client.record(events::CACHE_MISS, json!({ "cache_key": "1.000000_2.000000" }));
        assert_eq!(client.queue_depth(), 1);
        assert!(!client.buffer_path().exists());

        client.record(events::PLACE_INFO_GENERATED, json!({ "place_name": "Somewhere" }));
        assert_eq!(client.queue_depth(), 0);

        let buffer = fs::read_to_string(client.buffer_path()).unwrap();
        let lines: Vec<&str> = buffer.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("cache_miss"));
        assert!(lines[1].contains("place_info_generated"));
    }

    #[test]
    fn disabled_client_records_nothing() {
        let dir = tempdir().unwrap();
        let mut config = config_in(dir.path(), 1, 4096);
        config.telemetry_enabled = false;
        let client = TelemetryClient::new(&config).unwrap();

        client.record(events::CACHE_HIT, json!({}));
        client.flush().unwrap();
        assert_eq!(client.queue_depth(), 0);
        assert!(!client.buffer_path().exists());
    }

    #[test]
    fn rotates_and_prunes_old_buffers() {
        let dir = tempdir().unwrap();
        let client = TelemetryClient::new(&config_in(dir.path(), 1, 64)).unwrap();
        for idx in 0..6 {
            client.record(
                events::PLACE_INFO_FAILED,
                json!({ "error": "0123456789abcdef0123456789abcdef", "idx": idx }),
            );
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let rotated = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("pipeline-events-"))
            .count();
        assert!(rotated >= 1);
        assert!(rotated <= MAX_ROTATED_FILES);
        assert!(client.buffer_path().exists());
    }

    #[test]
    fn failed_write_keeps_events_queued() {
        let dir = tempdir().unwrap();
        let client = TelemetryClient::new(&config_in(dir.path(), 1, 1 << 20)).unwrap();
        fs::create_dir(client.buffer_path()).unwrap();

        client.record(events::CACHE_MISS, json!({}));
        assert_eq!(client.queue_depth(), 1);
        assert!(client.flush().is_err());
    }
}
