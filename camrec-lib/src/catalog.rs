use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use serde::Serialize;

/// One catalog row per output file.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingMeta {
    pub stream_name: String,
    pub file_path: PathBuf,
    pub start_time: SystemTime,
    /// `None` until the recording is finalized.
    pub end_time: Option<SystemTime>,
    pub size_bytes: u64,
    pub is_complete: bool,
}

/// Per-stream tuning the supervisor re-reads before every segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamConfig {
    /// Target segment length in seconds. 0 disables rotation.
    pub segment_duration: u32,
    pub record_audio: bool,
}

/// Recordings catalog consumed by the engine. Called from recording workers,
/// so implementations must be thread-safe.
pub trait RecordingCatalog: Send + Sync {
    /// Insert a new record and return its identifier. 0 means the insert
    /// failed.
    fn add(&self, meta: &RecordingMeta) -> u64;

    /// Update an existing record. `end_time = None` leaves the stored end
    /// time untouched. Returns false when the id is unknown.
    fn update(
        &self,
        id: u64,
        end_time: Option<SystemTime>,
        size_bytes: u64,
        is_complete: bool,
    ) -> bool;

    /// Current configuration for a stream, if the catalog knows it.
    fn stream_config(&self, stream_name: &str) -> Option<StreamConfig>;
}

/// In-process catalog, insertion-ordered. Backs the CLI manifest dump and the
/// test suites.
pub struct MemoryCatalog {
    next_id: AtomicU64,
    records: Mutex<Vec<(u64, RecordingMeta)>>,
    configs: Mutex<HashMap<String, StreamConfig>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        MemoryCatalog {
            next_id: AtomicU64::new(1),
            records: Mutex::new(Vec::new()),
            configs: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_stream_config(&self, stream_name: &str, config: StreamConfig) {
        self.configs
            .lock()
            .unwrap()
            .insert(stream_name.to_string(), config);
    }

    /// All records in insertion order.
    pub fn snapshot(&self) -> Vec<(u64, RecordingMeta)> {
        self.records.lock().unwrap().clone()
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingCatalog for MemoryCatalog {
    fn add(&self, meta: &RecordingMeta) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.records.lock().unwrap().push((id, meta.clone()));
        id
    }

    fn update(
        &self,
        id: u64,
        end_time: Option<SystemTime>,
        size_bytes: u64,
        is_complete: bool,
    ) -> bool {
        let mut records = self.records.lock().unwrap();
        match records.iter_mut().find(|(rid, _)| *rid == id) {
            Some((_, meta)) => {
                if end_time.is_some() {
                    meta.end_time = end_time;
                }
                meta.size_bytes = size_bytes;
                meta.is_complete = is_complete;
                true
            }
            None => false,
        }
    }

    fn stream_config(&self, stream_name: &str) -> Option<StreamConfig> {
        self.configs.lock().unwrap().get(stream_name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn meta(path: &str) -> RecordingMeta {
        RecordingMeta {
            stream_name: "cam1".to_string(),
            file_path: PathBuf::from(path),
            start_time: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            end_time: None,
            size_bytes: 0,
            is_complete: false,
        }
    }

    #[test]
    fn ids_start_at_one() {
        let catalog = MemoryCatalog::new();
        assert_eq!(catalog.add(&meta("/tmp/a.mp4")), 1);
        assert_eq!(catalog.add(&meta("/tmp/b.mp4")), 2);
    }

    #[test]
    fn update_preserves_end_time_when_none() {
        let catalog = MemoryCatalog::new();
        let id = catalog.add(&meta("/tmp/a.mp4"));
        let end = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_030);

        assert!(catalog.update(id, Some(end), 512, true));
        // Interim size update must not clear the recorded end time.
        assert!(catalog.update(id, None, 1024, false));

        let records = catalog.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1.end_time, Some(end));
        assert_eq!(records[0].1.size_bytes, 1024);
        assert!(!records[0].1.is_complete);
    }

    #[test]
    fn update_unknown_id_fails() {
        let catalog = MemoryCatalog::new();
        assert!(!catalog.update(42, None, 0, false));
    }

    #[test]
    fn stream_config_roundtrip() {
        let catalog = MemoryCatalog::new();
        assert_eq!(catalog.stream_config("cam1"), None);
        let config = StreamConfig {
            segment_duration: 60,
            record_audio: true,
        };
        catalog.set_stream_config("cam1", config);
        assert_eq!(catalog.stream_config("cam1"), Some(config));
    }
}
