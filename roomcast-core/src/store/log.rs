//! Append-only JSON event logs with a capped tail: one per room plus one
//! process-wide log. Writes are serialized per file; readers just parse the
//! current document.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::models::RoomCode;
use crate::Result;

/// Most recent entries kept per room log.
pub const ROOM_LOG_CAP: usize = 500;
/// Most recent entries kept in the process-wide log.
pub const GENERAL_LOG_CAP: usize = 1000;

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct LogDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    room_code: Option<String>,
    logs: Vec<Value>,
}

/// File-backed event log writer.
pub struct EventLog {
    dir: PathBuf,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl EventLog {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            locks: DashMap::new(),
        }
    }

    fn room_log_path(&self, code: &RoomCode) -> PathBuf {
        self.dir.join(format!("room-{}.json", code.as_str()))
    }

    fn general_log_path(&self) -> PathBuf {
        self.dir.join("server.json")
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append an entry to a room's log, trimming to the tail cap.
    pub async fn append_room(&self, code: &RoomCode, event: &str, mut fields: Value) {
        let path = self.room_log_path(code);
        if let Err(e) = self
            .append(&path, Some(code.as_str().to_string()), event, &mut fields, ROOM_LOG_CAP)
            .await
        {
            warn!(room = %code, error = %e, "Failed to append room log entry");
        }
    }

    /// Append an entry to the process-wide log.
    pub async fn append_general(&self, event: &str, mut fields: Value) {
        let path = self.general_log_path();
        if let Err(e) = self
            .append(&path, None, event, &mut fields, GENERAL_LOG_CAP)
            .await
        {
            warn!(error = %e, "Failed to append general log entry");
        }
    }

    async fn append(
        &self,
        path: &Path,
        room_code: Option<String>,
        event: &str,
        fields: &mut Value,
        cap: usize,
    ) -> Result<()> {
        let lock = self.lock_for(path);
        let _guard = lock.lock().await;

        let mut doc = match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str::<LogDoc>(&raw).unwrap_or_default(),
            Err(_) => LogDoc::default(),
        };
        doc.room_code = room_code;

        let mut entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
        });
        if let (Some(target), Some(extra)) = (entry.as_object_mut(), fields.as_object_mut()) {
            target.append(extra);
        }
        doc.logs.push(entry);

        if doc.logs.len() > cap {
            let overflow = doc.logs.len() - cap;
            doc.logs.drain(..overflow);
        }

        tokio::fs::create_dir_all(self.dir.as_path()).await?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(&doc)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Drop a room's log file when the room is deleted.
    pub async fn delete_room_log(&self, code: &RoomCode) {
        let path = self.room_log_path(code);
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(room = %code, error = %e, "Failed to delete room log");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn appends_and_caps_room_log() {
        let dir = TempDir::new().expect("tempdir");
        let log = EventLog::new(dir.path().to_path_buf());
        let code = RoomCode::normalize("ABC234");

        for i in 0..(ROOM_LOG_CAP + 20) {
            log.append_room(&code, "sync", serde_json::json!({"seq": i}))
                .await;
        }

        let raw = tokio::fs::read_to_string(dir.path().join("room-ABC234.json"))
            .await
            .expect("read");
        let doc: serde_json::Value = serde_json::from_str(&raw).expect("json");
        let logs = doc["logs"].as_array().expect("logs array");
        assert_eq!(logs.len(), ROOM_LOG_CAP);
        // Oldest entries were trimmed.
        assert_eq!(logs[0]["seq"], 20);
        assert_eq!(doc["roomCode"], "ABC234");
    }

    #[tokio::test]
    async fn entries_carry_timestamp_and_event() {
        let dir = TempDir::new().expect("tempdir");
        let log = EventLog::new(dir.path().to_path_buf());
        log.append_general("boot", serde_json::json!({"port": 3000}))
            .await;

        let raw = tokio::fs::read_to_string(dir.path().join("server.json"))
            .await
            .expect("read");
        let doc: serde_json::Value = serde_json::from_str(&raw).expect("json");
        let entry = &doc["logs"][0];
        assert_eq!(entry["event"], "boot");
        assert_eq!(entry["port"], 3000);
        assert!(entry["timestamp"].is_string());
    }

    #[tokio::test]
    async fn deleting_room_log_removes_file() {
        let dir = TempDir::new().expect("tempdir");
        let log = EventLog::new(dir.path().to_path_buf());
        let code = RoomCode::normalize("XYZ789");
        log.append_room(&code, "created", serde_json::json!({})).await;
        assert!(dir.path().join("room-XYZ789.json").exists());
        log.delete_room_log(&code).await;
        assert!(!dir.path().join("room-XYZ789.json").exists());
    }
}
