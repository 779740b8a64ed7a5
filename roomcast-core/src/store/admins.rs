//! Disk-backed per-room admin table: `roomCode -> {fingerprint, savedAt}`.
//! Lets admin authority survive process restarts.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::models::{Fingerprint, RoomCode};
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminRecord {
    pub fingerprint: Fingerprint,
    pub saved_at: DateTime<Utc>,
}

/// Persistent `roomCode -> admin fingerprint` table.
pub struct RoomAdminTable {
    path: PathBuf,
    records: Mutex<HashMap<String, AdminRecord>>,
}

impl RoomAdminTable {
    pub fn open(path: PathBuf) -> Result<Self> {
        let records = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    #[must_use]
    pub fn get(&self, code: &RoomCode) -> Option<Fingerprint> {
        self.records
            .lock()
            .get(code.as_str())
            .map(|r| r.fingerprint.clone())
    }

    pub fn set(&self, code: &RoomCode, fingerprint: Fingerprint) -> Result<()> {
        self.records.lock().insert(
            code.as_str().to_string(),
            AdminRecord {
                fingerprint,
                saved_at: Utc::now(),
            },
        );
        self.save()
    }

    pub fn remove(&self, code: &RoomCode) -> Result<()> {
        self.records.lock().remove(code.as_str());
        self.save()
    }

    fn save(&self) -> Result<()> {
        let records = self.records.lock();
        let json = serde_json::to_string_pretty(&*records)?;
        drop(records);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("room_admins.json");
        let code = RoomCode::normalize("ABC234");

        let table = RoomAdminTable::open(path.clone()).expect("open");
        table.set(&code, Fingerprint::from("F1")).expect("set");

        let reopened = RoomAdminTable::open(path).expect("reopen");
        assert_eq!(reopened.get(&code), Some(Fingerprint::from("F1")));
    }

    #[test]
    fn remove_clears_record() {
        let dir = TempDir::new().expect("tempdir");
        let table =
            RoomAdminTable::open(dir.path().join("room_admins.json")).expect("open");
        let code = RoomCode::normalize("QRS567");
        table.set(&code, Fingerprint::from("F2")).expect("set");
        table.remove(&code).expect("remove");
        assert_eq!(table.get(&code), None);
    }
}
