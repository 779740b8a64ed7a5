use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::id::{ConnectionId, Fingerprint};

/// Drift offsets are clamped to this band (seconds).
pub const DRIFT_MIN: i32 = -60;
pub const DRIFT_MAX: i32 = 60;

/// One file a viewer reported from their local folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFile {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    /// MIME type as the browser reported it, when available.
    #[serde(default, rename = "type")]
    pub mime: Option<String>,
}

/// Per-connection local-file inventory and its resolved matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BslClientState {
    pub fingerprint: Option<Fingerprint>,
    pub display_name: Option<String>,
    pub folder_selected: bool,
    pub files: Vec<ClientFile>,
    /// playlist index -> client file name. Stale entries for removed
    /// playlist items are tolerated and ignored by readers.
    pub matches: HashMap<i32, String>,
}

/// Per-room index of every connection's BSL state.
#[derive(Debug, Clone, Default)]
pub struct BslIndex {
    pub clients: HashMap<ConnectionId, BslClientState>,
}

impl BslIndex {
    /// Connections that have not yet picked a folder; `bsl-check-request`
    /// only re-prompts these.
    #[must_use]
    pub fn unselected_connections(&self) -> Vec<ConnectionId> {
        self.clients
            .iter()
            .filter(|(_, state)| !state.folder_selected)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// fingerprint -> playlist index -> signed drift seconds.
#[derive(Debug, Clone, Default)]
pub struct DriftTable {
    entries: HashMap<Fingerprint, HashMap<i32, i32>>,
}

impl DriftTable {
    /// Store a drift value, clamped to [-60, 60]. Returns the stored value.
    pub fn set(&mut self, fingerprint: Fingerprint, playlist_index: i32, drift_seconds: i32) -> i32 {
        let clamped = drift_seconds.clamp(DRIFT_MIN, DRIFT_MAX);
        self.entries
            .entry(fingerprint)
            .or_default()
            .insert(playlist_index, clamped);
        clamped
    }

    #[must_use]
    pub fn get(&self, fingerprint: &Fingerprint, playlist_index: i32) -> i32 {
        self.entries
            .get(fingerprint)
            .and_then(|per_item| per_item.get(&playlist_index))
            .copied()
            .unwrap_or(0)
    }

    /// All drift values for one fingerprint, for `bsl-drift-update`.
    #[must_use]
    pub fn values_for(&self, fingerprint: &Fingerprint) -> HashMap<i32, i32> {
        self.entries.get(fingerprint).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drift_clamps_to_band() {
        let mut table = DriftTable::default();
        let fp = Fingerprint::from("fp1");
        assert_eq!(table.set(fp.clone(), 0, 75), 60);
        assert_eq!(table.set(fp.clone(), 1, -100), -60);
        assert_eq!(table.set(fp.clone(), 2, -3), -3);
        assert_eq!(table.get(&fp, 0), 60);
        assert_eq!(table.get(&fp, 1), -60);
        assert_eq!(table.get(&fp, 2), -3);
    }

    #[test]
    fn missing_drift_is_zero() {
        let table = DriftTable::default();
        assert_eq!(table.get(&Fingerprint::from("nobody"), 5), 0);
    }

    #[test]
    fn drift_is_isolated_per_fingerprint() {
        let mut table = DriftTable::default();
        let v1 = Fingerprint::from("v1");
        let v2 = Fingerprint::from("v2");
        table.set(v1.clone(), 0, -3);
        assert_eq!(table.values_for(&v1).get(&0), Some(&-3));
        assert!(table.values_for(&v2).is_empty());
    }

    #[test]
    fn unselected_connections_filters_selected() {
        let mut index = BslIndex::default();
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        index.clients.insert(
            a.clone(),
            BslClientState {
                folder_selected: true,
                ..BslClientState::default()
            },
        );
        index.clients.insert(b.clone(), BslClientState::default());
        let unselected = index.unselected_connections();
        assert_eq!(unselected, vec![b]);
    }
}
