use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::bsl::{BslIndex, DriftTable};
use super::id::{ConnectionId, Fingerprint, RoomCode};
use super::playback::PlaybackState;
use super::playlist::Playlist;

/// A viewer currently joined to a room. The room owns the entry; the
/// connection only references it by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerInfo {
    pub fingerprint: Option<Fingerprint>,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
}

/// A named, coded session holding one playback state and many viewers.
///
/// Rooms hold connection ids, never connection handles, so there are no
/// strong back-edges between rooms and the session layer.
#[derive(Debug, Clone)]
pub struct Room {
    pub code: RoomCode,
    pub name: String,
    pub private: bool,
    pub created_at: DateTime<Utc>,
    /// Immutable after first creation.
    pub admin_fingerprint: Option<Fingerprint>,
    /// At most one admin connection at a time.
    pub admin_connection: Option<ConnectionId>,
    pub viewers: HashMap<ConnectionId, ViewerInfo>,
    pub playback: PlaybackState,
    pub playlist: Playlist,
    pub bsl: BslIndex,
    pub drift: DriftTable,
}

impl Room {
    #[must_use]
    pub fn new(code: RoomCode, name: String, private: bool, now: DateTime<Utc>) -> Self {
        Self {
            code,
            name,
            private,
            created_at: now,
            admin_fingerprint: None,
            admin_connection: None,
            viewers: HashMap::new(),
            playback: PlaybackState::new(now),
            playlist: Playlist::default(),
            bsl: BslIndex::default(),
            drift: DriftTable::default(),
        }
    }

    #[must_use]
    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    #[must_use]
    pub fn is_admin_connection(&self, conn: &ConnectionId) -> bool {
        self.admin_connection.as_ref() == Some(conn)
    }

    /// Viewer connections that belong to a given fingerprint. Used for
    /// fingerprint-targeted pushes such as `bsl-drift-update`.
    #[must_use]
    pub fn connections_for_fingerprint(&self, fingerprint: &Fingerprint) -> Vec<ConnectionId> {
        self.viewers
            .iter()
            .filter(|(_, v)| v.fingerprint.as_ref() == Some(fingerprint))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Public-listing snapshot of a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub code: RoomCode,
    pub name: String,
    pub viewers: usize,
    pub created_at: DateTime<Utc>,
}

impl From<&Room> for RoomSummary {
    fn from(room: &Room) -> Self {
        Self {
            code: room.code.clone(),
            name: room.name.clone(),
            viewers: room.viewer_count(),
            created_at: room.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_targeting_finds_all_connections() {
        let mut room = Room::new(RoomCode::generate(), "test".into(), false, Utc::now());
        let fp = Fingerprint::from("device-a");
        let c1 = ConnectionId::new();
        let c2 = ConnectionId::new();
        let c3 = ConnectionId::new();
        for (conn, fingerprint) in [
            (&c1, Some(fp.clone())),
            (&c2, Some(Fingerprint::from("device-b"))),
            (&c3, Some(fp.clone())),
        ] {
            room.viewers.insert(
                conn.clone(),
                ViewerInfo {
                    fingerprint,
                    display_name: "viewer".into(),
                    joined_at: Utc::now(),
                },
            );
        }
        let mut found = room.connections_for_fingerprint(&fp);
        found.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        let mut expected = vec![c1, c3];
        expected.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(found, expected);
    }

    #[test]
    fn at_most_one_admin_connection() {
        let mut room = Room::new(RoomCode::generate(), "test".into(), false, Utc::now());
        let first = ConnectionId::new();
        let second = ConnectionId::new();
        room.admin_connection = Some(first.clone());
        assert!(room.is_admin_connection(&first));
        room.admin_connection = Some(second.clone());
        assert!(!room.is_admin_connection(&first));
        assert!(room.is_admin_connection(&second));
    }
}
