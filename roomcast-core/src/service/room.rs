//! Room registry: lifecycle, lookup, admin authority.
//!
//! Rooms live behind `Arc<RwLock<_>>`; the write lock is the room's
//! single-writer discipline. The registry map itself is a `DashMap` so
//! rooms progress independently.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock;
use crate::models::{ConnectionId, Fingerprint, Room, RoomCode, RoomSummary};
use crate::store::RoomAdminTable;
use crate::{Error, Result};

pub type SharedRoom = Arc<RwLock<Room>>;

/// How many collisions we tolerate before giving up on code generation.
const MAX_CODE_ATTEMPTS: usize = 32;

pub struct RoomRegistry {
    rooms: DashMap<RoomCode, SharedRoom>,
    admin_table: Arc<RoomAdminTable>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new(admin_table: Arc<RoomAdminTable>) -> Self {
        Self {
            rooms: DashMap::new(),
            admin_table,
        }
    }

    /// Create a room with a fresh unique code and record its admin.
    pub fn create_room(
        &self,
        name: String,
        private: bool,
        admin_fingerprint: Fingerprint,
    ) -> Result<(RoomCode, SharedRoom)> {
        let now = Utc::now();
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = RoomCode::generate();
            let entry = self.rooms.entry(code.clone());
            if let dashmap::Entry::Vacant(vacant) = entry {
                let mut room = Room::new(code.clone(), name.clone(), private, now);
                room.admin_fingerprint = Some(admin_fingerprint.clone());
                let shared = Arc::new(RwLock::new(room));
                vacant.insert(shared.clone());

                if let Err(e) = self.admin_table.set(&code, admin_fingerprint) {
                    warn!(room = %code, error = %e, "Failed to persist room admin record");
                }
                info!(room = %code, name = %name, private, "Room created");
                return Ok((code, shared));
            }
        }
        Err(Error::Internal(
            "Could not generate a unique room code".to_string(),
        ))
    }

    /// Create-or-get a room under a fixed code. Used for the implicit
    /// shared room when rooms are disabled; no admin is bound up front.
    pub fn ensure_room(&self, code: RoomCode, name: &str) -> SharedRoom {
        self.rooms
            .entry(code.clone())
            .or_insert_with(|| {
                info!(room = %code, "Ensured fixed room");
                Arc::new(RwLock::new(Room::new(
                    code.clone(),
                    name.to_string(),
                    false,
                    Utc::now(),
                )))
            })
            .value()
            .clone()
    }

    /// Case-insensitive lookup.
    #[must_use]
    pub fn find(&self, raw_code: &str) -> Option<(RoomCode, SharedRoom)> {
        let code = RoomCode::normalize(raw_code);
        self.rooms.get(&code).map(|r| (code, r.value().clone()))
    }

    /// Whether a fingerprint holds admin authority for a room. Falls back
    /// to the persisted table and repopulates the in-memory field on a disk
    /// hit, so authority survives restarts.
    #[must_use]
    pub fn is_admin_fingerprint(&self, code: &RoomCode, fingerprint: &Fingerprint) -> bool {
        let Some(room) = self.rooms.get(code) else {
            return false;
        };

        {
            let guard = room.read();
            if let Some(stored) = &guard.admin_fingerprint {
                return stored == fingerprint;
            }
        }

        if self.admin_table.get(code).as_ref() == Some(fingerprint) {
            room.write().admin_fingerprint = Some(fingerprint.clone());
            info!(room = %code, "Admin authority restored from disk");
            return true;
        }
        false
    }

    /// Delete a room. Requires the requester to hold admin authority.
    /// Returns the member connections so the caller can notify and evict
    /// them after releasing registry state.
    pub fn delete_room(
        &self,
        raw_code: &str,
        requester: &Fingerprint,
    ) -> Result<Vec<ConnectionId>> {
        let Some((code, room)) = self.find(raw_code) else {
            return Err(Error::NotFound("Room not found".to_string()));
        };
        if !self.is_admin_fingerprint(&code, requester) {
            return Err(Error::Auth("Only the room admin can delete it".to_string()));
        }

        let members: Vec<ConnectionId> = room.read().viewers.keys().cloned().collect();
        self.rooms.remove(&code);
        if let Err(e) = self.admin_table.remove(&code) {
            warn!(room = %code, error = %e, "Failed to drop room admin record");
        }
        info!(room = %code, members = members.len(), "Room deleted");
        Ok(members)
    }

    /// Snapshot of non-private rooms for the landing page.
    #[must_use]
    pub fn list_public(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<RoomSummary> = self
            .rooms
            .iter()
            .filter_map(|entry| {
                let guard = entry.value().read();
                if guard.private {
                    None
                } else {
                    Some(RoomSummary::from(&*guard))
                }
            })
            .collect();
        rooms.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rooms
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn total_viewers(&self) -> usize {
        self.rooms
            .iter()
            .map(|entry| entry.value().read().viewer_count())
            .sum()
    }

    /// Background-ticker pass: fold elapsed time into every playing room so
    /// stored positions never drift unboundedly from real time. Emits
    /// nothing.
    pub fn consolidate_all(&self, now: DateTime<Utc>) {
        for entry in &self.rooms {
            let mut room = entry.value().write();
            if room.playback.is_playing {
                clock::consolidate(&mut room.playback, now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> RoomRegistry {
        let table = RoomAdminTable::open(dir.path().join("room_admins.json")).expect("table");
        RoomRegistry::new(Arc::new(table))
    }

    #[test]
    fn create_and_find_is_case_insensitive() {
        let dir = TempDir::new().expect("tempdir");
        let reg = registry(&dir);
        let (code, _) = reg
            .create_room("Movie night".into(), false, Fingerprint::from("F1"))
            .expect("create");
        assert!(reg.find(&code.as_str().to_lowercase()).is_some());
        assert!(reg.find("ZZZZZZ").is_none());
    }

    #[test]
    fn admin_authority_survives_memory_loss() {
        let dir = TempDir::new().expect("tempdir");
        let reg = registry(&dir);
        let fp = Fingerprint::from("F1");
        let (code, room) = reg
            .create_room("room".into(), false, fp.clone())
            .expect("create");

        // Simulate restart amnesia of the in-memory field.
        room.write().admin_fingerprint = None;

        assert!(reg.is_admin_fingerprint(&code, &fp));
        // Repopulated from disk.
        assert_eq!(room.read().admin_fingerprint, Some(fp));
        assert!(!reg.is_admin_fingerprint(&code, &Fingerprint::from("F2")));
    }

    #[test]
    fn delete_requires_admin() {
        let dir = TempDir::new().expect("tempdir");
        let reg = registry(&dir);
        let (code, _) = reg
            .create_room("room".into(), false, Fingerprint::from("F1"))
            .expect("create");

        let err = reg
            .delete_room(code.as_str(), &Fingerprint::from("F2"))
            .expect_err("non-admin");
        assert!(matches!(err, Error::Auth(_)));

        reg.delete_room(code.as_str(), &Fingerprint::from("F1"))
            .expect("admin delete");
        assert!(reg.find(code.as_str()).is_none());

        let err = reg
            .delete_room(code.as_str(), &Fingerprint::from("F1"))
            .expect_err("already gone");
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn public_listing_excludes_private_rooms() {
        let dir = TempDir::new().expect("tempdir");
        let reg = registry(&dir);
        reg.create_room("public".into(), false, Fingerprint::from("F1"))
            .expect("create");
        reg.create_room("secret".into(), true, Fingerprint::from("F2"))
            .expect("create");

        let listed = reg.list_public();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "public");
    }

    #[test]
    fn ticker_consolidates_only_playing_rooms() {
        let dir = TempDir::new().expect("tempdir");
        let reg = registry(&dir);
        let (_, playing) = reg
            .create_room("playing".into(), false, Fingerprint::from("F1"))
            .expect("create");
        let (_, paused) = reg
            .create_room("paused".into(), false, Fingerprint::from("F2"))
            .expect("create");

        let t0 = Utc::now();
        {
            let mut room = playing.write();
            room.playback.is_playing = true;
            room.playback.position = 10.0;
            room.playback.anchor = t0;
        }
        {
            let mut room = paused.write();
            room.playback.position = 10.0;
            room.playback.anchor = t0;
        }

        let later = t0 + chrono::Duration::seconds(5);
        reg.consolidate_all(later);

        assert!((playing.read().playback.position - 15.0).abs() < 0.05);
        assert!((paused.read().playback.position - 10.0).abs() < 1e-9);
    }
}
