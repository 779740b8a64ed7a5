//! Both-side local sync: match a viewer's local files against the playlist
//! so they can play their own copy while following the room clock.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::BslMode;
use crate::models::{BslClientState, ClientFile, ConnectionId, Fingerprint, Room};
use crate::store::MemoryStore;
use crate::{Error, Result};

/// Client and server sizes may differ by this much and still score the size
/// criterion (1.5 MiB).
pub const SIZE_TOLERANCE_BYTES: u64 = 1_572_864;

/// Extension-derived MIME types used by the advanced-match MIME criterion.
const MIME_TABLE: [(&str, &str); 10] = [
    ("mp4", "video/mp4"),
    ("mkv", "video/x-matroska"),
    ("webm", "video/webm"),
    ("avi", "video/x-msvideo"),
    ("mov", "video/quicktime"),
    ("mp3", "audio/mpeg"),
    ("flac", "audio/flac"),
    ("ogg", "audio/ogg"),
    ("wav", "audio/wav"),
    ("m4a", "audio/mp4"),
];

/// A playlist item's server-side identity for matching purposes.
#[derive(Debug, Clone)]
pub struct ServerFileInfo {
    pub playlist_index: i32,
    pub filename: String,
    /// From a stat of the server's copy; `None` when stat failed.
    pub size: Option<u64>,
}

/// Result of one viewer's folder report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub matched_videos: HashMap<i32, String>,
    pub total_matched: usize,
    pub total_playlist: usize,
}

/// One row of the admin's consolidated status view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BslClientReport {
    pub connection_id: ConnectionId,
    pub fingerprint: Option<Fingerprint>,
    pub display_name: Option<String>,
    pub folder_selected: bool,
    pub files: Vec<ClientFile>,
    pub matches: HashMap<i32, String>,
    pub drift_values: HashMap<i32, i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BslStatus {
    pub clients: Vec<BslClientReport>,
    /// playlist index -> whether BSL is considered active under the
    /// configured aggregation mode.
    pub items_active: HashMap<i32, bool>,
    pub mode: BslMode,
}

pub struct BslService {
    advanced: bool,
    threshold: u8,
    mode: BslMode,
    memory: Arc<MemoryStore>,
}

impl BslService {
    #[must_use]
    pub fn new(advanced: bool, threshold: u8, mode: BslMode, memory: Arc<MemoryStore>) -> Self {
        Self {
            advanced,
            threshold: threshold.clamp(1, 4),
            mode,
            memory,
        }
    }

    /// Resolve matches for a reported folder. Pure with respect to room
    /// state; the caller stores the result under the room lock.
    #[must_use]
    pub fn resolve_matches(
        &self,
        fingerprint: &Fingerprint,
        files: &[ClientFile],
        playlist: &[ServerFileInfo],
    ) -> HashMap<i32, String> {
        let mut matches: HashMap<i32, String> = HashMap::new();

        for file in files {
            for item in playlist {
                if matches.contains_key(&item.playlist_index) {
                    continue;
                }
                if self.is_match(fingerprint, file, item) {
                    debug!(
                        client_file = %file.name,
                        server_file = %item.filename,
                        index = item.playlist_index,
                        "BSL match"
                    );
                    matches.insert(item.playlist_index, file.name.clone());
                    break;
                }
            }
        }
        matches
    }

    fn is_match(&self, fingerprint: &Fingerprint, file: &ClientFile, item: &ServerFileInfo) -> bool {
        // Persisted matches win outright.
        if let Some(remembered) = self.memory.bsl_match(fingerprint, &file.name) {
            if remembered == item.filename.to_lowercase() {
                return true;
            }
        }

        if self.advanced {
            self.advanced_score(file, item) >= self.threshold
        } else {
            file.name.eq_ignore_ascii_case(&item.filename)
        }
    }

    /// Four-criteria score: name, extension, size, MIME.
    fn advanced_score(&self, file: &ClientFile, item: &ServerFileInfo) -> u8 {
        let mut score = 0u8;

        if file.name.eq_ignore_ascii_case(&item.filename) {
            score += 1;
        }
        if extension(&file.name) == extension(&item.filename) && !extension(&file.name).is_empty()
        {
            score += 1;
        }
        if let Some(server_size) = item.size {
            if file.size.abs_diff(server_size) <= SIZE_TOLERANCE_BYTES {
                score += 1;
            }
        }
        if let (Some(client_mime), Some(expected)) =
            (file.mime.as_deref(), mime_for_extension(&extension(&item.filename)))
        {
            if client_mime.eq_ignore_ascii_case(expected)
                || top_level(client_mime) == top_level(expected)
            {
                score += 1;
            }
        }
        score
    }

    /// Store a folder report on the room and return the per-viewer result.
    pub fn record_folder_report(
        &self,
        room: &mut Room,
        connection: ConnectionId,
        fingerprint: Fingerprint,
        display_name: Option<String>,
        files: Vec<ClientFile>,
        playlist: &[ServerFileInfo],
    ) -> MatchResult {
        let matches = self.resolve_matches(&fingerprint, &files, playlist);
        let result = MatchResult {
            matched_videos: matches.clone(),
            total_matched: matches.len(),
            total_playlist: room.playlist.len(),
        };

        room.bsl.clients.insert(
            connection,
            BslClientState {
                fingerprint: Some(fingerprint),
                display_name,
                folder_selected: true,
                files,
                matches,
            },
        );
        result
    }

    /// Admin override: force a mapping and persist it for future sessions.
    pub fn manual_match(
        &self,
        room: &mut Room,
        connection: &ConnectionId,
        client_file: &str,
        playlist_index: i32,
    ) -> Result<()> {
        if !room.playlist.in_range(playlist_index) {
            return Err(Error::Validation(format!(
                "Playlist index out of range: {playlist_index}"
            )));
        }
        let playlist_file = room.playlist.items[playlist_index as usize]
            .filename()
            .ok_or_else(|| {
                Error::Validation("Manual BSL match targets must be local items".to_string())
            })?
            .to_string();

        let state = room.bsl.clients.get_mut(connection).ok_or_else(|| {
            Error::NotFound(format!("No BSL state for connection {connection}"))
        })?;
        state
            .matches
            .insert(playlist_index, client_file.to_string());

        if let Some(fp) = state.fingerprint.clone() {
            self.memory
                .set_bsl_match(&fp, client_file, &playlist_file)?;
        }
        info!(
            connection = %connection,
            client_file,
            playlist_index,
            "Manual BSL match recorded"
        );
        Ok(())
    }

    /// Consolidated status for the admin view.
    #[must_use]
    pub fn status(&self, room: &Room) -> BslStatus {
        let clients: Vec<BslClientReport> = room
            .bsl
            .clients
            .iter()
            .map(|(conn, state)| BslClientReport {
                connection_id: conn.clone(),
                fingerprint: state.fingerprint.clone(),
                display_name: state.display_name.clone(),
                folder_selected: state.folder_selected,
                files: state.files.clone(),
                matches: state.matches.clone(),
                drift_values: state
                    .fingerprint
                    .as_ref()
                    .map(|fp| room.drift.values_for(fp))
                    .unwrap_or_default(),
            })
            .collect();

        let reporting: Vec<&BslClientReport> =
            clients.iter().filter(|c| c.folder_selected).collect();

        let mut items_active = HashMap::new();
        for index in 0..room.playlist.len() as i32 {
            let active = match self.mode {
                BslMode::Any => reporting.iter().any(|c| c.matches.contains_key(&index)),
                BslMode::All => {
                    !reporting.is_empty()
                        && reporting.iter().all(|c| c.matches.contains_key(&index))
                }
            };
            items_active.insert(index, active);
        }

        BslStatus {
            clients,
            items_active,
            mode: self.mode,
        }
    }
}

fn extension(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => String::new(),
    }
}

fn mime_for_extension(ext: &str) -> Option<&'static str> {
    MIME_TABLE
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mime)| *mime)
}

fn top_level(mime: &str) -> &str {
    mime.split('/').next().unwrap_or(mime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BslMode;
    use crate::models::{PlaylistItem, RoomCode};
    use chrono::Utc;
    use sha2::Digest;
    use tempfile::TempDir;

    fn memory(dir: &TempDir) -> Arc<MemoryStore> {
        let key: [u8; 32] = sha2::Sha256::digest(b"bsl-test").into();
        Arc::new(MemoryStore::open(dir.path().join("memory.json"), &key).expect("open"))
    }

    fn client_file(name: &str, size: u64, mime: Option<&str>) -> ClientFile {
        ClientFile {
            name: name.to_string(),
            size,
            mime: mime.map(String::from),
        }
    }

    fn server_file(index: i32, name: &str, size: Option<u64>) -> ServerFileInfo {
        ServerFileInfo {
            playlist_index: index,
            filename: name.to_string(),
            size,
        }
    }

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn advanced_match_scores_name_ext_size_mime() {
        // 900.0 MiB on the server, 900.4 MiB on the client: name, extension,
        // size and MIME all score, clearing threshold 3.
        let dir = TempDir::new().expect("tempdir");
        let svc = BslService::new(true, 3, BslMode::Any, memory(&dir));
        let fp = Fingerprint::from("V1");

        let matches = svc.resolve_matches(
            &fp,
            &[client_file(
                "movie.mkv",
                900 * MIB + 400 * 1024,
                Some("video/x-matroska"),
            )],
            &[server_file(0, "Movie.mkv", Some(900 * MIB))],
        );
        assert_eq!(matches.get(&0).map(String::as_str), Some("movie.mkv"));
    }

    #[test]
    fn size_outside_tolerance_fails_high_threshold() {
        let dir = TempDir::new().expect("tempdir");
        let svc = BslService::new(true, 3, BslMode::Any, memory(&dir));
        let fp = Fingerprint::from("V1");

        // Name + extension only: score 2 < 3.
        let matches = svc.resolve_matches(
            &fp,
            &[client_file("movie.mkv", 700 * MIB, None)],
            &[server_file(0, "movie.mkv", Some(900 * MIB))],
        );
        assert!(matches.is_empty());
    }

    #[test]
    fn mime_shares_top_level_type() {
        let dir = TempDir::new().expect("tempdir");
        let svc = BslService::new(true, 2, BslMode::Any, memory(&dir));
        let fp = Fingerprint::from("V1");

        // Different container, same top-level "video": ext fails, MIME
        // criterion passes together with size.
        let matches = svc.resolve_matches(
            &fp,
            &[client_file("movie.mp4", 900 * MIB, Some("video/mp4"))],
            &[server_file(0, "movie.mkv", Some(900 * MIB))],
        );
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn simple_mode_is_name_equality_only() {
        let dir = TempDir::new().expect("tempdir");
        let svc = BslService::new(false, 1, BslMode::Any, memory(&dir));
        let fp = Fingerprint::from("V1");

        let matches = svc.resolve_matches(
            &fp,
            &[
                client_file("MOVIE.MKV", 0, None),
                client_file("other.mkv", 0, None),
            ],
            &[server_file(0, "movie.mkv", None)],
        );
        assert_eq!(matches.get(&0).map(String::as_str), Some("MOVIE.MKV"));
    }

    #[test]
    fn persisted_match_short_circuits() {
        let dir = TempDir::new().expect("tempdir");
        let mem = memory(&dir);
        let fp = Fingerprint::from("V1");
        mem.set_bsl_match(&fp, "renamed copy.mkv", "movie.mkv")
            .expect("persist");

        // Advanced scoring alone would never match these names; the
        // remembered mapping wins.
        let svc = BslService::new(true, 4, BslMode::Any, mem);
        let matches = svc.resolve_matches(
            &fp,
            &[client_file("Renamed Copy.mkv", 0, None)],
            &[server_file(0, "Movie.mkv", None)],
        );
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn first_item_reaching_threshold_wins() {
        let dir = TempDir::new().expect("tempdir");
        let svc = BslService::new(true, 1, BslMode::Any, memory(&dir));
        let fp = Fingerprint::from("V1");

        // Both items share the extension, so both score >= 1; the first
        // playlist item takes the match.
        let matches = svc.resolve_matches(
            &fp,
            &[client_file("anything.mkv", 0, None)],
            &[
                server_file(0, "first.mkv", None),
                server_file(1, "second.mkv", None),
            ],
        );
        assert_eq!(matches.len(), 1);
        assert!(matches.contains_key(&0));
    }

    fn test_room(files: &[&str]) -> Room {
        let mut room = Room::new(RoomCode::generate(), "r".into(), false, Utc::now());
        room.playlist.items = files
            .iter()
            .map(|f| PlaylistItem::local((*f).to_string()))
            .collect();
        room.playlist.current_index = 0;
        room
    }

    #[test]
    fn folder_report_and_drift_targeting() {
        let dir = TempDir::new().expect("tempdir");
        let svc = BslService::new(true, 3, BslMode::Any, memory(&dir));
        let mut room = test_room(&["Movie.mkv"]);
        let conn = ConnectionId::new();
        let fp = Fingerprint::from("V1");

        let result = svc.record_folder_report(
            &mut room,
            conn.clone(),
            fp.clone(),
            Some("Viewer One".into()),
            vec![client_file(
                "movie.mkv",
                900 * MIB + 400 * 1024,
                Some("video/x-matroska"),
            )],
            &[server_file(0, "Movie.mkv", Some(900 * MIB))],
        );
        assert_eq!(result.total_matched, 1);
        assert_eq!(result.total_playlist, 1);

        let stored = room.drift.set(fp.clone(), 0, -3);
        assert_eq!(stored, -3);
        assert_eq!(room.drift.values_for(&fp).get(&0), Some(&-3));
        assert!(room
            .drift
            .values_for(&Fingerprint::from("V2"))
            .is_empty());
    }

    #[test]
    fn manual_match_persists_for_future_sessions() {
        let dir = TempDir::new().expect("tempdir");
        let mem = memory(&dir);
        let svc = BslService::new(true, 4, BslMode::Any, mem.clone());
        let mut room = test_room(&["movie.mkv"]);
        let conn = ConnectionId::new();
        let fp = Fingerprint::from("V1");

        room.bsl.clients.insert(
            conn.clone(),
            BslClientState {
                fingerprint: Some(fp.clone()),
                folder_selected: true,
                ..BslClientState::default()
            },
        );

        svc.manual_match(&mut room, &conn, "weird name.mkv", 0)
            .expect("manual match");
        assert_eq!(
            mem.bsl_match(&fp, "weird name.mkv"),
            Some("movie.mkv".to_string())
        );

        assert!(svc.manual_match(&mut room, &conn, "x.mkv", 5).is_err());
    }

    #[test]
    fn aggregate_any_vs_all() {
        let dir = TempDir::new().expect("tempdir");
        let mem = memory(&dir);
        let mut room = test_room(&["a.mkv", "b.mkv"]);

        for (conn_name, matched) in [("c1", vec![0, 1]), ("c2", vec![0])] {
            let mut matches = HashMap::new();
            for idx in matched {
                matches.insert(idx, "x.mkv".to_string());
            }
            room.bsl.clients.insert(
                ConnectionId::from_string(conn_name.to_string()),
                BslClientState {
                    fingerprint: Some(Fingerprint::from(conn_name)),
                    folder_selected: true,
                    matches,
                    ..BslClientState::default()
                },
            );
        }

        let any = BslService::new(true, 1, BslMode::Any, mem.clone()).status(&room);
        assert_eq!(any.items_active.get(&0), Some(&true));
        assert_eq!(any.items_active.get(&1), Some(&true));

        let all = BslService::new(true, 1, BslMode::All, mem).status(&room);
        assert_eq!(all.items_active.get(&0), Some(&true));
        assert_eq!(all.items_active.get(&1), Some(&false));
    }
}
