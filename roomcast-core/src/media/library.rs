//! Media enumeration and track discovery. The coordination core only sees
//! the [`MediaLibrary`] trait; the filesystem implementation shells out to
//! ffprobe and merges sidecar tracks from the manifest store.

use async_trait::async_trait;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::manifest::ManifestStore;
use crate::models::{MediaKind, Track, TrackSet};
use crate::Result;

/// How long the media listing is served from cache.
pub const LIST_CACHE_TTL_SECS: u64 = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaEntry {
    pub filename: String,
    pub kind: MediaKind,
}

/// Contract the coordination core consumes; see also the job queue which
/// appends sidecar tracks behind this interface.
#[async_trait]
pub trait MediaLibrary: Send + Sync {
    /// Enumerate playable media files. Implementations may cache.
    async fn list_media(&self) -> Result<Vec<MediaEntry>>;

    /// Container streams merged with sidecar tracks for one file.
    /// Probe failures degrade to empty lists, never errors.
    async fn tracks_for(&self, filename: &str) -> Result<TrackSet>;

    /// Size of the stored media file, if present. Used by BSL matching.
    async fn file_size(&self, filename: &str) -> Option<u64>;
}

/// Filesystem-backed library over a single flat media directory.
pub struct FsMediaLibrary {
    media_dir: PathBuf,
    manifests: ManifestStore,
    list_cache: Cache<u8, Arc<Vec<MediaEntry>>>,
}

impl FsMediaLibrary {
    #[must_use]
    pub fn new(media_dir: PathBuf, manifests: ManifestStore) -> Self {
        Self {
            media_dir,
            manifests,
            list_cache: Cache::builder()
                .max_capacity(1)
                .time_to_live(Duration::from_secs(LIST_CACHE_TTL_SECS))
                .build(),
        }
    }

    async fn scan(&self) -> Result<Vec<MediaEntry>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.media_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') || !is_media_filename(&name) {
                continue;
            }
            let kind = MediaKind::from_filename(&name);
            entries.push(MediaEntry {
                filename: name,
                kind,
            });
        }
        entries.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(entries)
    }

    async fn probe_container_tracks(&self, filename: &str) -> TrackSet {
        let path = self.media_dir.join(filename);
        let output = tokio::process::Command::new("ffprobe")
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
            ])
            .arg(&path)
            .output()
            .await;

        let output = match output {
            Ok(out) if out.status.success() => out,
            Ok(out) => {
                warn!(file = filename, code = ?out.status.code(), "ffprobe failed");
                return TrackSet::default();
            }
            Err(e) => {
                warn!(file = filename, error = %e, "ffprobe unavailable");
                return TrackSet::default();
            }
        };

        let Ok(doc) = serde_json::from_slice::<serde_json::Value>(&output.stdout) else {
            return TrackSet::default();
        };
        parse_ffprobe_streams(&doc)
    }
}

#[async_trait]
impl MediaLibrary for FsMediaLibrary {
    async fn list_media(&self) -> Result<Vec<MediaEntry>> {
        if let Some(cached) = self.list_cache.get(&0) {
            return Ok(cached.as_ref().clone());
        }
        let entries = self.scan().await?;
        self.list_cache.insert(0, Arc::new(entries.clone()));
        Ok(entries)
    }

    async fn tracks_for(&self, filename: &str) -> Result<TrackSet> {
        let mut tracks = self.probe_container_tracks(filename).await;
        let (sidecar_audio, sidecar_subs) = self.manifests.external_tracks(filename).await;
        tracks.audio.extend(sidecar_audio);
        tracks.subtitles.extend(sidecar_subs);
        debug!(
            file = filename,
            audio = tracks.audio.len(),
            subtitles = tracks.subtitles.len(),
            "Resolved tracks"
        );
        Ok(tracks)
    }

    async fn file_size(&self, filename: &str) -> Option<u64> {
        tokio::fs::metadata(self.media_dir.join(filename))
            .await
            .ok()
            .map(|m| m.len())
    }
}

fn is_media_filename(name: &str) -> bool {
    let ext = name
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    matches!(
        ext.as_str(),
        "mp4" | "mkv" | "webm" | "avi" | "mov" | "m4v" | "ts"
            | "mp3" | "flac" | "ogg" | "wav" | "m4a" | "aac" | "opus"
            | "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp"
    )
}

/// Per-type ordinal track lists from an ffprobe `-show_streams` document.
fn parse_ffprobe_streams(doc: &serde_json::Value) -> TrackSet {
    let mut tracks = TrackSet::default();
    let Some(streams) = doc["streams"].as_array() else {
        return tracks;
    };

    for stream in streams {
        let codec_type = stream["codec_type"].as_str().unwrap_or_default();
        let target = match codec_type {
            "audio" => &mut tracks.audio,
            "subtitle" => &mut tracks.subtitles,
            _ => continue,
        };
        let index = target.len() as i32;
        target.push(Track {
            index,
            codec: stream["codec_name"].as_str().unwrap_or("unknown").to_string(),
            language: stream["tags"]["language"].as_str().map(String::from),
            title: stream["tags"]["title"].as_str().map(String::from),
            is_default: stream["disposition"]["default"].as_i64() == Some(1),
            is_external: false,
            url: None,
        });
    }
    tracks
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn lists_only_media_files() {
        let dir = TempDir::new().expect("tempdir");
        for name in ["a.mkv", "b.mp3", "c.txt", ".hidden.mkv", "d.png"] {
            tokio::fs::write(dir.path().join(name), b"x")
                .await
                .expect("write");
        }
        let library = FsMediaLibrary::new(
            dir.path().to_path_buf(),
            ManifestStore::new(dir.path().join("manifests")),
        );

        let entries = library.list_media().await.expect("list");
        let names: Vec<&str> = entries.iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, vec!["a.mkv", "b.mp3", "d.png"]);
        assert_eq!(entries[0].kind, MediaKind::Video);
        assert_eq!(entries[1].kind, MediaKind::Audio);
    }

    #[tokio::test]
    async fn listing_is_served_from_cache() {
        let dir = TempDir::new().expect("tempdir");
        tokio::fs::write(dir.path().join("a.mkv"), b"x")
            .await
            .expect("write");
        let library = FsMediaLibrary::new(
            dir.path().to_path_buf(),
            ManifestStore::new(dir.path().join("manifests")),
        );

        assert_eq!(library.list_media().await.expect("list").len(), 1);
        tokio::fs::write(dir.path().join("b.mkv"), b"x")
            .await
            .expect("write");
        // Within the TTL the new file is not yet visible.
        assert_eq!(library.list_media().await.expect("list").len(), 1);
    }

    #[test]
    fn parses_ffprobe_streams_with_per_type_ordinals() {
        let doc = serde_json::json!({
            "streams": [
                {"codec_type": "video", "codec_name": "h264"},
                {"codec_type": "audio", "codec_name": "aac",
                 "tags": {"language": "eng"}, "disposition": {"default": 1}},
                {"codec_type": "audio", "codec_name": "ac3",
                 "tags": {"language": "jpn"}},
                {"codec_type": "subtitle", "codec_name": "subrip",
                 "tags": {"language": "eng", "title": "English"}}
            ]
        });
        let tracks = parse_ffprobe_streams(&doc);
        assert_eq!(tracks.audio.len(), 2);
        assert_eq!(tracks.audio[0].index, 0);
        assert!(tracks.audio[0].is_default);
        assert_eq!(tracks.audio[1].index, 1);
        assert_eq!(tracks.subtitles.len(), 1);
        assert_eq!(tracks.subtitles[0].index, 0);
        assert_eq!(tracks.subtitles[0].title.as_deref(), Some("English"));
    }

    #[tokio::test]
    async fn sidecars_are_merged_with_high_indices() {
        let dir = TempDir::new().expect("tempdir");
        tokio::fs::write(dir.path().join("movie.mkv"), b"x")
            .await
            .expect("write");
        let manifests = ManifestStore::new(dir.path().join("manifests"));
        manifests
            .add_external_track(
                "movie.mkv",
                super::super::manifest::ExternalTrackRecord {
                    track_type: "subtitle".into(),
                    lang: Some("eng".into()),
                    title: None,
                    path: dir.path().join("movie.eng.vtt"),
                    url: "/tracks/movie.eng.vtt".into(),
                },
            )
            .await
            .expect("add");
        let library = FsMediaLibrary::new(dir.path().to_path_buf(), manifests);

        let tracks = library.tracks_for("movie.mkv").await.expect("tracks");
        assert!(tracks
            .subtitles
            .iter()
            .any(|t| t.is_sidecar() && t.is_external));
    }
}
