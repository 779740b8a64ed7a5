//! Per-media-file sidecar track manifests, plus the startup sweep that
//! removes manifests (and the sidecars they reference) whose source media
//! has been gone for more than a week.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::models::{Track, EXTERNAL_TRACK_BASE};
use crate::Result;

/// A manifest is deleted once its source has been missing this long.
pub const STALE_AFTER_DAYS: i64 = 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalTrackRecord {
    /// "audio" or "subtitle".
    #[serde(rename = "type")]
    pub track_type: String,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Sidecar file on disk.
    pub path: PathBuf,
    /// Serving URL handed to clients.
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TrackManifest {
    /// Last wall-clock instant at which the source media file was present.
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub external_tracks: Vec<ExternalTrackRecord>,
}

/// Filesystem store of one manifest per media filename.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn manifest_path(&self, media_filename: &str) -> PathBuf {
        self.dir.join(format!("{media_filename}.tracks.json"))
    }

    pub async fn load(&self, media_filename: &str) -> Option<TrackManifest> {
        let raw = tokio::fs::read_to_string(self.manifest_path(media_filename))
            .await
            .ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn save(&self, media_filename: &str, manifest: &TrackManifest) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.manifest_path(media_filename);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(manifest)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Record a freshly extracted sidecar for a media file.
    pub async fn add_external_track(
        &self,
        media_filename: &str,
        record: ExternalTrackRecord,
    ) -> Result<()> {
        let mut manifest = self.load(media_filename).await.unwrap_or_default();
        manifest.last_seen = Some(Utc::now());
        manifest.external_tracks.push(record);
        self.save(media_filename, &manifest).await
    }

    /// Sidecar tracks for a media file as wire `Track`s, numbered from
    /// [`EXTERNAL_TRACK_BASE`] so they cannot collide with container streams.
    pub async fn external_tracks(&self, media_filename: &str) -> (Vec<Track>, Vec<Track>) {
        let Some(manifest) = self.load(media_filename).await else {
            return (Vec::new(), Vec::new());
        };
        let mut audio = Vec::new();
        let mut subtitles = Vec::new();
        for (i, record) in manifest.external_tracks.iter().enumerate() {
            let track = Track {
                index: EXTERNAL_TRACK_BASE + i as i32,
                codec: sidecar_codec(&record.path),
                language: record.lang.clone(),
                title: record.title.clone(),
                is_default: false,
                is_external: true,
                url: Some(record.url.clone()),
            };
            if record.track_type == "audio" {
                audio.push(track);
            } else {
                subtitles.push(track);
            }
        }
        (audio, subtitles)
    }

    /// All sidecar paths referenced by any manifest. Used to find orphans.
    pub async fn referenced_sidecars(&self) -> Vec<PathBuf> {
        let mut referenced = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return referenced;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(raw) = tokio::fs::read_to_string(entry.path()).await else {
                continue;
            };
            if let Ok(manifest) = serde_json::from_str::<TrackManifest>(&raw) {
                referenced.extend(manifest.external_tracks.iter().map(|t| t.path.clone()));
            }
        }
        referenced
    }

    /// Startup sweep. For each manifest: if the source media file exists,
    /// stamp `last_seen`; if it has been missing for more than
    /// [`STALE_AFTER_DAYS`], delete the referenced sidecars and then the
    /// manifest itself.
    pub async fn sweep(&self, media_dir: &Path) -> usize {
        let mut removed = 0;
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return removed;
        };
        let now = Utc::now();

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(media_filename) = name.strip_suffix(".tracks.json") else {
                continue;
            };
            let Ok(raw) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            let Ok(mut manifest) = serde_json::from_str::<TrackManifest>(&raw) else {
                warn!(manifest = %path.display(), "Unparseable track manifest, skipping");
                continue;
            };

            if media_dir.join(media_filename).exists() {
                manifest.last_seen = Some(now);
                let _ = self.save(media_filename, &manifest).await;
                continue;
            }

            let last_seen = manifest.last_seen.unwrap_or(now);
            if now - last_seen > Duration::days(STALE_AFTER_DAYS) {
                for track in &manifest.external_tracks {
                    if let Err(e) = tokio::fs::remove_file(&track.path).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!(sidecar = %track.path.display(), error = %e, "Failed to delete stale sidecar");
                        }
                    }
                }
                if tokio::fs::remove_file(&path).await.is_ok() {
                    info!(media = media_filename, "Removed stale track manifest");
                    removed += 1;
                }
            } else if manifest.last_seen.is_none() {
                manifest.last_seen = Some(now);
                let _ = self.save(media_filename, &manifest).await;
            }
        }
        removed
    }
}

fn sidecar_codec(path: &Path) -> String {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("vtt") => "webvtt".to_string(),
        Some("srt") => "subrip".to_string(),
        Some("m4a") | Some("aac") => "aac".to_string(),
        Some("mp3") => "mp3".to_string(),
        Some(other) => other.to_string(),
        None => "unknown".to_string(),
    }
}
