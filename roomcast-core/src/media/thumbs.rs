//! Thumbnail cache in the OS temp directory, keyed by `(source, width)`.
//! The OS clears the directory on reboot, which is the intended lifetime.

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::{Error, Result};

/// Width that keeps the legacy un-tagged filename for back-compat.
pub const LEGACY_WIDTH: u32 = 720;

#[derive(Debug, Clone)]
pub struct ThumbnailCache {
    dir: PathBuf,
}

impl ThumbnailCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            dir: std::env::temp_dir().join("roomcast-thumbs"),
        }
    }

    #[must_use]
    pub fn with_dir(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Path of an already-generated thumbnail by its cache filename.
    #[must_use]
    pub fn path_in_cache(&self, cache_name: &str) -> PathBuf {
        self.dir.join(cache_name)
    }

    /// Cache path for a source filename at a given width.
    #[must_use]
    pub fn path_for(&self, source: &str, width: u32) -> PathBuf {
        let stem = Path::new(source)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(source);
        if width == LEGACY_WIDTH {
            self.dir.join(format!("{stem}.jpg"))
        } else {
            self.dir.join(format!("{stem}_w{width}.jpg"))
        }
    }

    /// Produce (or reuse) a thumbnail for a media file. Writes to a temp
    /// name and renames so a concurrent request never sees a partial file.
    pub async fn ensure(&self, media_dir: &Path, source: &str, width: u32) -> Result<PathBuf> {
        let target = self.path_for(source, width);
        if target.exists() {
            debug!(source, width, "Thumbnail cache hit");
            return Ok(target);
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let input = media_dir.join(source);
        if !input.exists() {
            return Err(Error::NotFound(format!("No such media file: {source}")));
        }

        let tmp = target.with_extension("jpg.partial");
        let status = tokio::process::Command::new("ffmpeg")
            .args(["-y", "-ss", "10", "-i"])
            .arg(&input)
            .args(["-frames:v", "1", "-vf"])
            .arg(format!("scale={width}:-2"))
            .args(["-f", "mjpeg"])
            .arg(&tmp)
            .output()
            .await
            .map_err(|e| Error::Internal(format!("ffmpeg unavailable: {e}")))?;

        if !status.status.success() {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::Internal(format!(
                "Thumbnail generation failed for {source}"
            )));
        }

        tokio::fs::rename(&tmp, &target).await?;
        Ok(target)
    }
}

impl Default for ThumbnailCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn legacy_width_keeps_plain_filename() {
        let dir = TempDir::new().expect("tempdir");
        let cache = ThumbnailCache::with_dir(dir.path().to_path_buf());
        let legacy = cache.path_for("Movie.mkv", LEGACY_WIDTH);
        assert!(legacy.to_string_lossy().ends_with("Movie.jpg"));
        let tagged = cache.path_for("Movie.mkv", 320);
        assert!(tagged.to_string_lossy().ends_with("Movie_w320.jpg"));
    }

    #[tokio::test]
    async fn missing_source_is_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let cache = ThumbnailCache::with_dir(dir.path().join("thumbs"));
        let err = cache
            .ensure(&dir.path().join("media"), "ghost.mkv", 320)
            .await
            .expect_err("should fail");
        assert!(matches!(err, Error::NotFound(_)));
    }
}
