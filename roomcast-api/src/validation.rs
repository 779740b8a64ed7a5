//! Inbound payload validation. Rejections drop the event with a warning;
//! the post-state always equals the pre-state.

use regex::Regex;
use std::sync::LazyLock;

use roomcast_core::{Error, Result};

/// Filenames: word chars, whitespace, and a small punctuation set.
static FILENAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[\w\s\-.()\[\]]+$").unwrap()
});

pub const MAX_FILENAME_LEN: usize = 255;

/// Validate a client-supplied filename: non-empty, bounded, no path
/// traversal, no shell metacharacters.
pub fn validate_filename(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("Filename must not be empty".into()));
    }
    if name.len() > MAX_FILENAME_LEN {
        return Err(Error::Validation(format!(
            "Filename exceeds {MAX_FILENAME_LEN} bytes"
        )));
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(Error::Validation("Filename contains path traversal".into()));
    }
    if name
        .chars()
        .any(|c| matches!(c, ';' | '&' | '|' | '$' | '`' | '<' | '>' | '\n' | '\r'))
    {
        return Err(Error::Validation("Filename contains forbidden characters".into()));
    }
    if !FILENAME_RE.is_match(name) {
        return Err(Error::Validation("Filename contains unexpected characters".into()));
    }
    Ok(())
}

/// Playback times must be finite and non-negative.
pub fn validate_time(seconds: f64) -> Result<f64> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(Error::Validation(format!("Invalid time: {seconds}")));
    }
    Ok(seconds)
}

/// Audio tracks are >= 0; subtitle tracks allow -1 for "off".
pub fn validate_track_index(kind: &str, index: i32) -> Result<()> {
    let min = match kind {
        "audio" => 0,
        "subtitle" | "subtitles" => -1,
        other => return Err(Error::Validation(format!("Unknown track kind: {other}"))),
    };
    if index < min {
        return Err(Error::Validation(format!(
            "Track index {index} below minimum {min} for {kind}"
        )));
    }
    Ok(())
}

/// Playlist indices must land inside the current playlist.
pub fn validate_playlist_index(index: i32, len: usize) -> Result<()> {
    if index < 0 || index as usize >= len {
        return Err(Error::Validation(format!(
            "Playlist index {index} out of range 0..{len}"
        )));
    }
    Ok(())
}
