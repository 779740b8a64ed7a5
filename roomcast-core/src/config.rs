use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Playback rate grid accepted by the state machine.
pub const RATE_MIN: f64 = 0.25;
pub const RATE_MAX: f64 = 3.0;
pub const RATE_STEP: f64 = 0.25;

/// How the room treats a newly joined viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JoinMode {
    /// New joiner receives the current state and the room keeps playing.
    #[default]
    Sync,
    /// Joining resets the room to position 0 for everyone.
    Reset,
}

/// Aggregation mode for the per-item BSL summary shown to the admin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BslMode {
    /// An item counts as BSL-active when at least one reporting viewer matched it.
    #[default]
    Any,
    /// An item counts as BSL-active only when every reporting viewer matched it.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubtitleRenderer {
    #[default]
    Wsr,
    Jassub,
}

/// Application configuration.
///
/// Values are layered: compiled defaults, then an optional `KEY=VALUE` file,
/// then environment variables (highest precedence). Out-of-range values are
/// clamped with a warning rather than rejected.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub media_dir: PathBuf,

    pub volume_step: u32,
    pub skip_seconds: u32,
    pub join_mode: JoinMode,
    pub use_https: bool,
    pub ssl_key_file: Option<String>,
    pub ssl_cert_file: Option<String>,

    pub bsl_mode: BslMode,
    pub bsl_advanced_match: bool,
    /// Advanced-match score threshold (1-4). Threshold 4 requires a client
    /// MIME type which many uploads omit, so 4 can be effectively
    /// unreachable; keep it at 1-3 unless every client reports MIME.
    pub bsl_match_threshold: u8,

    pub skip_intro_seconds: u32,
    pub video_autoplay: bool,
    pub admin_fingerprint_lock: bool,
    pub client_controls_disabled: bool,
    pub client_sync_disabled: bool,
    pub chat_enabled: bool,
    pub data_hydration: bool,
    pub server_mode: bool,
    pub max_volume: u32,
    pub subtitle_renderer: SubtitleRenderer,

    /// SHA-256-compared password gating the media tool endpoints.
    /// Empty string disables the tools entirely.
    pub ffmpeg_tools_password: String,

    pub log_level: String,
    pub log_format: String,
    pub log_file: Option<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("data_dir", &self.data_dir)
            .field("media_dir", &self.media_dir)
            .field("volume_step", &self.volume_step)
            .field("skip_seconds", &self.skip_seconds)
            .field("join_mode", &self.join_mode)
            .field("use_https", &self.use_https)
            .field("bsl_mode", &self.bsl_mode)
            .field("bsl_advanced_match", &self.bsl_advanced_match)
            .field("bsl_match_threshold", &self.bsl_match_threshold)
            .field("skip_intro_seconds", &self.skip_intro_seconds)
            .field("video_autoplay", &self.video_autoplay)
            .field("admin_fingerprint_lock", &self.admin_fingerprint_lock)
            .field("client_controls_disabled", &self.client_controls_disabled)
            .field("client_sync_disabled", &self.client_sync_disabled)
            .field("chat_enabled", &self.chat_enabled)
            .field("data_hydration", &self.data_hydration)
            .field("server_mode", &self.server_mode)
            .field("max_volume", &self.max_volume)
            .field("subtitle_renderer", &self.subtitle_renderer)
            .field("ffmpeg_tools_password", &"<redacted>")
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            data_dir: PathBuf::from("./data"),
            media_dir: PathBuf::from("./media"),
            volume_step: 5,
            skip_seconds: 5,
            join_mode: JoinMode::Sync,
            use_https: false,
            ssl_key_file: None,
            ssl_cert_file: None,
            bsl_mode: BslMode::Any,
            bsl_advanced_match: true,
            bsl_match_threshold: 1,
            skip_intro_seconds: 87,
            video_autoplay: false,
            admin_fingerprint_lock: false,
            client_controls_disabled: false,
            client_sync_disabled: false,
            chat_enabled: true,
            data_hydration: true,
            server_mode: false,
            max_volume: 100,
            subtitle_renderer: SubtitleRenderer::Wsr,
            ffmpeg_tools_password: String::new(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from an optional `KEY=VALUE` file plus the process
    /// environment. Environment variables take precedence over the file.
    pub fn load(config_file: Option<&Path>) -> std::result::Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path).required(false));
        }

        builder = builder.add_source(Environment::default());

        let mut cfg: Self = builder.build()?.try_deserialize()?;
        cfg.clamp_ranges();
        Ok(cfg)
    }

    /// Clamp numeric keys to their documented ranges.
    pub fn clamp_ranges(&mut self) {
        if !(1024..=49151).contains(&self.port) {
            warn!(port = self.port, "PORT outside 1024-49151, using 3000");
            self.port = 3000;
        }
        self.volume_step = clamp_with_warning("VOLUME_STEP", self.volume_step, 1, 20);
        self.skip_seconds = clamp_with_warning("SKIP_SECONDS", self.skip_seconds, 5, 60);
        self.bsl_match_threshold =
            clamp_with_warning("BSL_MATCH_THRESHOLD", self.bsl_match_threshold, 1, 4);
        self.skip_intro_seconds = self.skip_intro_seconds.max(1);
        self.max_volume = clamp_with_warning("MAX_VOLUME", self.max_volume, 100, 1000);
    }

    /// jassub needs SharedArrayBuffer, which browsers gate behind HTTPS.
    #[must_use]
    pub fn effective_subtitle_renderer(&self) -> SubtitleRenderer {
        if self.subtitle_renderer == SubtitleRenderer::Jassub && !self.use_https {
            warn!("SUBTITLE_RENDERER=jassub requires HTTPS, falling back to wsr");
            return SubtitleRenderer::Wsr;
        }
        self.subtitle_renderer
    }

    #[must_use]
    pub fn ffmpeg_tools_enabled(&self) -> bool {
        !self.ffmpeg_tools_password.is_empty()
    }

    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn clamp_with_warning<T: Ord + Copy + std::fmt::Display>(key: &str, value: T, min: T, max: T) -> T {
    if value < min || value > max {
        let clamped = value.clamp(min, max);
        warn!(%key, %value, %clamped, "config value out of range, clamped");
        clamped
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.volume_step, 5);
        assert_eq!(cfg.skip_seconds, 5);
        assert_eq!(cfg.join_mode, JoinMode::Sync);
        assert_eq!(cfg.bsl_mode, BslMode::Any);
        assert!(cfg.bsl_advanced_match);
        assert_eq!(cfg.bsl_match_threshold, 1);
        assert_eq!(cfg.skip_intro_seconds, 87);
        assert!(!cfg.video_autoplay);
        assert!(cfg.chat_enabled);
        assert!(!cfg.server_mode);
        assert_eq!(cfg.max_volume, 100);
        assert!(!cfg.ffmpeg_tools_enabled());
    }

    #[test]
    fn out_of_range_values_clamp() {
        let mut cfg = Config {
            port: 80,
            volume_step: 99,
            skip_seconds: 2,
            bsl_match_threshold: 9,
            max_volume: 5000,
            skip_intro_seconds: 0,
            ..Config::default()
        };
        cfg.clamp_ranges();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.volume_step, 20);
        assert_eq!(cfg.skip_seconds, 5);
        assert_eq!(cfg.bsl_match_threshold, 4);
        assert_eq!(cfg.max_volume, 1000);
        assert_eq!(cfg.skip_intro_seconds, 1);
    }

    #[test]
    fn jassub_forced_off_without_https() {
        let cfg = Config {
            subtitle_renderer: SubtitleRenderer::Jassub,
            use_https: false,
            ..Config::default()
        };
        assert_eq!(cfg.effective_subtitle_renderer(), SubtitleRenderer::Wsr);

        let cfg = Config {
            subtitle_renderer: SubtitleRenderer::Jassub,
            use_https: true,
            ..Config::default()
        };
        assert_eq!(cfg.effective_subtitle_renderer(), SubtitleRenderer::Jassub);
    }

    #[test]
    fn debug_redacts_tools_password() {
        let cfg = Config {
            ffmpeg_tools_password: "hunter2".to_string(),
            ..Config::default()
        };
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
