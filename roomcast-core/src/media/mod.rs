pub mod jobs;
pub mod library;
pub mod manifest;
pub mod thumbs;

pub use jobs::{dedupe_vtt_cues, JobQueue, JobRequest, JobStatus, MediaJob, StreamKind};
pub use library::{FsMediaLibrary, MediaEntry, MediaLibrary, LIST_CACHE_TTL_SECS};
pub use manifest::{ExternalTrackRecord, ManifestStore, TrackManifest, STALE_AFTER_DAYS};
pub use thumbs::{ThumbnailCache, LEGACY_WIDTH};
