pub mod admin;
pub mod bsl;
pub mod chat;
pub mod playback;
pub mod rate_limit;
pub mod room;

pub use admin::AdminAuthority;
pub use bsl::{BslService, BslStatus, MatchResult, ServerFileInfo};
pub use chat::{escape_html, ChatOutcome, ChatService};
pub use playback::{PlaybackService, SkipDirection, TrackKind};
pub use rate_limit::RateLimiter;
pub use room::{RoomRegistry, SharedRoom};
