//! Core of the roomcast playback coordinator: domain models, the
//! wall-clock-anchored playback state machine, room registry, BSL matching,
//! persistence, and the media metadata adapter. The network surface lives
//! in `roomcast-api`.

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod media;
pub mod models;
pub mod service;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
