pub mod admins;
pub mod log;
pub mod memory;

pub use admins::RoomAdminTable;
pub use log::EventLog;
pub use memory::{load_or_create_key, MemoryStore};
