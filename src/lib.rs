//! chatvault archives chat history into a single SQLite file and fetches
//! attachment binaries in the background.

pub mod config;
pub mod download;
pub mod throttle;

pub use chatvault_core::error;
pub use chatvault_core::types;
pub use chatvault_storage::db;
pub use chatvault_storage::filter;
pub use chatvault_storage::pool;
