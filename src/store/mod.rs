//! Persistent storage for the fallback system.
//!
//! One SQLite database holds two things: the append-only audit log of
//! retry/fallback attempts, and the singleton settings row. Both are exposed
//! behind traits so the engine can be tested with in-memory doubles.

mod log;
mod schema;
mod settings;

pub use log::{FallbackLog, SqliteFallbackLog};
pub use schema::{get_schema_version, initialize_schema, is_initialized, SCHEMA_VERSION};
pub use settings::{MemorySettingsStore, SettingsStore, SqliteSettingsStore};
