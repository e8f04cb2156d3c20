//! Persistent fallback settings, stored as a singleton SQLite row.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::fallback::{FallbackSettings, FallbackSettingsPatch};
use crate::store::schema::{initialize_schema, is_initialized};

/// Fallback settings storage.
///
/// `get` must return the current settings every time it is called; callers
/// re-read at each failure rather than caching.
pub trait SettingsStore: Send + Sync {
    /// Read the current settings. Defaults when nothing has been stored yet.
    fn get(&self) -> Result<FallbackSettings>;

    /// Apply a partial update, returning the merged settings.
    fn update(&self, patch: FallbackSettingsPatch) -> Result<FallbackSettings>;
}

/// SQLite-backed settings store over the singleton `fallback_settings` row.
pub struct SqliteSettingsStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSettingsStore {
    /// Open or create a settings store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Storage(e.to_string()))?;

        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Storage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Build over an already-initialized shared connection, so settings and
    /// the audit log can live in one database file.
    pub fn with_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&conn).map_err(|e| Error::Storage(e.to_string()))
    }

    fn write(&self, settings: &FallbackSettings) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO fallback_settings (
                    id, enabled, fallback_model_id, fallback_provider,
                    max_retries, retry_delay_ms, use_llm_summarization,
                    summarization_model_id, summarization_provider, updated_at
                ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, datetime('now'))",
                params![
                    settings.enabled as i64,
                    settings.fallback_model_id,
                    settings.fallback_provider,
                    settings.max_retries as i64,
                    settings.retry_delay_ms as i64,
                    settings.use_llm_summarization as i64,
                    settings.summarization_model_id,
                    settings.summarization_provider,
                ],
            )?;
            Ok(())
        })
    }
}

impl SettingsStore for SqliteSettingsStore {
    fn get(&self) -> Result<FallbackSettings> {
        let stored = self.with_conn(|conn| {
            conn.query_row(
                "SELECT enabled, fallback_model_id, fallback_provider,
                        max_retries, retry_delay_ms, use_llm_summarization,
                        summarization_model_id, summarization_provider
                 FROM fallback_settings WHERE id = 1",
                [],
                |row| {
                    Ok(FallbackSettings {
                        enabled: row.get::<_, i64>(0)? != 0,
                        fallback_model_id: row.get(1)?,
                        fallback_provider: row.get(2)?,
                        max_retries: row.get::<_, i64>(3)? as u32,
                        retry_delay_ms: row.get::<_, i64>(4)? as u64,
                        use_llm_summarization: row.get::<_, i64>(5)? != 0,
                        summarization_model_id: row.get(6)?,
                        summarization_provider: row.get(7)?,
                    })
                },
            )
            .optional()
        })?;

        Ok(stored.unwrap_or_default())
    }

    fn update(&self, patch: FallbackSettingsPatch) -> Result<FallbackSettings> {
        let merged = self.get()?.merged_with(patch);
        merged.validate()?;
        self.write(&merged)?;
        Ok(merged)
    }
}

/// In-memory settings store (for testing).
pub struct MemorySettingsStore {
    settings: Mutex<FallbackSettings>,
}

impl MemorySettingsStore {
    /// Create a store holding the given settings.
    pub fn new(settings: FallbackSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn get(&self) -> Result<FallbackSettings> {
        self.settings
            .lock()
            .map(|s| s.clone())
            .map_err(|_| Error::Internal("settings lock poisoned".to_string()))
    }

    fn update(&self, patch: FallbackSettingsPatch) -> Result<FallbackSettings> {
        let mut guard = self
            .settings
            .lock()
            .map_err(|_| Error::Internal("settings lock poisoned".to_string()))?;
        let merged = guard.merged_with(patch);
        merged.validate()?;
        *guard = merged.clone();
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_before_first_write() {
        let store = SqliteSettingsStore::in_memory().unwrap();
        assert_eq!(store.get().unwrap(), FallbackSettings::default());
    }

    #[test]
    fn test_update_merges_and_persists() {
        let store = SqliteSettingsStore::in_memory().unwrap();

        let updated = store
            .update(FallbackSettingsPatch {
                fallback_model_id: Some(Some("gpt-4o".to_string())),
                fallback_provider: Some(Some("openai".to_string())),
                max_retries: Some(5),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(updated.fallback_model_id.as_deref(), Some("gpt-4o"));
        assert_eq!(updated.max_retries, 5);
        assert_eq!(store.get().unwrap(), updated);

        // A second partial update only touches its own fields.
        let again = store
            .update(FallbackSettingsPatch {
                enabled: Some(false),
                ..Default::default()
            })
            .unwrap();
        assert!(!again.enabled);
        assert_eq!(again.fallback_model_id.as_deref(), Some("gpt-4o"));
        assert_eq!(again.max_retries, 5);
    }

    #[test]
    fn test_update_rejects_zero_retries() {
        let store = SqliteSettingsStore::in_memory().unwrap();

        let err = store
            .update(FallbackSettingsPatch {
                max_retries: Some(0),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        // The invalid update left the stored settings untouched.
        assert_eq!(store.get().unwrap().max_retries, 3);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fallback.db");

        {
            let store = SqliteSettingsStore::open(&path).unwrap();
            store
                .update(FallbackSettingsPatch {
                    use_llm_summarization: Some(true),
                    summarization_model_id: Some(Some(
                        "claude-3-5-haiku-20241022".to_string(),
                    )),
                    ..Default::default()
                })
                .unwrap();
        }

        let store = SqliteSettingsStore::open(&path).unwrap();
        let settings = store.get().unwrap();
        assert!(settings.use_llm_summarization);
        assert_eq!(
            settings.summarization_model_id.as_deref(),
            Some("claude-3-5-haiku-20241022")
        );
    }
}
