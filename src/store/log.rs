//! SQLite-backed append-only fallback audit log.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::context::ContextMethod;
use crate::error::{Error, Result};
use crate::fallback::{FallbackLogEntry, FallbackStats, ProviderErrorKind};
use crate::store::schema::{initialize_schema, is_initialized};

/// Append-only audit log of retry/fallback attempts.
///
/// Entries are immutable once written; the only mutation is [`clear`].
///
/// [`clear`]: FallbackLog::clear
pub trait FallbackLog: Send + Sync {
    /// Append one attempt record.
    fn append(&self, entry: &FallbackLogEntry) -> Result<()>;

    /// Entries for a task, oldest first, optionally capped.
    fn by_task(&self, task_id: &str, limit: Option<usize>) -> Result<Vec<FallbackLogEntry>>;

    /// Entries in a closed time range, oldest first, optionally capped.
    fn in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<FallbackLogEntry>>;

    /// Aggregate statistics over the whole log.
    fn stats(&self) -> Result<FallbackStats>;

    /// Delete all entries, returning how many were removed.
    fn clear(&self) -> Result<u64>;
}

/// SQLite-backed fallback log.
pub struct SqliteFallbackLog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteFallbackLog {
    /// Open or create a log at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Storage(e.to_string()))?;

        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory log (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Storage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Share this log's connection with a [`SqliteSettingsStore`].
    ///
    /// [`SqliteSettingsStore`]: crate::store::SqliteSettingsStore
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
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

    fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<FallbackLogEntry> {
        let id: String = row.get(0)?;
        let error_kind: String = row.get(7)?;
        let context_method: Option<String> = row.get(9)?;
        let created_at: String = row.get(13)?;

        Ok(FallbackLogEntry {
            id: Uuid::parse_str(&id).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            task_id: row.get(1)?,
            session_id: row.get(2)?,
            from_model: row.get(3)?,
            from_provider: row.get(4)?,
            to_model: row.get(5)?,
            to_provider: row.get(6)?,
            error_kind: ProviderErrorKind::classify(&error_kind),
            error_message: row.get(8)?,
            context_method: context_method.map(|m| match m.as_str() {
                "llm" => ContextMethod::Llm,
                _ => ContextMethod::Template,
            }),
            context_tokens: row.get(10)?,
            success: row.get::<_, i64>(11)? != 0,
            duration_ms: row.get::<_, i64>(12)? as u64,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        13,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?,
        })
    }
}

const SELECT_COLUMNS: &str = "id, task_id, session_id, from_model, from_provider, \
     to_model, to_provider, error_kind, error_message, context_method, \
     context_tokens, success, duration_ms, created_at";

impl FallbackLog for SqliteFallbackLog {
    fn append(&self, entry: &FallbackLogEntry) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO fallback_log (
                    id, task_id, session_id, from_model, from_provider,
                    to_model, to_provider, error_kind, error_message,
                    context_method, context_tokens, success, duration_ms, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    entry.id.to_string(),
                    entry.task_id,
                    entry.session_id,
                    entry.from_model,
                    entry.from_provider,
                    entry.to_model,
                    entry.to_provider,
                    entry.error_kind.to_string(),
                    entry.error_message,
                    entry.context_method.map(|m| m.to_string()),
                    entry.context_tokens,
                    entry.success as i64,
                    entry.duration_ms as i64,
                    entry.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    fn by_task(&self, task_id: &str, limit: Option<usize>) -> Result<Vec<FallbackLogEntry>> {
        // SQLite treats a negative LIMIT as unlimited.
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM fallback_log WHERE task_id = ?1
                 ORDER BY created_at, id LIMIT ?2",
                SELECT_COLUMNS
            ))?;
            let rows = stmt.query_map(params![task_id, limit], Self::row_to_entry)?;
            rows.collect()
        })
    }

    fn in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<FallbackLogEntry>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM fallback_log
                 WHERE created_at >= ?1 AND created_at <= ?2
                 ORDER BY created_at, id LIMIT ?3",
                SELECT_COLUMNS
            ))?;
            let rows = stmt.query_map(
                params![start.to_rfc3339(), end.to_rfc3339(), limit],
                Self::row_to_entry,
            )?;
            rows.collect()
        })
    }

    fn stats(&self) -> Result<FallbackStats> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(success), 0),
                        COALESCE(AVG(duration_ms), 0.0)
                 FROM fallback_log",
                [],
                |row| {
                    let total: i64 = row.get(0)?;
                    let successful: i64 = row.get(1)?;
                    let avg_duration_ms: f64 = row.get(2)?;
                    Ok(FallbackStats {
                        total_events: total as u64,
                        successful_events: successful as u64,
                        failed_events: (total - successful) as u64,
                        success_rate: if total > 0 {
                            successful as f64 / total as f64
                        } else {
                            0.0
                        },
                        avg_duration_ms,
                    })
                },
            )
        })
    }

    fn clear(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let rows = conn.execute("DELETE FROM fallback_log", [])?;
            Ok(rows as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::ProviderFailure;
    use crate::run::TaskRun;

    fn sample_run() -> TaskRun {
        TaskRun::new("task-1", "claude-3-5-sonnet-20241022", "anthropic")
            .with_session_id("sess-abc")
    }

    fn retry_entry(task_id: &str, success: bool, duration_ms: u64) -> FallbackLogEntry {
        let run = TaskRun::new(task_id, "claude-3-5-sonnet-20241022", "anthropic");
        let failure = ProviderFailure::new(ProviderErrorKind::RateLimit, "throttled");
        FallbackLogEntry::retry_attempt(&run, &failure).finished(success, duration_ms)
    }

    #[test]
    fn test_append_and_read_back() {
        let log = SqliteFallbackLog::in_memory().unwrap();
        let failure = ProviderFailure::new(ProviderErrorKind::Timeout, "deadline exceeded");
        let entry = FallbackLogEntry::switch_attempt(
            &sample_run(),
            &failure,
            "gpt-4o",
            "openai",
            ContextMethod::Llm,
            240,
        )
        .finished(true, 1_200);

        log.append(&entry).unwrap();

        let entries = log.by_task("task-1", None).unwrap();
        assert_eq!(entries.len(), 1);
        let read = &entries[0];
        assert_eq!(read.id, entry.id);
        assert_eq!(read.session_id.as_deref(), Some("sess-abc"));
        assert_eq!(read.error_kind, ProviderErrorKind::Timeout);
        assert_eq!(read.context_method, Some(ContextMethod::Llm));
        assert_eq!(read.context_tokens, Some(240));
        assert!(read.success);
        assert_eq!(read.duration_ms, 1_200);
    }

    #[test]
    fn test_retry_entry_has_no_context_fields() {
        let log = SqliteFallbackLog::in_memory().unwrap();
        log.append(&retry_entry("task-1", false, 300)).unwrap();

        let read = &log.by_task("task-1", None).unwrap()[0];
        assert!(read.context_method.is_none());
        assert!(read.context_tokens.is_none());
        assert_eq!(read.to_model, read.from_model);
    }

    #[test]
    fn test_by_task_filters_and_orders() {
        let log = SqliteFallbackLog::in_memory().unwrap();
        log.append(&retry_entry("task-1", false, 100)).unwrap();
        log.append(&retry_entry("task-2", true, 100)).unwrap();
        log.append(&retry_entry("task-1", true, 100)).unwrap();

        let entries = log.by_task("task-1", None).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].success);
        assert!(entries[1].success);
    }

    #[test]
    fn test_in_range() {
        let log = SqliteFallbackLog::in_memory().unwrap();
        log.append(&retry_entry("task-1", true, 100)).unwrap();

        let now = Utc::now();
        let hour = chrono::Duration::hours(1);

        assert_eq!(log.in_range(now - hour, now + hour, None).unwrap().len(), 1);
        assert!(log
            .in_range(now + hour, now + hour + hour, None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_stats() {
        let log = SqliteFallbackLog::in_memory().unwrap();

        let empty = log.stats().unwrap();
        assert_eq!(empty.total_events, 0);
        assert_eq!(empty.success_rate, 0.0);
        assert_eq!(empty.avg_duration_ms, 0.0);

        log.append(&retry_entry("task-1", true, 100)).unwrap();
        log.append(&retry_entry("task-1", true, 300)).unwrap();
        log.append(&retry_entry("task-2", false, 200)).unwrap();

        let stats = log.stats().unwrap();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.successful_events, 2);
        assert_eq!(stats.failed_events, 1);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((stats.avg_duration_ms - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_clear() {
        let log = SqliteFallbackLog::in_memory().unwrap();
        log.append(&retry_entry("task-1", true, 100)).unwrap();
        log.append(&retry_entry("task-2", false, 100)).unwrap();

        assert_eq!(log.clear().unwrap(), 2);
        assert_eq!(log.stats().unwrap().total_events, 0);
    }

    #[test]
    fn test_open_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fallback.db");

        {
            let log = SqliteFallbackLog::open(&path).unwrap();
            log.append(&retry_entry("task-1", true, 100)).unwrap();
        }

        let log = SqliteFallbackLog::open(&path).unwrap();
        assert_eq!(log.by_task("task-1", None).unwrap().len(), 1);
    }
}
