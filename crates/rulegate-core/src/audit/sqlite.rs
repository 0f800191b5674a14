//! SQLite audit sink (WAL mode)
//!
//! Records are stored whole as JSON next to the columns used for lookup.
//! Rows are keyed by the record id, not the caller-supplied request id, so a
//! retried request gets its own row. Appends use `INSERT OR IGNORE` on that
//! key, so re-driving a record that already landed is harmless.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;

use super::{AuditRecord, AuditSink};
use crate::error::AuditError;
use crate::types::TimeWindow;

pub struct SqliteAuditSink {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAuditSink {
    /// Open (or create) the database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        let sink = Self::from_connection(conn)?;
        tracing::info!("SQLite audit sink opened at {}", path.display());
        Ok(sink)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self, AuditError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, AuditError> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn count(&self) -> Result<usize, AuditError> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM audit_records", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn migrate(conn: &Connection) -> Result<(), AuditError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS audit_records (
            record_id     TEXT PRIMARY KEY,
            request_id    TEXT NOT NULL,
            subject_id    TEXT NOT NULL,
            project_id    TEXT,
            handler_id    TEXT NOT NULL,
            action        TEXT NOT NULL,
            success       INTEGER NOT NULL,
            error_kind    TEXT,
            timestamp_ms  INTEGER NOT NULL,
            record_json   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_subject_time
            ON audit_records(subject_id, timestamp_ms);

        CREATE INDEX IF NOT EXISTS idx_audit_request
            ON audit_records(request_id);
        ",
    )?;
    Ok(())
}

#[async_trait]
impl AuditSink for SqliteAuditSink {
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let record_json = serde_json::to_string(record)?;
        let record = record.clone();
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || -> Result<(), AuditError> {
            let conn = conn.lock();
            conn.execute(
                "INSERT OR IGNORE INTO audit_records
                 (record_id, request_id, subject_id, project_id, handler_id, action,
                  success, error_kind, timestamp_ms, record_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.record_id,
                    record.request_id,
                    record.subject_id,
                    record.project_id,
                    record.handler_id,
                    record.action,
                    record.success,
                    record.error_kind.map(|k| k.as_str()),
                    record.timestamp.timestamp_millis(),
                    record_json,
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| AuditError::WriteFailed(e.to_string()))?
    }

    async fn query(
        &self,
        subject_id: &str,
        window: &TimeWindow,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        let subject_id = subject_id.to_string();
        let start = window.start.timestamp_millis();
        let end = window.end.timestamp_millis();
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || -> Result<Vec<AuditRecord>, AuditError> {
            let conn = conn.lock();
            let mut stmt = conn.prepare(
                "SELECT record_json FROM audit_records
                 WHERE subject_id = ?1 AND timestamp_ms BETWEEN ?2 AND ?3
                 ORDER BY timestamp_ms ASC, rowid ASC",
            )?;
            let rows = stmt.query_map(params![subject_id, start, end], |row| {
                row.get::<_, String>(0)
            })?;

            let mut records = Vec::new();
            for row in rows {
                let record: AuditRecord = serde_json::from_str(&row?)?;
                records.push(record);
            }
            Ok(records)
        })
        .await
        .map_err(|e| AuditError::QueryFailed(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::tests::record;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_append_and_query() {
        let sink = SqliteAuditSink::open_in_memory().unwrap();

        let mut blocked = record("r2", "alice");
        blocked.success = false;
        blocked.error_kind = Some(ErrorKind::PolicyViolation);

        sink.append(&record("r1", "alice")).await.unwrap();
        sink.append(&blocked).await.unwrap();
        sink.append(&record("r3", "bob")).await.unwrap();

        let records = sink.query("alice", &TimeWindow::all()).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1], blocked);
    }

    #[tokio::test]
    async fn test_duplicate_append_ignored() {
        let sink = SqliteAuditSink::open_in_memory().unwrap();
        let entry = record("r1", "alice");
        sink.append(&entry).await.unwrap();
        sink.append(&entry).await.unwrap();
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_repeated_request_id_keeps_every_record() {
        let sink = SqliteAuditSink::open_in_memory().unwrap();
        for _ in 0..3 {
            sink.append(&record("retry-1", "alice")).await.unwrap();
        }

        assert_eq!(sink.count().unwrap(), 3);
        let records = sink.query("alice", &TimeWindow::all()).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.request_id == "retry-1"));
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db/audit.db");

        {
            let sink = SqliteAuditSink::open(&path).unwrap();
            sink.append(&record("r1", "alice")).await.unwrap();
        }

        let sink = SqliteAuditSink::open(&path).unwrap();
        let records = sink
            .query("alice", &TimeWindow::last(chrono::Duration::hours(1)))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }
}
