//! `SQLite` backing store for the overflow queue: schema, pragmas, and migrations.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::embedding::queue::{ItemStatus, QueueItem, QueueResult, QueueStats, QueueStore};
use crate::worker::error::QueueError;

const SCHEMA_VERSION: i64 = 2;

const MIGRATION_V1: &str = r"
CREATE TABLE IF NOT EXISTS overflow_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    text TEXT NOT NULL,
    text_hash TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    enqueued_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_overflow_status ON overflow_queue(status, id);
";

const MIGRATION_V2: &str = r"
ALTER TABLE overflow_queue ADD COLUMN last_error TEXT;
ALTER TABLE overflow_queue ADD COLUMN result_bin BLOB;
ALTER TABLE overflow_queue ADD COLUMN updated_at INTEGER NOT NULL DEFAULT 0;
CREATE INDEX IF NOT EXISTS idx_overflow_hash ON overflow_queue(text_hash, status);
";

/// Durable FIFO of embedding requests, one database per project.
pub struct SqliteQueueStore {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteQueueStore")
            .field("path", &self.path)
            .finish()
    }
}

impl SqliteQueueStore {
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let start = Instant::now();
        let mut conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        init_meta(&conn)?;
        migrate(&mut conn)?;
        info!(
            path = %path.display(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Opened overflow queue database"
        );
        Ok(Self {
            path: Some(path.to_path_buf()),
            conn: Mutex::new(conn),
        })
    }

    /// Non-durable store, for tests and callers that opt out of persistence.
    pub fn open_in_memory() -> Result<Self, QueueError> {
        let mut conn = Connection::open_in_memory()?;
        init_meta(&conn)?;
        migrate(&mut conn)?;
        Ok(Self {
            path: None,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn apply_pragmas(conn: &Connection) -> Result<(), QueueError> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(
        r"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA temp_store = MEMORY;
        ",
    )?;
    Ok(())
}

fn init_meta(conn: &Connection) -> Result<(), QueueError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES('schema_version', '0')",
        [],
    )?;
    Ok(())
}

fn migrate(conn: &mut Connection) -> Result<(), QueueError> {
    let current: i64 = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0).map(|s| s.parse().unwrap_or(0)),
        )
        .optional()?
        .unwrap_or(0);
    if current == SCHEMA_VERSION {
        return Ok(());
    }
    if current > SCHEMA_VERSION {
        return Err(QueueError::Encoding(format!(
            "queue schema version {current} is newer than supported version {SCHEMA_VERSION}"
        )));
    }

    let tx = conn.transaction()?;
    if current < 1 {
        tx.execute_batch(MIGRATION_V1)?;
    }
    if current < 2 {
        tx.execute_batch(MIGRATION_V2)?;
    }
    tx.execute(
        "UPDATE meta SET value = ? WHERE key = 'schema_version'",
        params![SCHEMA_VERSION.to_string()],
    )?;
    tx.commit()?;
    debug!(from = current, to = SCHEMA_VERSION, "Migrated overflow queue schema");
    Ok(())
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Hex SHA-256 of the text, used to coalesce identical pending requests.
pub fn text_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn encode_vector(vector: &[f64]) -> Result<Vec<u8>, QueueError> {
    rmp_serde::to_vec(vector).map_err(|e| QueueError::Encoding(e.to_string()))
}

fn decode_vector(bytes: &[u8]) -> Result<Vec<f64>, QueueError> {
    rmp_serde::from_slice(bytes).map_err(|e| QueueError::Encoding(e.to_string()))
}

impl QueueStore for SqliteQueueStore {
    fn push(&self, text: &str) -> Result<(i64, bool), QueueError> {
        let hash = text_hash(text);
        let conn = self.conn.lock();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM overflow_queue WHERE text_hash = ? AND status = 'pending' ORDER BY id LIMIT 1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok((id, false));
        }
        let now = now_ms();
        conn.execute(
            "INSERT INTO overflow_queue(text, text_hash, status, attempts, enqueued_at, updated_at)
             VALUES(?, ?, 'pending', 0, ?, ?)",
            params![text, hash, now, now],
        )?;
        Ok((conn.last_insert_rowid(), true))
    }

    fn next_pending(&self) -> Result<Option<QueueItem>, QueueError> {
        let conn = self.conn.lock();
        let item = conn
            .query_row(
                "SELECT id, text, enqueued_at, attempts FROM overflow_queue
                 WHERE status = 'pending' ORDER BY id LIMIT 1",
                [],
                |row| {
                    Ok(QueueItem {
                        id: row.get(0)?,
                        text: row.get(1)?,
                        enqueued_at_ms: row.get(2)?,
                        attempts: row.get::<_, i64>(3)? as u32,
                    })
                },
            )
            .optional()?;
        Ok(item)
    }

    fn complete(&self, id: i64, vector: &[f64]) -> Result<(), QueueError> {
        let blob = encode_vector(vector)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE overflow_queue SET status = 'completed', result_bin = ?, last_error = NULL, updated_at = ?
             WHERE id = ?",
            params![blob, now_ms(), id],
        )?;
        if changed == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    fn record_failure(&self, id: i64, error: &str, max_attempts: u32) -> Result<ItemStatus, QueueError> {
        let conn = self.conn.lock();
        let attempts: Option<i64> = conn
            .query_row(
                "SELECT attempts FROM overflow_queue WHERE id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(attempts) = attempts else {
            return Err(QueueError::NotFound(id));
        };
        let attempts = attempts + 1;
        let status = if attempts >= i64::from(max_attempts) {
            ItemStatus::Failed
        } else {
            ItemStatus::Pending
        };
        conn.execute(
            "UPDATE overflow_queue SET attempts = ?, status = ?, last_error = ?, updated_at = ? WHERE id = ?",
            params![attempts, status.as_str(), error, now_ms(), id],
        )?;
        Ok(status)
    }

    fn result(&self, id: i64) -> Result<Option<QueueResult>, QueueError> {
        let conn = self.conn.lock();
        let row: Option<(String, i64, Option<String>, Option<Vec<u8>>)> = conn
            .query_row(
                "SELECT status, attempts, last_error, result_bin FROM overflow_queue WHERE id = ?",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((status, attempts, last_error, blob)) = row else {
            return Ok(None);
        };
        let status = ItemStatus::parse(&status)
            .ok_or_else(|| QueueError::Encoding(format!("unknown queue status {status:?}")))?;
        let vector = match (status, blob) {
            (ItemStatus::Completed, Some(bytes)) => Some(decode_vector(&bytes)?),
            _ => None,
        };
        Ok(Some(QueueResult {
            id,
            status,
            attempts: attempts as u32,
            last_error,
            vector,
        }))
    }

    fn pending_count(&self) -> Result<usize, QueueError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM overflow_queue WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn stats(&self) -> Result<QueueStats, QueueError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM overflow_queue GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) = row?;
            let count = count as usize;
            match ItemStatus::parse(&status) {
                Some(ItemStatus::Pending) => stats.pending = count,
                Some(ItemStatus::Completed) => stats.completed = count,
                Some(ItemStatus::Failed) => stats.failed = count,
                None => debug!(status = %status, count, "Ignoring unknown queue status"),
            }
        }
        Ok(stats)
    }

    fn cleanup_finished(&self, older_than: Duration) -> Result<usize, QueueError> {
        let age_ms = i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms().saturating_sub(age_ms);
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM overflow_queue WHERE status IN ('completed', 'failed') AND updated_at <= ?",
            params![cutoff],
        )?;
        if removed > 0 {
            info!(removed, "Removed finished overflow queue items");
        }
        Ok(removed)
    }
}
