// 🗄️ Reconciliation State Store - Persisted matched-pair tracking
// Keyed by a SHA-256 of the source id; re-recording the identical
// pair is a no-op, which is what makes crashed runs safe to re-run.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};

use crate::error::StateStoreError;
use crate::model::{source_key, ReconciliationRecord};

// ============================================================================
// STORE INTERFACE
// ============================================================================

/// Persisted record of which (source, ledger) pairs have already been
/// matched. The engine depends only on this interface; flat file,
/// object storage or an embedded KV store all satisfy it.
pub trait ReconciliationStateStore: Send {
    /// Has this source record already been assigned to a ledger entry?
    fn has_matched(&self, source_id: &str) -> Result<bool, StateStoreError>;

    /// Has this ledger entry already been assigned a source record?
    fn is_ledger_matched(&self, ledger_id: &str) -> Result<bool, StateStoreError>;

    /// Record a confirmed match. Idempotent: re-recording the
    /// identical pair is a no-op, not an error.
    fn record_match(
        &self,
        source_id: &str,
        ledger_id: &str,
        score: u8,
    ) -> Result<(), StateStoreError>;

    /// The records that survive a prune at the given retention window,
    /// without deleting anything.
    fn pruned_view(
        &self,
        older_than_days: i64,
    ) -> Result<Vec<ReconciliationRecord>, StateStoreError>;

    /// Delete records older than the retention window. Returns how
    /// many were removed.
    fn prune(&self, older_than_days: i64) -> Result<usize, StateStoreError>;
}

fn retention_cutoff(older_than_days: i64) -> DateTime<Utc> {
    Utc::now() - Duration::days(older_than_days)
}

// ============================================================================
// SQLITE-BACKED STORE
// ============================================================================

/// SQLite-backed store with WAL mode for crash recovery.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    pub fn open(path: &Path) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening state store at {}", path.display()))
            .map_err(|e| StateStoreError::Unavailable(e.to_string()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()
            .context("opening in-memory state store")
            .map_err(|e| StateStoreError::Unavailable(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StateStoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL mode")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS reconciliation_records (
                source_key TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                ledger_id TEXT UNIQUE NOT NULL,
                matched_at TEXT NOT NULL,
                score INTEGER NOT NULL
            )",
            [],
        )
        .context("creating reconciliation_records table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_matched_at
             ON reconciliation_records(matched_at)",
            [],
        )
        .context("creating matched_at index")?;

        Ok(SqliteStateStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means another store call panicked; the
        // connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ReconciliationStateStore for SqliteStateStore {
    fn has_matched(&self, source_id: &str) -> Result<bool, StateStoreError> {
        let conn = self.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM reconciliation_records WHERE source_key = ?1",
                params![source_key(source_id)],
                |row| row.get(0),
            )
            .context("querying source key")?;
        Ok(count > 0)
    }

    fn is_ledger_matched(&self, ledger_id: &str) -> Result<bool, StateStoreError> {
        let conn = self.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM reconciliation_records WHERE ledger_id = ?1",
                params![ledger_id],
                |row| row.get(0),
            )
            .context("querying ledger id")?;
        Ok(count > 0)
    }

    fn record_match(
        &self,
        source_id: &str,
        ledger_id: &str,
        score: u8,
    ) -> Result<(), StateStoreError> {
        let conn = self.lock();
        // INSERT OR IGNORE keyed on the source hash: recording the
        // same pair twice leaves the original row untouched.
        conn.execute(
            "INSERT OR IGNORE INTO reconciliation_records
             (source_key, source_id, ledger_id, matched_at, score)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                source_key(source_id),
                source_id,
                ledger_id,
                Utc::now().to_rfc3339(),
                score as i64
            ],
        )
        .context("inserting reconciliation record")?;
        Ok(())
    }

    fn pruned_view(
        &self,
        older_than_days: i64,
    ) -> Result<Vec<ReconciliationRecord>, StateStoreError> {
        let cutoff = retention_cutoff(older_than_days).to_rfc3339();
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT source_id, ledger_id, matched_at, score
                 FROM reconciliation_records
                 WHERE matched_at >= ?1
                 ORDER BY matched_at",
            )
            .context("preparing pruned view query")?;

        let rows = stmt
            .query_map(params![cutoff], |row| {
                let matched_at: String = row.get(2)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    matched_at,
                    row.get::<_, i64>(3)?,
                ))
            })
            .context("querying pruned view")?;

        let mut records = Vec::new();
        for row in rows {
            let (source_id, ledger_id, matched_at, score) = row.context("reading record row")?;
            let matched_at = DateTime::parse_from_rfc3339(&matched_at)
                .context("parsing matched_at timestamp")?
                .with_timezone(&Utc);
            records.push(ReconciliationRecord {
                source_id,
                ledger_id,
                matched_at,
                score: score as u8,
            });
        }
        Ok(records)
    }

    fn prune(&self, older_than_days: i64) -> Result<usize, StateStoreError> {
        let cutoff = retention_cutoff(older_than_days).to_rfc3339();
        let conn = self.lock();
        let removed = conn
            .execute(
                "DELETE FROM reconciliation_records WHERE matched_at < ?1",
                params![cutoff],
            )
            .context("pruning reconciliation records")?;
        Ok(removed)
    }
}

// ============================================================================
// IN-MEMORY STORE (test double + stateless degraded mode)
// ============================================================================

/// In-memory store. Backs tests, and the degraded stateless mode the
/// orchestrator switches to when the real store is unreachable.
#[derive(Default)]
pub struct MemoryStateStore {
    records: Mutex<HashMap<String, ReconciliationRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReconciliationStateStore for MemoryStateStore {
    fn has_matched(&self, source_id: &str) -> Result<bool, StateStoreError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.contains_key(&source_key(source_id)))
    }

    fn is_ledger_matched(&self, ledger_id: &str) -> Result<bool, StateStoreError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.values().any(|r| r.ledger_id == ledger_id))
    }

    fn record_match(
        &self,
        source_id: &str,
        ledger_id: &str,
        score: u8,
    ) -> Result<(), StateStoreError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .entry(source_key(source_id))
            .or_insert_with(|| ReconciliationRecord {
                source_id: source_id.to_string(),
                ledger_id: ledger_id.to_string(),
                matched_at: Utc::now(),
                score,
            });
        Ok(())
    }

    fn pruned_view(
        &self,
        older_than_days: i64,
    ) -> Result<Vec<ReconciliationRecord>, StateStoreError> {
        let cutoff = retention_cutoff(older_than_days);
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut view: Vec<ReconciliationRecord> = records
            .values()
            .filter(|r| r.matched_at >= cutoff)
            .cloned()
            .collect();
        view.sort_by(|a, b| a.matched_at.cmp(&b.matched_at));
        Ok(view)
    }

    fn prune(&self, older_than_days: i64) -> Result<usize, StateStoreError> {
        let cutoff = retention_cutoff(older_than_days);
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let before = records.len();
        records.retain(|_, r| r.matched_at >= cutoff);
        Ok(before - records.len())
    }
}

// ============================================================================
// UNAVAILABLE STORE
// ============================================================================

/// Stand-in for a backing store that could not be opened. Every call
/// errors, which the orchestrator's run-start probe turns into a
/// degraded stateless run.
pub struct UnavailableStateStore {
    detail: String,
}

impl UnavailableStateStore {
    pub fn new(detail: impl Into<String>) -> Self {
        UnavailableStateStore {
            detail: detail.into(),
        }
    }

    fn err(&self) -> StateStoreError {
        StateStoreError::Unavailable(self.detail.clone())
    }
}

impl ReconciliationStateStore for UnavailableStateStore {
    fn has_matched(&self, _source_id: &str) -> Result<bool, StateStoreError> {
        Err(self.err())
    }

    fn is_ledger_matched(&self, _ledger_id: &str) -> Result<bool, StateStoreError> {
        Err(self.err())
    }

    fn record_match(
        &self,
        _source_id: &str,
        _ledger_id: &str,
        _score: u8,
    ) -> Result<(), StateStoreError> {
        Err(self.err())
    }

    fn pruned_view(
        &self,
        _older_than_days: i64,
    ) -> Result<Vec<ReconciliationRecord>, StateStoreError> {
        Err(self.err())
    }

    fn prune(&self, _older_than_days: i64) -> Result<usize, StateStoreError> {
        Err(self.err())
    }
}

/// Open the SQLite store, falling back to an always-erroring stand-in
/// the orchestrator will degrade around. Never panics, never loses
/// ledger data.
pub fn open_state_store(path: &Path) -> Box<dyn ReconciliationStateStore> {
    match SqliteStateStore::open(path) {
        Ok(store) => Box::new(store),
        Err(err) => Box::new(UnavailableStateStore::new(err.to_string())),
    }
}

// ============================================================================
// TESTS
// ============================================================================
