//! Persistent dedup ledger — the set of message ids already handled.
//!
//! Backed by a local libsql database. Entries are written once and never
//! updated or deleted; `record` is an atomic insert-if-absent so the same
//! identity landing twice (overlapping batches, concurrent writers) is
//! treated as already-recorded rather than an error.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use libsql::{Connection, Database, params};
use tracing::{debug, info};

use crate::error::LedgerError;

pub struct Ledger {
    #[allow(dead_code)]
    db: Arc<Database>,
    conn: Connection,
}

impl Ledger {
    /// Open (or create) the ledger at the given path and ensure the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                LedgerError::Open(format!("Failed to create ledger directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| LedgerError::Open(format!("Failed to open ledger database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| LedgerError::Open(format!("Failed to create connection: {e}")))?;

        let ledger = Self {
            db: Arc::new(db),
            conn,
        };
        ledger.init_schema().await?;
        info!(path = %path.display(), "Ledger opened");
        Ok(ledger)
    }

    /// Create an in-memory ledger (for tests).
    pub async fn open_in_memory() -> Result<Self, LedgerError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| LedgerError::Open(format!("Failed to create in-memory ledger: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| LedgerError::Open(format!("Failed to create connection: {e}")))?;

        let ledger = Self {
            db: Arc::new(db),
            conn,
        };
        ledger.init_schema().await?;
        Ok(ledger)
    }

    async fn init_schema(&self) -> Result<(), LedgerError> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS processed_messages (
                    message_id   TEXT PRIMARY KEY,
                    processed_at TEXT NOT NULL
                )",
                (),
            )
            .await
            .map_err(|e| LedgerError::Query(format!("init_schema: {e}")))?;
        Ok(())
    }

    /// Whether this message id has already been handled.
    pub async fn contains(&self, message_id: &str) -> Result<bool, LedgerError> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM processed_messages WHERE message_id = ?1 LIMIT 1",
                params![message_id],
            )
            .await
            .map_err(|e| LedgerError::Query(format!("contains: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| LedgerError::Query(format!("contains: {e}")))?;
        Ok(row.is_some())
    }

    /// Record a message id. Recording an already-present id is a no-op.
    pub async fn record(&self, message_id: &str) -> Result<(), LedgerError> {
        let affected = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO processed_messages (message_id, processed_at)
                 VALUES (?1, ?2)",
                params![message_id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| LedgerError::Query(format!("record: {e}")))?;

        if affected == 0 {
            debug!(message_id = %message_id, "Message already recorded");
        } else {
            debug!(message_id = %message_id, "Message recorded");
        }
        Ok(())
    }

    /// True iff no entries exist. Checked once at startup to detect first run.
    pub async fn is_empty(&self) -> Result<bool, LedgerError> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM processed_messages", ())
            .await
            .map_err(|e| LedgerError::Query(format!("is_empty: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| LedgerError::Query(format!("is_empty: {e}")))?
            .ok_or_else(|| LedgerError::Query("is_empty: no count row".to_string()))?;

        let count: i64 = row
            .get(0)
            .map_err(|e| LedgerError::Query(format!("is_empty: {e}")))?;
        Ok(count == 0)
    }
}
