//! Write transactions for the SQLite backend.

use async_trait::async_trait;
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{OptionalExtension, params};
use serde_json::Value;

use crate::audit::AuditLogEntry;
use crate::clock;
use crate::error::{GuardError, GuardResult, ResourceError, TransactionError};
use crate::store::{Record, RecordTransaction};
use crate::tenant::TenantId;

use super::audit::insert_outbox;
use super::backend::{internal_error, serialization_error};
use super::records::{RECORD_COLUMNS, RawRecord};

/// A SQLite write transaction.
///
/// Opened with `BEGIN IMMEDIATE`, so it holds the database write lock from
/// the start. Dropping an uncommitted transaction rolls it back.
pub struct SqliteRecordTransaction {
    conn: PooledConnection<SqliteConnectionManager>,
    active: bool,
    tenant_id: TenantId,
}

impl std::fmt::Debug for SqliteRecordTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRecordTransaction")
            .field("active", &self.active)
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

impl SqliteRecordTransaction {
    pub(crate) fn new(
        conn: PooledConnection<SqliteConnectionManager>,
        tenant_id: TenantId,
    ) -> GuardResult<Self> {
        conn.execute("BEGIN IMMEDIATE", []).map_err(|e| {
            GuardError::Transaction(TransactionError::RolledBack {
                reason: format!("Failed to begin transaction: {}", e),
            })
        })?;

        Ok(Self {
            conn,
            active: true,
            tenant_id,
        })
    }

    fn ensure_active(&self) -> GuardResult<()> {
        if self.active {
            Ok(())
        } else {
            Err(GuardError::Transaction(TransactionError::InvalidTransaction))
        }
    }
}

#[async_trait]
impl RecordTransaction for SqliteRecordTransaction {
    async fn lock_record(&mut self, table: &str, id: &str) -> GuardResult<Option<Record>> {
        self.ensure_active()?;

        let raw = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM records WHERE table_name = ?1 AND id = ?2",
                    RECORD_COLUMNS
                ),
                params![table, id],
                RawRecord::from_row,
            )
            .optional()
            .map_err(|e| internal_error(format!("Failed to read record: {}", e)))?;

        raw.map(RawRecord::into_record).transpose()
    }

    async fn insert(&mut self, table: &str, id: &str, data: Value) -> GuardResult<Record> {
        self.ensure_active()?;

        let data_text = serde_json::to_string(&data)
            .map_err(|e| serialization_error(format!("Failed to serialize record: {}", e)))?;
        let now = clock::now();
        let stamp = clock::format_timestamp(&now);

        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO records (table_name, id, tenant_id, data, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
                params![table, id, self.tenant_id.as_str(), data_text, stamp],
            )
            .map_err(|e| internal_error(format!("Failed to insert record: {}", e)))?;

        if inserted == 0 {
            return Err(ResourceError::AlreadyExists {
                table: table.to_string(),
                id: id.to_string(),
            }
            .into());
        }

        Ok(Record {
            table: table.to_string(),
            id: id.to_string(),
            tenant_id: self.tenant_id.clone(),
            data,
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    async fn update(&mut self, current: &Record, data: Value) -> GuardResult<Record> {
        self.ensure_active()?;

        let data_text = serde_json::to_string(&data)
            .map_err(|e| serialization_error(format!("Failed to serialize record: {}", e)))?;
        let now = clock::now();
        let version = current.version + 1;

        let changed = self
            .conn
            .execute(
                "UPDATE records SET data = ?1, version = ?2, updated_at = ?3
                 WHERE table_name = ?4 AND id = ?5 AND tenant_id = ?6 AND version = ?7",
                params![
                    data_text,
                    version,
                    clock::format_timestamp(&now),
                    current.table,
                    current.id,
                    self.tenant_id.as_str(),
                    current.version
                ],
            )
            .map_err(|e| internal_error(format!("Failed to update record: {}", e)))?;

        if changed == 0 {
            return Err(ResourceError::NotFound {
                table: current.table.clone(),
                id: current.id.clone(),
            }
            .into());
        }

        Ok(Record {
            data,
            version,
            updated_at: now,
            ..current.clone()
        })
    }

    async fn delete(&mut self, current: &Record) -> GuardResult<()> {
        self.ensure_active()?;

        let deleted = self
            .conn
            .execute(
                "DELETE FROM records WHERE table_name = ?1 AND id = ?2 AND tenant_id = ?3",
                params![current.table, current.id, self.tenant_id.as_str()],
            )
            .map_err(|e| internal_error(format!("Failed to delete record: {}", e)))?;

        if deleted == 0 {
            return Err(ResourceError::NotFound {
                table: current.table.clone(),
                id: current.id.clone(),
            }
            .into());
        }

        Ok(())
    }

    async fn enqueue_audit(&mut self, entry: &AuditLogEntry) -> GuardResult<()> {
        self.ensure_active()?;

        self.conn
            .execute_batch("SAVEPOINT audit_enqueue")
            .map_err(|e| internal_error(format!("Failed to open audit savepoint: {}", e)))?;

        match insert_outbox(&self.conn, entry) {
            Ok(()) => self.conn.execute_batch("RELEASE audit_enqueue").map_err(|e| {
                internal_error(format!("Failed to release audit savepoint: {}", e))
            }),
            Err(e) => {
                self.conn
                    .execute_batch("ROLLBACK TO audit_enqueue; RELEASE audit_enqueue")
                    .map_err(|e| {
                        internal_error(format!("Failed to roll back audit savepoint: {}", e))
                    })?;
                Err(e)
            }
        }
    }

    async fn commit(mut self: Box<Self>) -> GuardResult<()> {
        self.ensure_active()?;

        self.conn.execute("COMMIT", []).map_err(|e| {
            GuardError::Transaction(TransactionError::RolledBack {
                reason: format!("Commit failed: {}", e),
            })
        })?;
        self.active = false;

        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> GuardResult<()> {
        self.ensure_active()?;

        self.active = false;
        self.conn.execute("ROLLBACK", []).map_err(|e| {
            GuardError::Transaction(TransactionError::RolledBack {
                reason: format!("Rollback failed: {}", e),
            })
        })?;

        Ok(())
    }
}

impl Drop for SqliteRecordTransaction {
    fn drop(&mut self) {
        if self.active {
            let _ = self.conn.execute("ROLLBACK", []);
        }
    }
}
