//! Audit outbox and audit log for SQLite.

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, Row, TransactionBehavior, params, params_from_iter};
use uuid::Uuid;

use crate::audit::{
    AuditAction, AuditFilter, AuditLogEntry, AuditOutcome, AuditRecord, AuditStore, QueuedEntry,
};
use crate::clock;
use crate::error::{AuditError, GuardResult};
use crate::tenant::{TenantId, UserId};

use super::SqliteBackend;
use super::backend::{internal_error, serialization_error};

/// Queues an entry in the outbox on an open connection or transaction.
///
/// Queuing an entry id that is already queued is a no-op.
pub(crate) fn insert_outbox(conn: &Connection, entry: &AuditLogEntry) -> GuardResult<()> {
    let payload = serde_json::to_string(entry)
        .map_err(|e| serialization_error(format!("Failed to serialize audit entry: {}", e)))?;

    conn.execute(
        "INSERT OR IGNORE INTO audit_outbox (entry_id, payload, enqueued_at) VALUES (?1, ?2, ?3)",
        params![
            entry.id.to_string(),
            payload,
            clock::format_timestamp(&clock::now())
        ],
    )
    .map_err(|e| internal_error(format!("Failed to enqueue audit entry: {}", e)))?;

    Ok(())
}

fn optional_json(value: &Option<serde_json::Value>) -> GuardResult<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| serialization_error(format!("Failed to serialize audit values: {}", e)))
}

const LOG_COLUMNS: &str = "sequence, id, table_name, action, record_id, old_values, new_values, \
     actor_id, tenant_id, outcome, created_at, request_metadata";

/// An `audit_log` row before decoding.
struct RawLogRow {
    sequence: i64,
    id: String,
    table_name: String,
    action: String,
    record_id: Option<String>,
    old_values: Option<String>,
    new_values: Option<String>,
    actor_id: String,
    tenant_id: String,
    outcome: String,
    created_at: String,
    request_metadata: String,
}

impl RawLogRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sequence: row.get(0)?,
            id: row.get(1)?,
            table_name: row.get(2)?,
            action: row.get(3)?,
            record_id: row.get(4)?,
            old_values: row.get(5)?,
            new_values: row.get(6)?,
            actor_id: row.get(7)?,
            tenant_id: row.get(8)?,
            outcome: row.get(9)?,
            created_at: row.get(10)?,
            request_metadata: row.get(11)?,
        })
    }

    fn into_record(self) -> GuardResult<AuditRecord> {
        let malformed = |message: String| AuditError::Malformed { message };

        let id = Uuid::parse_str(&self.id)
            .map_err(|e| malformed(format!("entry id {}: {}", self.id, e)))?;
        let action = AuditAction::parse(&self.action)
            .ok_or_else(|| malformed(format!("unknown action {}", self.action)))?;
        let outcome = AuditOutcome::parse(&self.outcome)
            .ok_or_else(|| malformed(format!("unknown outcome {}", self.outcome)))?;
        let created_at = clock::parse_timestamp(&self.created_at)
            .map_err(|e| malformed(format!("created_at {}: {}", self.created_at, e)))?;

        let parse_json = |text: Option<String>| {
            text.map(|t| serde_json::from_str(&t))
                .transpose()
                .map_err(|e| serialization_error(format!("Invalid audit values: {}", e)))
        };
        let old_values = parse_json(self.old_values)?;
        let new_values = parse_json(self.new_values)?;
        let request_metadata = serde_json::from_str(&self.request_metadata)
            .map_err(|e| serialization_error(format!("Invalid request metadata: {}", e)))?;

        Ok(AuditRecord {
            sequence: self.sequence,
            entry: AuditLogEntry {
                id,
                table_name: self.table_name,
                action,
                record_id: self.record_id,
                actor_id: UserId::new(self.actor_id),
                tenant_id: TenantId::new(self.tenant_id),
                old_values,
                new_values,
                outcome,
                created_at,
                request_metadata,
            },
        })
    }
}

#[async_trait]
impl AuditStore for SqliteBackend {
    async fn enqueue(&self, entry: &AuditLogEntry) -> GuardResult<()> {
        let conn = self.get_connection()?;
        insert_outbox(&conn, entry)
    }

    async fn pending(&self, limit: usize) -> GuardResult<Vec<QueuedEntry>> {
        let conn = self.get_connection()?;

        let mut stmt = conn
            .prepare("SELECT outbox_id, payload FROM audit_outbox ORDER BY outbox_id LIMIT ?1")
            .map_err(|e| internal_error(format!("Failed to prepare outbox query: {}", e)))?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| internal_error(format!("Failed to query outbox: {}", e)))?;

        let mut queued = Vec::new();
        for row in rows {
            let (outbox_id, payload) =
                row.map_err(|e| internal_error(format!("Failed to read outbox row: {}", e)))?;
            let entry = serde_json::from_str(&payload).map_err(|e| AuditError::Malformed {
                message: format!("outbox row {}: {}", outbox_id, e),
            })?;
            queued.push(QueuedEntry { outbox_id, entry });
        }

        Ok(queued)
    }

    async fn pending_count(&self) -> GuardResult<u64> {
        let conn = self.get_connection()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM audit_outbox", [], |row| row.get(0))
            .map_err(|e| internal_error(format!("Failed to count outbox: {}", e)))?;
        Ok(count as u64)
    }

    async fn deliver(&self, queued: &QueuedEntry) -> GuardResult<bool> {
        let entry = &queued.entry;
        let old_values = optional_json(&entry.old_values)?;
        let new_values = optional_json(&entry.new_values)?;
        let metadata = serde_json::to_string(&entry.request_metadata)
            .map_err(|e| serialization_error(format!("Failed to serialize metadata: {}", e)))?;

        let mut conn = self.get_connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| internal_error(format!("Failed to begin delivery: {}", e)))?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO audit_log
                    (id, table_name, action, record_id, old_values, new_values,
                     actor_id, tenant_id, outcome, created_at, request_metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    entry.id.to_string(),
                    entry.table_name,
                    entry.action.as_str(),
                    entry.record_id,
                    old_values,
                    new_values,
                    entry.actor_id.as_str(),
                    entry.tenant_id.as_str(),
                    entry.outcome.as_str(),
                    clock::format_timestamp(&entry.created_at),
                    metadata
                ],
            )
            .map_err(|e| internal_error(format!("Failed to append audit entry: {}", e)))?;

        tx.execute(
            "DELETE FROM audit_outbox WHERE outbox_id = ?1",
            [queued.outbox_id],
        )
        .map_err(|e| internal_error(format!("Failed to clear outbox row: {}", e)))?;

        tx.commit()
            .map_err(|e| internal_error(format!("Failed to commit delivery: {}", e)))?;

        Ok(inserted > 0)
    }

    async fn entries(
        &self,
        filter: &AuditFilter,
        after_sequence: i64,
        limit: usize,
    ) -> GuardResult<Vec<AuditRecord>> {
        let mut sql = format!("SELECT {} FROM audit_log WHERE sequence > ?1", LOG_COLUMNS);
        let mut values = vec![SqlValue::Integer(after_sequence)];

        let mut push = |sql: &mut String, column: &str, op: &str, value: SqlValue| {
            values.push(value);
            sql.push_str(&format!(" AND {} {} ?{}", column, op, values.len()));
        };

        if let Some(tenant_id) = &filter.tenant_id {
            push(&mut sql, "tenant_id", "=", SqlValue::Text(tenant_id.as_str().to_string()));
        }
        if let Some(table_name) = &filter.table_name {
            push(&mut sql, "table_name", "=", SqlValue::Text(table_name.clone()));
        }
        if let Some(record_id) = &filter.record_id {
            push(&mut sql, "record_id", "=", SqlValue::Text(record_id.clone()));
        }
        if let Some(actor_id) = &filter.actor_id {
            push(&mut sql, "actor_id", "=", SqlValue::Text(actor_id.as_str().to_string()));
        }
        if let Some(window) = &filter.window {
            push(
                &mut sql,
                "created_at",
                ">=",
                SqlValue::Text(clock::format_timestamp(&window.start())),
            );
            push(
                &mut sql,
                "created_at",
                "<",
                SqlValue::Text(clock::format_timestamp(&window.end())),
            );
        }

        sql.push_str(&format!(" ORDER BY sequence LIMIT {}", limit));

        let conn = self.get_connection()?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| internal_error(format!("Failed to prepare audit query: {}", e)))?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), RawLogRow::from_row)
            .map_err(|e| internal_error(format!("Failed to query audit log: {}", e)))?;

        let mut records = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| internal_error(format!("Failed to read audit row: {}", e)))?;
            records.push(raw.into_record()?);
        }

        Ok(records)
    }
}
