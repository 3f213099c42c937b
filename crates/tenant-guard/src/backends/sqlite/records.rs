//! Tenant-scoped record storage for SQLite.

use async_trait::async_trait;
use rusqlite::{Row, params_from_iter};
use serde_json::Value;

use crate::clock;
use crate::error::GuardResult;
use crate::store::{Record, RecordStore, RecordTransaction, TenantScopedQuery};
use crate::tenant::{TenantContext, TenantId};

use super::SqliteBackend;
use super::backend::{internal_error, serialization_error};
use super::transaction::SqliteRecordTransaction;

pub(crate) const RECORD_COLUMNS: &str =
    "table_name, id, tenant_id, data, version, created_at, updated_at";

/// A `records` row before JSON and timestamp decoding.
pub(crate) struct RawRecord {
    table: String,
    id: String,
    tenant_id: String,
    data: String,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl RawRecord {
    /// Reads the columns selected by [`RECORD_COLUMNS`].
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            table: row.get(0)?,
            id: row.get(1)?,
            tenant_id: row.get(2)?,
            data: row.get(3)?,
            version: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    pub(crate) fn into_record(self) -> GuardResult<Record> {
        let data: Value = serde_json::from_str(&self.data)
            .map_err(|e| serialization_error(format!("Failed to deserialize record: {}", e)))?;
        let created_at = clock::parse_timestamp(&self.created_at)
            .map_err(|e| serialization_error(format!("Invalid created_at: {}", e)))?;
        let updated_at = clock::parse_timestamp(&self.updated_at)
            .map_err(|e| serialization_error(format!("Invalid updated_at: {}", e)))?;

        Ok(Record {
            table: self.table,
            id: self.id,
            tenant_id: TenantId::new(self.tenant_id),
            data,
            version: self.version,
            created_at,
            updated_at,
        })
    }
}

#[async_trait]
impl RecordStore for SqliteBackend {
    async fn select(&self, query: &TenantScopedQuery) -> GuardResult<Vec<Record>> {
        let conn = self.get_connection()?;
        let clause = query.where_clause();

        let limit = query.limit().map(|l| l as i64).unwrap_or(-1);
        let sql = format!(
            "SELECT {} FROM records WHERE {} ORDER BY created_at, id LIMIT {} OFFSET {}",
            RECORD_COLUMNS,
            clause.sql,
            limit,
            query.offset()
        );

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| internal_error(format!("Failed to prepare select: {}", e)))?;
        let rows = stmt
            .query_map(params_from_iter(clause.params.iter()), RawRecord::from_row)
            .map_err(|e| internal_error(format!("Failed to query records: {}", e)))?;

        let mut records = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| internal_error(format!("Failed to read record: {}", e)))?;
            records.push(raw.into_record()?);
        }

        Ok(records)
    }

    async fn begin_write(
        &self,
        context: &TenantContext,
    ) -> GuardResult<Box<dyn RecordTransaction>> {
        let conn = self.get_connection()?;
        let txn = SqliteRecordTransaction::new(conn, context.tenant_id().clone())?;
        Ok(Box::new(txn))
    }
}
