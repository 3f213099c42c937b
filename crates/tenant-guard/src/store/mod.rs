//! Record storage boundary.
//!
//! [`RecordStore`] is the relational store seen by the isolation filter.
//! Reads take a [`TenantScopedQuery`]; writes go through a
//! [`RecordTransaction`] that also carries the audit outbox insert, so a
//! mutation and its audit entry commit or roll back together.

mod query;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::audit::AuditLogEntry;
use crate::error::GuardResult;
use crate::tenant::{TenantContext, TenantId};

pub use query::{RecordFilter, TenantScopedQuery, WhereClause};

/// A row of a tenant-scoped table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Table the record belongs to.
    pub table: String,
    /// Record id, unique per table.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Record payload.
    pub data: Value,
    /// Starts at 1, bumped on every update.
    pub version: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// Returns the state recorded in audit `old_values` / `new_values`.
    pub fn snapshot(&self) -> Value {
        json!({
            "id": self.id,
            "tenant_id": self.tenant_id,
            "version": self.version,
            "data": self.data,
        })
    }
}

/// Tenant-scoped record storage.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Returns the records matching a tenant-scoped query.
    async fn select(&self, query: &TenantScopedQuery) -> GuardResult<Vec<Record>>;

    /// Opens a write transaction for the context's tenant.
    ///
    /// The transaction holds the store's write lock from the start, so
    /// read-old, mutate and audit-enqueue are serialized per record.
    async fn begin_write(&self, context: &TenantContext) -> GuardResult<Box<dyn RecordTransaction>>;
}

/// A write transaction over the record store.
#[async_trait]
pub trait RecordTransaction: Send {
    /// Reads the current row for `table/id` regardless of tenant.
    ///
    /// This is the pre-image used to detect cross-tenant mutations; it is
    /// never returned to callers.
    async fn lock_record(&mut self, table: &str, id: &str) -> GuardResult<Option<Record>>;

    /// Inserts a record stamped with the transaction's tenant.
    async fn insert(&mut self, table: &str, id: &str, data: Value) -> GuardResult<Record>;

    /// Replaces a record's data and bumps its version.
    async fn update(&mut self, current: &Record, data: Value) -> GuardResult<Record>;

    /// Deletes a record.
    async fn delete(&mut self, current: &Record) -> GuardResult<()>;

    /// Queues an audit entry in the same transaction.
    ///
    /// A failed enqueue leaves the transaction as it was before the call, so
    /// the caller can still commit its mutation.
    async fn enqueue_audit(&mut self, entry: &AuditLogEntry) -> GuardResult<()>;

    /// Commits the transaction.
    async fn commit(self: Box<Self>) -> GuardResult<()>;

    /// Rolls back the transaction.
    async fn rollback(self: Box<Self>) -> GuardResult<()>;
}
