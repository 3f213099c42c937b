//! Tenant isolation filter.
//!
//! Every data access passes through [`TenantIsolationFilter`]:
//!
//! - reads build a [`TenantScopedQuery`], so the tenant predicate is always
//!   present
//! - creates stamp the context's tenant on the new row
//! - updates and deletes read the row's pre-image under the write lock and
//!   reject it when it belongs to another tenant
//!
//! Each write enqueues its audit entry inside the same transaction. When
//! the outbox rejects the entry the mutation still commits and the entry
//! goes through [`AuditLogger::record`] afterwards.
//!
//! A missing or inconsistent tenant context is a caller defect and fails
//! with [`IsolationError::MissingTenantContext`] before the store is touched.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::audit::{AuditAction, AuditLogEntry, AuditLogger, AuditOutcome};
use crate::error::{ContextFault, GuardError, GuardResult, IsolationError, ResourceError};
use crate::store::{Record, RecordFilter, RecordStore, RecordTransaction, TenantScopedQuery};
use crate::tenant::TenantContext;

/// Tenant-scoped data access with audit.
#[derive(Clone)]
pub struct TenantIsolationFilter {
    store: Arc<dyn RecordStore>,
    audit: AuditLogger,
    sensitive_tables: Arc<HashSet<String>>,
}

impl std::fmt::Debug for TenantIsolationFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantIsolationFilter")
            .field("sensitive_tables", &self.sensitive_tables)
            .finish_non_exhaustive()
    }
}

impl TenantIsolationFilter {
    /// Creates a filter over a record store.
    ///
    /// Reads of `sensitive_tables` are audited as well as writes.
    pub fn new(
        store: Arc<dyn RecordStore>,
        audit: AuditLogger,
        sensitive_tables: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            store,
            audit,
            sensitive_tables: Arc::new(sensitive_tables.into_iter().collect()),
        }
    }

    /// Returns true if reads of `table` are audited.
    pub fn is_sensitive(&self, table: &str) -> bool {
        self.sensitive_tables.contains(table)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Reads one record of the context's tenant.
    ///
    /// Rows of other tenants are invisible: they read as `None`.
    pub async fn read(
        &self,
        context: Option<&TenantContext>,
        table: &str,
        id: &str,
    ) -> GuardResult<Option<Record>> {
        let context = require_context(context, "read")?;
        let query = TenantScopedQuery::for_context(context, table).with_id(id);

        let result = self.store.select(&query).await;

        if self.is_sensitive(table) {
            let entry = AuditLogEntry::for_context(context, table, AuditAction::Read)
                .with_record_id(id)
                .with_outcome(match &result {
                    Ok(rows) if !rows.is_empty() => AuditOutcome::Success,
                    _ => AuditOutcome::Failure,
                });
            self.audit.record(entry).await;
        }

        Ok(result?.into_iter().next())
    }

    /// Lists records of the context's tenant.
    pub async fn list(
        &self,
        context: Option<&TenantContext>,
        table: &str,
        filter: RecordFilter,
    ) -> GuardResult<Vec<Record>> {
        let context = require_context(context, "list")?;
        let query = TenantScopedQuery::for_context(context, table).with_filter(filter);

        let result = self.store.select(&query).await;

        if self.is_sensitive(table) {
            let mut entry = AuditLogEntry::for_context(context, table, AuditAction::Read);
            entry = match &result {
                Ok(rows) => entry.with_detail("result_count", rows.len() as u64),
                Err(_) => entry.with_outcome(AuditOutcome::Failure),
            };
            self.audit.record(entry).await;
        }

        result
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Creates a record in the context's tenant.
    ///
    /// The id is taken from the payload's `id` field or generated.
    pub async fn create(
        &self,
        context: Option<&TenantContext>,
        table: &str,
        data: Value,
    ) -> GuardResult<Record> {
        let context = require_context(context, "create")?;
        check_declared_tenant(context, &data, "create")?;

        let id = data
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut txn = self.store.begin_write(context).await?;
        let outcome = create_in(txn.as_mut(), context, table, &id, data).await;
        self.finish(txn, context, table, &id, AuditAction::Create, outcome)
            .await
    }

    /// Replaces the data of a record in the context's tenant.
    pub async fn update(
        &self,
        context: Option<&TenantContext>,
        table: &str,
        id: &str,
        data: Value,
    ) -> GuardResult<Record> {
        let context = require_context(context, "update")?;
        check_declared_tenant(context, &data, "update")?;

        let mut txn = self.store.begin_write(context).await?;
        let outcome = update_in(txn.as_mut(), context, table, id, data).await;
        self.finish(txn, context, table, id, AuditAction::Update, outcome)
            .await
    }

    /// Deletes a record of the context's tenant and returns its last state.
    pub async fn delete(
        &self,
        context: Option<&TenantContext>,
        table: &str,
        id: &str,
    ) -> GuardResult<Record> {
        let context = require_context(context, "delete")?;

        let mut txn = self.store.begin_write(context).await?;
        let outcome = delete_in(txn.as_mut(), context, table, id).await;
        self.finish(txn, context, table, id, AuditAction::Delete, outcome)
            .await
    }

    /// Commits a successful write, or rolls back and audits the failure.
    ///
    /// An entry the transaction could not queue is recorded once the
    /// mutation has committed.
    async fn finish<T>(
        &self,
        txn: Box<dyn RecordTransaction>,
        context: &TenantContext,
        table: &str,
        id: &str,
        action: AuditAction,
        outcome: GuardResult<Written<T>>,
    ) -> GuardResult<T> {
        let failure = match outcome {
            Ok(written) => match txn.commit().await {
                Ok(()) => {
                    match written.deferred {
                        Some(entry) => self.audit.record(entry).await,
                        None => self.audit.notify(),
                    }
                    return Ok(written.value);
                }
                Err(e) => e,
            },
            Err(e) => {
                if let Err(rollback) = txn.rollback().await {
                    warn!(error = %rollback, "Rollback failed after write error");
                }
                e
            }
        };

        debug!(
            tenant_id = %context.tenant_id(),
            table,
            record_id = id,
            action = %action,
            error = %failure,
            "Write failed"
        );

        let outcome = match &failure {
            GuardError::Isolation(_) => AuditOutcome::Denied,
            _ => AuditOutcome::Failure,
        };
        let entry = AuditLogEntry::for_context(context, table, action)
            .with_record_id(id)
            .with_outcome(outcome)
            .with_detail("error", failure.public_error().to_string());
        self.audit.record(entry).await;

        Err(failure)
    }
}

/// A mutation applied inside a transaction, with its audit entry if the
/// outbox did not accept it.
struct Written<T> {
    value: T,
    deferred: Option<AuditLogEntry>,
}

/// Queues `entry` in the transaction, handing it back when the outbox fails.
async fn enqueue_or_defer<T>(
    txn: &mut dyn RecordTransaction,
    entry: AuditLogEntry,
    value: T,
) -> Written<T> {
    match txn.enqueue_audit(&entry).await {
        Ok(()) => Written {
            value,
            deferred: None,
        },
        Err(e) => {
            warn!(
                entry_id = %entry.id,
                tenant_id = %entry.tenant_id,
                table = %entry.table_name,
                error = %e,
                "Audit outbox rejected entry, committing without it"
            );
            Written {
                value,
                deferred: Some(entry),
            }
        }
    }
}

async fn create_in(
    txn: &mut dyn RecordTransaction,
    context: &TenantContext,
    table: &str,
    id: &str,
    data: Value,
) -> GuardResult<Written<Record>> {
    if txn.lock_record(table, id).await?.is_some() {
        return Err(ResourceError::AlreadyExists {
            table: table.to_string(),
            id: id.to_string(),
        }
        .into());
    }

    let record = txn.insert(table, id, data).await?;
    let entry = AuditLogEntry::for_context(context, table, AuditAction::Create)
        .with_record_id(id)
        .with_new_values(record.snapshot());
    Ok(enqueue_or_defer(txn, entry, record).await)
}

async fn update_in(
    txn: &mut dyn RecordTransaction,
    context: &TenantContext,
    table: &str,
    id: &str,
    data: Value,
) -> GuardResult<Written<Record>> {
    let current = locked_pre_image(txn, context, table, id).await?;
    let updated = txn.update(&current, data).await?;
    let entry = AuditLogEntry::for_context(context, table, AuditAction::Update)
        .with_record_id(id)
        .with_old_values(current.snapshot())
        .with_new_values(updated.snapshot());
    Ok(enqueue_or_defer(txn, entry, updated).await)
}

async fn delete_in(
    txn: &mut dyn RecordTransaction,
    context: &TenantContext,
    table: &str,
    id: &str,
) -> GuardResult<Written<Record>> {
    let current = locked_pre_image(txn, context, table, id).await?;
    txn.delete(&current).await?;
    let entry = AuditLogEntry::for_context(context, table, AuditAction::Delete)
        .with_record_id(id)
        .with_old_values(current.snapshot());
    Ok(enqueue_or_defer(txn, entry, current).await)
}

/// Loads the row under the write lock and checks it belongs to the context's tenant.
async fn locked_pre_image(
    txn: &mut dyn RecordTransaction,
    context: &TenantContext,
    table: &str,
    id: &str,
) -> GuardResult<Record> {
    let Some(current) = txn.lock_record(table, id).await? else {
        return Err(ResourceError::NotFound {
            table: table.to_string(),
            id: id.to_string(),
        }
        .into());
    };

    if &current.tenant_id != context.tenant_id() {
        error!(
            tenant_id = %context.tenant_id(),
            user_id = %context.user_id(),
            table,
            record_id = id,
            record_tenant = %current.tenant_id,
            "Cross-tenant mutation rejected"
        );
        return Err(IsolationError::CrossTenantMutation {
            table: table.to_string(),
            id: id.to_string(),
            context_tenant: context.tenant_id().clone(),
            record_tenant: current.tenant_id,
        }
        .into());
    }

    Ok(current)
}

/// Returns the context or a [`IsolationError::MissingTenantContext`] defect.
fn require_context<'a>(
    context: Option<&'a TenantContext>,
    operation: &str,
) -> GuardResult<&'a TenantContext> {
    let fault = match context {
        Some(context) if !context.tenant_id().is_empty() => return Ok(context),
        Some(_) => ContextFault::EmptyTenant,
        None => ContextFault::Absent,
    };

    error!(operation, fault = %fault, "Data access without tenant context");
    Err(IsolationError::MissingTenantContext {
        operation: operation.to_string(),
        fault,
    }
    .into())
}

/// Rejects payloads that name a tenant other than the context's.
fn check_declared_tenant(
    context: &TenantContext,
    data: &Value,
    operation: &str,
) -> GuardResult<()> {
    let Some(declared) = data.get("tenant_id") else {
        return Ok(());
    };

    if declared.as_str() == Some(context.tenant_id().as_str()) {
        return Ok(());
    }

    let declared = declared
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| declared.to_string());
    let fault = ContextFault::DeclaredTenantMismatch { declared };
    error!(
        operation,
        tenant_id = %context.tenant_id(),
        fault = %fault,
        "Payload tenant does not match context"
    );
    Err(IsolationError::MissingTenantContext {
        operation: operation.to_string(),
        fault,
    }
    .into())
}
