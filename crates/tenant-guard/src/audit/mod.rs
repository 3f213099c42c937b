//! HIPAA-style audit trail.
//!
//! Entries are first written to a durable outbox, either inside the business
//! transaction they describe or on their own through [`AuditLogger::record`].
//! A background dispatcher moves them into the append-only audit log.
//!
//! # Delivery
//!
//! - Outbox writes retry with bounded exponential backoff. When retries run
//!   out an [`AuditAlert`] is raised and the caller's operation still
//!   succeeds.
//! - Delivery is at-least-once from the outbox and idempotent at the log
//!   (keyed by entry id), so each entry lands exactly once.
//! - Entries left in the outbox by a crash are delivered when the next
//!   dispatcher starts.

mod entry;
mod logger;
mod retry;

use async_trait::async_trait;
use tracing::error;
use uuid::Uuid;

use crate::error::GuardResult;
use crate::tenant::TenantId;

pub use entry::{
    AuditAction, AuditFilter, AuditLogEntry, AuditOutcome, AuditRecord, QueuedEntry, TimeWindow,
};
pub use logger::{AuditLogger, DENIAL_TABLE, DispatcherHandle, DrainReport};

/// Storage for the audit outbox and the append-only audit log.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Durably queues an entry. Queuing the same entry id twice is a no-op.
    async fn enqueue(&self, entry: &AuditLogEntry) -> GuardResult<()>;

    /// Returns up to `limit` queued entries in enqueue order.
    async fn pending(&self, limit: usize) -> GuardResult<Vec<QueuedEntry>>;

    /// Returns the number of queued entries.
    async fn pending_count(&self) -> GuardResult<u64>;

    /// Appends a queued entry to the log and removes it from the outbox.
    ///
    /// Returns `false` if the log already held the entry.
    async fn deliver(&self, queued: &QueuedEntry) -> GuardResult<bool>;

    /// Reads delivered entries after `after_sequence`, in log order.
    async fn entries(
        &self,
        filter: &AuditFilter,
        after_sequence: i64,
        limit: usize,
    ) -> GuardResult<Vec<AuditRecord>>;
}

/// Which audit step exhausted its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// The entry could not be written to the outbox.
    EnqueueFailed,
    /// A queued entry could not be delivered to the log.
    DeliveryFailed,
}

/// An operational alert about the audit pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditAlert {
    /// What failed.
    pub kind: AlertKind,
    /// Entry that could not be queued or delivered.
    pub entry_id: Uuid,
    /// Tenant of that entry.
    pub tenant_id: TenantId,
    /// Attempts made before giving up.
    pub attempts: u32,
    /// Last error seen.
    pub message: String,
}

/// Receives audit pipeline alerts.
pub trait AlertSink: Send + Sync {
    /// Handles one alert. Must not block.
    fn raise(&self, alert: &AuditAlert);
}

/// Emits alerts as `error` events on the `audit_alert` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, alert: &AuditAlert) {
        error!(
            target: "audit_alert",
            kind = ?alert.kind,
            entry_id = %alert.entry_id,
            tenant_id = %alert.tenant_id,
            attempts = alert.attempts,
            error = %alert.message,
            "Audit pipeline retries exhausted"
        );
    }
}
