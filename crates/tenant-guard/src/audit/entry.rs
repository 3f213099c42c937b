//! Audit log entries and queries.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock;
use crate::error::ComplianceError;
use crate::tenant::{RequestMetadata, TenantContext, TenantId, UserId};

/// The kind of access an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    /// Record inserted.
    Create,
    /// Record or list read.
    Read,
    /// Record replaced.
    Update,
    /// Record deleted.
    Delete,
}

impl AuditAction {
    /// Returns the lowercase name stored in the log.
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Read => "read",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
        }
    }

    /// Parses a stored action name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(AuditAction::Create),
            "read" => Some(AuditAction::Read),
            "update" => Some(AuditAction::Update),
            "delete" => Some(AuditAction::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the recorded access ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// The access went through.
    Success,
    /// The access failed after authorization.
    Failure,
    /// The access was refused.
    Denied,
}

impl AuditOutcome {
    /// Returns the lowercase name stored in the log.
    pub fn as_str(self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
            AuditOutcome::Denied => "denied",
        }
    }

    /// Parses a stored outcome name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(AuditOutcome::Success),
            "failure" => Some(AuditOutcome::Failure),
            "denied" => Some(AuditOutcome::Denied),
            _ => None,
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable record of one access.
///
/// `old_values` is the state before the operation and `new_values` the
/// state after; creates have no old state and deletes no new state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Unique entry id; delivery is idempotent on it.
    pub id: Uuid,
    /// Table the access touched.
    pub table_name: String,
    /// Kind of access.
    pub action: AuditAction,
    /// Accessed record, when there is one.
    pub record_id: Option<String>,
    /// Acting user.
    pub actor_id: UserId,
    /// Tenant the access was scoped to.
    pub tenant_id: TenantId,
    /// State before the operation.
    pub old_values: Option<Value>,
    /// State after the operation.
    pub new_values: Option<Value>,
    /// How the access ended.
    pub outcome: AuditOutcome,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
    /// Caller metadata for the request.
    #[serde(default)]
    pub request_metadata: RequestMetadata,
}

impl AuditLogEntry {
    /// Creates a successful entry with a fresh id.
    pub fn new(
        actor_id: UserId,
        tenant_id: TenantId,
        table_name: impl Into<String>,
        action: AuditAction,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            table_name: table_name.into(),
            action,
            record_id: None,
            actor_id,
            tenant_id,
            old_values: None,
            new_values: None,
            outcome: AuditOutcome::Success,
            created_at: clock::now(),
            request_metadata: RequestMetadata::default(),
        }
    }

    /// Creates an entry for the context's actor, tenant and request.
    pub fn for_context(
        context: &TenantContext,
        table_name: impl Into<String>,
        action: AuditAction,
    ) -> Self {
        Self::new(
            context.user_id().clone(),
            context.tenant_id().clone(),
            table_name,
            action,
        )
        .with_metadata(context.metadata().clone())
    }

    /// Sets the accessed record id.
    pub fn with_record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    /// Sets the pre-image.
    pub fn with_old_values(mut self, old_values: Value) -> Self {
        self.old_values = Some(old_values);
        self
    }

    /// Sets the post-image.
    pub fn with_new_values(mut self, new_values: Value) -> Self {
        self.new_values = Some(new_values);
        self
    }

    /// Sets the outcome.
    pub fn with_outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Replaces the request metadata.
    pub fn with_metadata(mut self, metadata: RequestMetadata) -> Self {
        self.request_metadata = metadata;
        self
    }

    /// Adds a value to the request metadata extras.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.request_metadata.extra.insert(key.into(), value.into());
        self
    }

    /// Returns the change between old and new values as a JSON Patch.
    pub fn changes(&self) -> json_patch::Patch {
        let old = self.old_values.clone().unwrap_or(Value::Null);
        let new = self.new_values.clone().unwrap_or(Value::Null);
        json_patch::diff(&old, &new)
    }
}

/// An entry waiting in the audit outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEntry {
    /// Outbox position; delivery follows this order.
    pub outbox_id: i64,
    /// The queued entry.
    pub entry: AuditLogEntry,
}

/// An entry delivered to the audit log, with its log position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Position in the audit log.
    pub sequence: i64,
    /// The delivered entry.
    #[serde(flatten)]
    pub entry: AuditLogEntry,
}

/// A half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeWindow {
    /// Creates a window. `start` must be before `end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ComplianceError> {
        if start >= end {
            return Err(ComplianceError::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    /// The window of the given length ending now.
    pub fn last(length: Duration) -> Result<Self, ComplianceError> {
        let end = clock::now() + Duration::microseconds(1);
        Self::new(end - length, end)
    }

    /// Inclusive start.
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Exclusive end.
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Returns true if `ts` falls inside the window.
    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        &self.start <= ts && ts < &self.end
    }
}

/// Criteria for reading the audit log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditFilter {
    /// Only entries of this tenant.
    pub tenant_id: Option<TenantId>,
    /// Only entries of this table.
    pub table_name: Option<String>,
    /// Only entries of this record.
    pub record_id: Option<String>,
    /// Only entries by this actor.
    pub actor_id: Option<UserId>,
    /// Only entries inside this window.
    pub window: Option<TimeWindow>,
}

impl AuditFilter {
    /// Matches every entry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to one tenant.
    pub fn for_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    /// Restricts to one record.
    pub fn for_record(
        mut self,
        table_name: impl Into<String>,
        record_id: impl Into<String>,
    ) -> Self {
        self.table_name = Some(table_name.into());
        self.record_id = Some(record_id.into());
        self
    }

    /// Restricts to one actor.
    pub fn for_actor(mut self, actor_id: UserId) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    /// Restricts to a time window.
    pub fn within(mut self, window: TimeWindow) -> Self {
        self.window = Some(window);
        self
    }

    /// Returns true if an entry matches every criterion.
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.tenant_id.as_ref().is_none_or(|t| t == &entry.tenant_id)
            && self.table_name.as_ref().is_none_or(|t| t == &entry.table_name)
            && self
                .record_id
                .as_ref()
                .is_none_or(|r| entry.record_id.as_ref() == Some(r))
            && self.actor_id.as_ref().is_none_or(|a| a == &entry.actor_id)
            && self.window.as_ref().is_none_or(|w| w.contains(&entry.created_at))
    }
}
