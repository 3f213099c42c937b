//! Error types for the tenant guard.
//!
//! Errors are organized in a hierarchy under [`GuardError`]: authorization
//! denials, isolation defects, audit pipeline failures, compliance query
//! failures, resource state, transactions, backends and configuration.
//!
//! Internal errors carry full detail for logs. What reaches an end user is
//! the collapsed [`PublicError`] returned by [`GuardError::public_error`].

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::authz::DenyReason;
use crate::tenant::{TenantId, UserId};

/// The primary error type for all guard operations.
#[derive(Error, Debug)]
pub enum GuardError {
    /// Authorization denials
    #[error(transparent)]
    Authorization(#[from] AuthzError),

    /// Tenant isolation violations
    #[error(transparent)]
    Isolation(#[from] IsolationError),

    /// Audit pipeline errors
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// Compliance reporting errors
    #[error(transparent)]
    Compliance(#[from] ComplianceError),

    /// Record and tenant state errors
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Transaction errors
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// Backend-specific errors
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Configuration errors
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The scope an access decision was made for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessScope {
    /// A single tenant.
    Tenant(TenantId),
    /// Every tenant on the platform.
    Platform,
}

impl fmt::Display for AccessScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessScope::Tenant(id) => write!(f, "tenant {}", id),
            AccessScope::Platform => write!(f, "platform"),
        }
    }
}

/// Authorization denials.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("access denied for user {user_id} on {scope}: {reason}")]
    Denied {
        user_id: UserId,
        scope: AccessScope,
        reason: DenyReason,
    },
}

impl AuthzError {
    /// Returns the denial reason.
    pub fn reason(&self) -> &DenyReason {
        match self {
            AuthzError::Denied { reason, .. } => reason,
        }
    }
}

/// Why a tenant context was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextFault {
    /// No context was supplied.
    Absent,
    /// The context carries an empty tenant id.
    EmptyTenant,
    /// The payload declares a tenant other than the context's.
    DeclaredTenantMismatch { declared: String },
}

impl fmt::Display for ContextFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextFault::Absent => write!(f, "no tenant context"),
            ContextFault::EmptyTenant => write!(f, "empty tenant id"),
            ContextFault::DeclaredTenantMismatch { declared } => {
                write!(f, "payload declares tenant '{}'", declared)
            }
        }
    }
}

/// Tenant isolation violations. All of these are caller defects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IsolationError {
    #[error("missing tenant context for {operation}: {fault}")]
    MissingTenantContext {
        operation: String,
        fault: ContextFault,
    },

    #[error("cross-tenant mutation of {table}/{id}: context tenant {context_tenant}, record tenant {record_tenant}")]
    CrossTenantMutation {
        table: String,
        id: String,
        context_tenant: TenantId,
        record_tenant: TenantId,
    },

    #[error("invalid tenant id '{tenant_id}': {reason}")]
    InvalidTenantId { tenant_id: String, reason: String },
}

/// Audit pipeline errors. Never surfaced to end users.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("audit write failed for entry {entry_id} after {attempts} attempts: {message}")]
    WriteFailure {
        entry_id: Uuid,
        attempts: u32,
        message: String,
    },

    #[error("audit dispatcher is not running")]
    DispatcherClosed,

    #[error("malformed audit entry: {message}")]
    Malformed { message: String },
}

/// Compliance reporting errors.
#[derive(Error, Debug)]
pub enum ComplianceError {
    #[error("compliance query timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("compliance query cancelled")]
    Cancelled,

    #[error("invalid time window: start {start} is not before end {end}")]
    InvalidWindow {
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
    },
}

/// Errors related to record, tenant and membership state.
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("record not found: {table}/{id}")]
    NotFound { table: String, id: String },

    #[error("record already exists: {table}/{id}")]
    AlreadyExists { table: String, id: String },

    #[error("tenant not found: {tenant_id}")]
    TenantNotFound { tenant_id: TenantId },

    #[error("tenant is inactive: {tenant_id}")]
    TenantInactive { tenant_id: TenantId },

    #[error("no active membership for user {user_id} in tenant {tenant_id}")]
    MembershipNotFound { user_id: UserId, tenant_id: TenantId },

    #[error("tenant {tenant_id} reached its {limit} limit of {max}")]
    LimitExceeded {
        tenant_id: TenantId,
        limit: &'static str,
        max: u32,
    },

    #[error("invalid record payload: {message}")]
    InvalidPayload { message: String },
}

/// Transaction errors.
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("transaction is no longer active")]
    InvalidTransaction,

    #[error("transaction rolled back: {reason}")]
    RolledBack { reason: String },
}

/// Backend-specific errors.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend unavailable: {backend_name}: {message}")]
    Unavailable {
        backend_name: String,
        message: String,
    },

    #[error("connection failed to {backend_name}: {message}")]
    ConnectionFailed {
        backend_name: String,
        message: String,
    },

    #[error("internal error in {backend_name}: {message}")]
    Internal {
        backend_name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("serialization error: {message}")]
    SerializationError { message: String },

    #[error("schema migration failed: {message}")]
    MigrationError { message: String },
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {message}")]
    Parse { message: String },

    #[error("invalid configuration: {}", problems.join("; "))]
    Invalid { problems: Vec<String> },
}

/// The only error categories an end user ever sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublicError {
    NotAuthorized,
    NotFound,
    BadRequest,
    Unavailable,
    Internal,
}

impl fmt::Display for PublicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            PublicError::NotAuthorized => "not authorized",
            PublicError::NotFound => "not found",
            PublicError::BadRequest => "bad request",
            PublicError::Unavailable => "service unavailable",
            PublicError::Internal => "internal error",
        };
        f.write_str(message)
    }
}

impl GuardError {
    /// Collapses this error into the category shown to end users.
    ///
    /// A cross-tenant mutation is reported exactly like an absent record so
    /// callers cannot discover other tenants' ids.
    pub fn public_error(&self) -> PublicError {
        match self {
            GuardError::Authorization(_) => PublicError::NotAuthorized,
            GuardError::Isolation(IsolationError::CrossTenantMutation { .. }) => {
                PublicError::NotFound
            }
            GuardError::Isolation(IsolationError::InvalidTenantId { .. }) => {
                PublicError::BadRequest
            }
            GuardError::Isolation(IsolationError::MissingTenantContext { .. }) => {
                PublicError::Internal
            }
            GuardError::Resource(e) => match e {
                ResourceError::NotFound { .. }
                | ResourceError::TenantNotFound { .. }
                | ResourceError::MembershipNotFound { .. } => PublicError::NotFound,
                ResourceError::AlreadyExists { .. }
                | ResourceError::TenantInactive { .. }
                | ResourceError::LimitExceeded { .. }
                | ResourceError::InvalidPayload { .. } => PublicError::BadRequest,
            },
            GuardError::Compliance(ComplianceError::InvalidWindow { .. }) => {
                PublicError::BadRequest
            }
            GuardError::Compliance(_) => PublicError::Unavailable,
            GuardError::Backend(
                BackendError::Unavailable { .. } | BackendError::ConnectionFailed { .. },
            ) => PublicError::Unavailable,
            GuardError::Audit(_)
            | GuardError::Transaction(_)
            | GuardError::Backend(_)
            | GuardError::Config(_) => PublicError::Internal,
        }
    }

    /// Returns true if this error is an authorization denial.
    pub fn is_denial(&self) -> bool {
        matches!(self, GuardError::Authorization(_))
    }
}

/// Result type for guard operations.
pub type GuardResult<T> = Result<T, GuardError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::{Role, StoredRole};

    #[test]
    fn test_denials_are_not_authorized() {
        let err = GuardError::from(AuthzError::Denied {
            user_id: UserId::new("alice"),
            scope: AccessScope::Tenant(TenantId::new("clinic-a")),
            reason: DenyReason::InsufficientRole {
                actual: StoredRole::Known(Role::Staff),
                required: Role::TenantAdmin,
            },
        });
        assert_eq!(err.public_error(), PublicError::NotAuthorized);
        assert!(err.is_denial());
        assert!(err.to_string().contains("clinic-a"));
    }

    #[test]
    fn test_cross_tenant_mutation_looks_like_not_found() {
        let cross = GuardError::from(IsolationError::CrossTenantMutation {
            table: "patients".to_string(),
            id: "p1".to_string(),
            context_tenant: TenantId::new("clinic-a"),
            record_tenant: TenantId::new("clinic-b"),
        });
        let absent = GuardError::from(ResourceError::NotFound {
            table: "patients".to_string(),
            id: "p1".to_string(),
        });
        assert_eq!(cross.public_error(), absent.public_error());
    }

    #[test]
    fn test_missing_context_is_internal() {
        let err = GuardError::from(IsolationError::MissingTenantContext {
            operation: "read".to_string(),
            fault: ContextFault::Absent,
        });
        assert_eq!(err.public_error(), PublicError::Internal);
    }

    #[test]
    fn test_config_invalid_message_lists_problems() {
        let err = ConfigError::Invalid {
            problems: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "invalid configuration: a; b");
    }
}
