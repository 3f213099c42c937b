//! Helios Tenant Guard
//!
//! Tenant-scoped role authorization and compliance audit core for
//! multi-tenant practice platforms. Every read and write of protected data
//! is authorized against the caller's tenant memberships, confined to one
//! tenant, and recorded in an append-only audit trail that compliance
//! reports are built from.
//!
//! # Features
//!
//! - **Role hierarchy**: `patient < staff < practice_manager < tenant_admin < platform_admin`,
//!   with unrecognized stored roles failing closed
//! - **Operation policy**: configurable `{operation: role}` map with per-membership overrides
//! - **Tenant isolation**: queries always carry the tenant predicate; cross-tenant writes
//!   are rejected under the write lock
//! - **Audit trail**: transactional outbox, background dispatcher, idempotent delivery
//! - **Compliance**: access summaries and per-record access history over a time window
//!
//! Available backend features:
//! - `sqlite` (default) - SQLite with in-memory and file modes
//!
//! # Architecture
//!
//! - [`role`] - Role hierarchy and stored role parsing
//! - [`tenant`] - Tenant ids, tenants, memberships and the data-access context
//! - [`membership`] - Membership stores, fail-closed resolution, per-request cache
//! - [`authz`] - Pure authorization decisions and the operation policy
//! - [`store`] - Tenant-scoped record storage traits
//! - [`isolation`] - Tenant isolation filter over the record store
//! - [`audit`] - Audit entries, outbox logger and dispatcher
//! - [`compliance`] - Compliance snapshots over the audit log
//! - [`gateway`] - Request boundary combining all of the above
//! - [`backends`] - Storage backend implementations
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use helios_tenant_guard::authz::operations;
//! use helios_tenant_guard::backends::sqlite::SqliteBackend;
//! use helios_tenant_guard::tenant::{RequestMetadata, TenantId, UserId};
//! use helios_tenant_guard::{AccessGateway, GuardConfig};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(SqliteBackend::open("guard.db")?);
//! backend.init_schema()?;
//!
//! let gateway = AccessGateway::new(backend, &GuardConfig::default())?;
//! let dispatcher = gateway.audit().start_dispatcher();
//!
//! let scope = gateway.begin_request(UserId::new("alice"), RequestMetadata::new());
//! let ctx = scope
//!     .authorize(&TenantId::new("clinic-a"), operations::EDIT_PATIENT_RECORD)
//!     .await?;
//! scope
//!     .records()
//!     .create(Some(&ctx), "patients", json!({"id": "p1", "name": "Ann"}))
//!     .await?;
//!
//! dispatcher.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod audit;
pub mod authz;
pub mod backends;
pub mod clock;
pub mod compliance;
pub mod config;
pub mod error;
pub mod gateway;
pub mod isolation;
pub mod membership;
pub mod role;
pub mod store;
pub mod tenant;

// Re-export commonly used types at crate root
pub use config::GuardConfig;
pub use error::{GuardError, GuardResult, PublicError};
pub use gateway::{AccessGateway, RequestScope};
pub use role::{Role, StoredRole};
pub use tenant::{TenantContext, TenantId, UserId};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
