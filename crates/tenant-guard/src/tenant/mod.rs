//! Tenants, memberships and the tenant context.
//!
//! # Core Types
//!
//! - [`TenantId`] / [`UserId`] - Opaque identifiers
//! - [`Tenant`] - A clinic or practice, deactivated rather than deleted
//! - [`TenantMembership`] - A user's role in one tenant
//! - [`TenantContext`] - Authorized context required by every data access path
//! - [`RequestMetadata`] - Request details copied into audit entries

mod context;
mod id;
mod model;

pub use context::{RequestMetadata, TenantContext};
pub use id::{TenantId, TenantIdValidator, UserId};
pub use model::{SubscriptionTier, Tenant, TenantLimits, TenantMembership};
