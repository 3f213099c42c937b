//! Tenant membership resolution.
//!
//! The [`MembershipStore`] and [`TenantStore`] traits are the boundary to
//! wherever memberships live. [`MembershipResolver`] reads through them and
//! fails closed, and [`MembershipCache`] memoizes resolutions for the
//! lifetime of one request.

mod resolver;

use async_trait::async_trait;

use crate::error::{GuardResult, ResourceError};
use crate::tenant::{Tenant, TenantId, TenantMembership, UserId};

pub use resolver::{MembershipCache, MembershipResolver};

/// Storage of tenant memberships and primary tenant preferences.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Returns the user's active memberships in active tenants, oldest first.
    async fn active_memberships(&self, user_id: &UserId) -> GuardResult<Vec<TenantMembership>>;

    /// Returns the active memberships of a tenant.
    async fn tenant_members(&self, tenant_id: &TenantId) -> GuardResult<Vec<TenantMembership>>;

    /// Inserts a membership, or reactivates and replaces an existing one for
    /// the same user and tenant. Returns the previous row, if any.
    async fn upsert_membership(
        &self,
        membership: &TenantMembership,
    ) -> GuardResult<Option<TenantMembership>>;

    /// Like [`upsert_membership`](Self::upsert_membership), but fails with
    /// [`ResourceError::LimitExceeded`] when the user is not already an
    /// active member and the tenant has `max_members` active members.
    ///
    /// The default implementation counts and writes separately; stores that
    /// can should override it to do both under one lock.
    async fn upsert_membership_capped(
        &self,
        membership: &TenantMembership,
        max_members: u32,
    ) -> GuardResult<Option<TenantMembership>> {
        let members = self.tenant_members(&membership.tenant_id).await?;
        let already_member = members.iter().any(|m| m.user_id == membership.user_id);
        if !already_member && members.len() >= max_members as usize {
            return Err(ResourceError::LimitExceeded {
                tenant_id: membership.tenant_id.clone(),
                limit: "max_users",
                max: max_members,
            }
            .into());
        }
        self.upsert_membership(membership).await
    }

    /// Deactivates an active membership and returns its state before the change.
    async fn deactivate_membership(
        &self,
        user_id: &UserId,
        tenant_id: &TenantId,
    ) -> GuardResult<TenantMembership>;

    /// Returns the user's stored primary tenant preference.
    async fn primary_tenant_preference(&self, user_id: &UserId) -> GuardResult<Option<TenantId>>;

    /// Stores or clears the user's primary tenant preference.
    async fn set_primary_tenant(
        &self,
        user_id: &UserId,
        tenant_id: Option<&TenantId>,
    ) -> GuardResult<()>;
}

/// Storage of tenants.
#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Creates a tenant.
    async fn create_tenant(&self, tenant: &Tenant) -> GuardResult<()>;

    /// Returns a tenant by id, active or not.
    async fn get_tenant(&self, tenant_id: &TenantId) -> GuardResult<Option<Tenant>>;

    /// Marks a tenant inactive and returns its state before the change.
    async fn deactivate_tenant(&self, tenant_id: &TenantId) -> GuardResult<Tenant>;
}
