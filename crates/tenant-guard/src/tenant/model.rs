//! Tenant and membership records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{TenantId, UserId};
use crate::clock;
use crate::role::StoredRole;

/// Subscription tier of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    /// Default tier.
    #[default]
    Free,
    /// Small practices.
    Starter,
    /// Multi-provider practices.
    Professional,
    /// Custom contracts.
    Enterprise,
}

impl SubscriptionTier {
    /// Parses a stored tier. Unknown values fall back to [`SubscriptionTier::Free`].
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "starter" => SubscriptionTier::Starter,
            "professional" => SubscriptionTier::Professional,
            "enterprise" => SubscriptionTier::Enterprise,
            _ => SubscriptionTier::Free,
        }
    }

    /// Returns the storage name of this tier.
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Starter => "starter",
            SubscriptionTier::Professional => "professional",
            SubscriptionTier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource limits of a tenant. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TenantLimits {
    /// Active members allowed.
    pub max_users: Option<u32>,
    /// Forms allowed.
    pub max_forms: Option<u32>,
    /// Submissions allowed.
    pub max_submissions: Option<u32>,
}

/// A clinic or practice on the platform.
///
/// Tenants are never physically deleted; deactivation flips `is_active`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    /// Tenant id.
    pub id: TenantId,
    /// Display name.
    pub name: String,
    /// Specialty category, such as dermatology.
    pub specialty: Option<String>,
    /// Subscription tier.
    pub subscription_tier: SubscriptionTier,
    /// Resource limits.
    pub limits: TenantLimits,
    /// False once deactivated.
    pub is_active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    /// Creates an active tenant on the free tier with no limits.
    pub fn new(id: impl Into<TenantId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            specialty: None,
            subscription_tier: SubscriptionTier::Free,
            limits: TenantLimits::default(),
            is_active: true,
            created_at: clock::now(),
        }
    }

    /// Sets the specialty category.
    pub fn with_specialty(mut self, specialty: impl Into<String>) -> Self {
        self.specialty = Some(specialty.into());
        self
    }

    /// Sets the subscription tier.
    pub fn with_tier(mut self, tier: SubscriptionTier) -> Self {
        self.subscription_tier = tier;
        self
    }

    /// Sets the resource limits.
    pub fn with_limits(mut self, limits: TenantLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// A user's membership in one tenant.
///
/// `permissions` holds per-operation overrides keyed by operation name:
/// `false` revokes an operation the role would allow, `true` grants one the
/// role would not. Overrides only ever apply inside this membership's tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantMembership {
    /// Member.
    pub user_id: UserId,
    /// Tenant the membership grants access to.
    pub tenant_id: TenantId,
    /// Stored role, possibly unrecognized.
    pub role: StoredRole,
    /// Per-operation overrides: `true` grants, `false` revokes.
    #[serde(default)]
    pub permissions: BTreeMap<String, bool>,
    /// False once revoked.
    pub is_active: bool,
    /// Who granted the membership.
    pub invited_by: Option<UserId>,
    /// When the user joined.
    pub joined_at: Option<DateTime<Utc>>,
    /// Creation time; orders memberships for primary tenant resolution.
    pub created_at: DateTime<Utc>,
}

impl TenantMembership {
    /// Creates an active membership joined now.
    pub fn new(
        user_id: impl Into<UserId>,
        tenant_id: impl Into<TenantId>,
        role: impl Into<StoredRole>,
    ) -> Self {
        let now = clock::now();
        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            role: role.into(),
            permissions: BTreeMap::new(),
            is_active: true,
            invited_by: None,
            joined_at: Some(now),
            created_at: now,
        }
    }

    /// Adds a permission override.
    pub fn with_permission(mut self, operation: impl Into<String>, allowed: bool) -> Self {
        self.permissions.insert(operation.into(), allowed);
        self
    }

    /// Records who invited this member.
    pub fn with_invited_by(mut self, inviter: impl Into<UserId>) -> Self {
        self.invited_by = Some(inviter.into());
        self
    }

    /// Overrides the creation timestamp.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Returns the override for an operation, if one is set.
    pub fn permission_override(&self, operation: &str) -> Option<bool> {
        self.permissions.get(operation).copied()
    }
}
