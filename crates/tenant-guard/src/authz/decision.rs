//! Pure authorization decisions.
//!
//! Decisions are a function of the user's memberships, the target tenant and
//! the required role. Nothing here performs I/O or logs; the same inputs
//! always give the same [`Decision`].

use std::fmt;

use serde::{Deserialize, Serialize};

use super::policy::OperationPolicy;
use crate::error::{AccessScope, AuthzError};
use crate::role::{Role, StoredRole};
use crate::tenant::{TenantId, TenantMembership, UserId};

/// Why access was denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum DenyReason {
    /// The user has no active membership in the target tenant.
    NoTenantAccess,
    /// The user's role in the tenant is below the requirement.
    InsufficientRole { actual: StoredRole, required: Role },
    /// The record belongs to a tenant other than the target.
    ResourceTenantMismatch { resource_tenant: TenantId },
    /// A membership override revokes the operation.
    PermissionRevoked { operation: String },
}

impl DenyReason {
    /// Returns a stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::NoTenantAccess => "no_tenant_access",
            DenyReason::InsufficientRole { .. } => "insufficient_role",
            DenyReason::ResourceTenantMismatch { .. } => "resource_tenant_mismatch",
            DenyReason::PermissionRevoked { .. } => "permission_revoked",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::NoTenantAccess => write!(f, "no active membership in tenant"),
            DenyReason::InsufficientRole { actual, required } => {
                write!(f, "role {} does not satisfy {}", actual, required)
            }
            DenyReason::ResourceTenantMismatch { resource_tenant } => {
                write!(f, "resource belongs to tenant {}", resource_tenant)
            }
            DenyReason::PermissionRevoked { operation } => {
                write!(f, "operation {} revoked for this membership", operation)
            }
        }
    }
}

/// The result of an allow decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    /// User the access was granted to.
    pub user_id: UserId,
    /// Tenant the access applies to.
    pub tenant_id: TenantId,
    /// Role the access was granted under.
    pub role: Role,
    /// Granted through the platform administrator bypass.
    pub platform_bypass: bool,
}

/// An authorization decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Access is allowed.
    Allow(Grant),
    /// Access is denied, with the reason.
    Deny(DenyReason),
}

impl Decision {
    /// Returns true for an allow decision.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }

    /// Returns the deny reason, if denied.
    pub fn deny_reason(&self) -> Option<&DenyReason> {
        match self {
            Decision::Allow(_) => None,
            Decision::Deny(reason) => Some(reason),
        }
    }

    /// Converts into a result, turning a denial into [`AuthzError::Denied`].
    pub fn into_result(self, user_id: &UserId, tenant_id: &TenantId) -> Result<Grant, AuthzError> {
        match self {
            Decision::Allow(grant) => Ok(grant),
            Decision::Deny(reason) => Err(AuthzError::Denied {
                user_id: user_id.clone(),
                scope: AccessScope::Tenant(tenant_id.clone()),
                reason,
            }),
        }
    }
}

/// Decides whether `user_id` may act in `tenant_id` with at least `required`.
///
/// Evaluation order:
///
/// 1. a supplied `resource_tenant` that differs from the target denies
/// 2. an active `platform_admin` membership in any tenant allows
/// 3. no active membership in the target tenant denies
/// 4. otherwise the membership role must satisfy `required`
///
/// Only active memberships belonging to `user_id` are considered.
///
/// # Examples
///
/// ```
/// use helios_tenant_guard::authz::{decide, Decision, DenyReason};
/// use helios_tenant_guard::role::Role;
/// use helios_tenant_guard::tenant::{TenantId, TenantMembership, UserId};
///
/// let alice = UserId::new("alice");
/// let memberships = vec![TenantMembership::new("alice", "clinic-a", Role::Staff)];
///
/// let decision = decide(&alice, &memberships, &TenantId::new("clinic-a"), Role::Staff, None);
/// assert!(decision.is_allowed());
///
/// let decision = decide(&alice, &memberships, &TenantId::new("clinic-b"), Role::Staff, None);
/// assert_eq!(decision, Decision::Deny(DenyReason::NoTenantAccess));
/// ```
pub fn decide(
    user_id: &UserId,
    memberships: &[TenantMembership],
    tenant_id: &TenantId,
    required: Role,
    resource_tenant: Option<&TenantId>,
) -> Decision {
    evaluate(user_id, memberships, tenant_id, required, None, resource_tenant)
}

/// Decides an operation using the configured policy and membership overrides.
///
/// The required role comes from `policy`. When the target membership holds a
/// recognized role, an override for `operation` takes precedence: `false`
/// revokes and `true` grants. Overrides never cross tenants and do not
/// apply to the platform administrator bypass.
pub fn decide_operation(
    user_id: &UserId,
    memberships: &[TenantMembership],
    tenant_id: &TenantId,
    operation: &str,
    policy: &OperationPolicy,
    resource_tenant: Option<&TenantId>,
) -> Decision {
    let required = policy.required_role(operation);
    evaluate(
        user_id,
        memberships,
        tenant_id,
        required,
        Some(operation),
        resource_tenant,
    )
}

fn evaluate(
    user_id: &UserId,
    memberships: &[TenantMembership],
    tenant_id: &TenantId,
    required: Role,
    operation: Option<&str>,
    resource_tenant: Option<&TenantId>,
) -> Decision {
    if let Some(resource_tenant) = resource_tenant {
        if resource_tenant != tenant_id {
            return Decision::Deny(DenyReason::ResourceTenantMismatch {
                resource_tenant: resource_tenant.clone(),
            });
        }
    }

    let mut active = memberships
        .iter()
        .filter(|m| m.is_active && &m.user_id == user_id);

    if active.clone().any(|m| m.role.is_platform_admin()) {
        return Decision::Allow(Grant {
            user_id: user_id.clone(),
            tenant_id: tenant_id.clone(),
            role: Role::PlatformAdmin,
            platform_bypass: true,
        });
    }

    let Some(membership) = active.find(|m| &m.tenant_id == tenant_id) else {
        return Decision::Deny(DenyReason::NoTenantAccess);
    };

    let Some(role) = membership.role.role() else {
        return Decision::Deny(DenyReason::InsufficientRole {
            actual: membership.role.clone(),
            required,
        });
    };

    let allowed = match operation.and_then(|op| membership.permission_override(op)) {
        Some(false) => {
            return Decision::Deny(DenyReason::PermissionRevoked {
                operation: operation.unwrap_or_default().to_string(),
            });
        }
        Some(true) => true,
        None => role.satisfies(required),
    };

    if allowed {
        Decision::Allow(Grant {
            user_id: user_id.clone(),
            tenant_id: tenant_id.clone(),
            role,
            platform_bypass: false,
        })
    } else {
        Decision::Deny(DenyReason::InsufficientRole {
            actual: membership.role.clone(),
            required,
        })
    }
}

/// Returns the highest recognized role the user holds in any tenant.
pub fn highest_role(user_id: &UserId, memberships: &[TenantMembership]) -> Option<Role> {
    memberships
        .iter()
        .filter(|m| m.is_active && &m.user_id == user_id)
        .filter_map(|m| m.role.role())
        .max()
}

#[cfg(test)]
mod tests {
    use super::super::operations::*;
    use super::*;

    fn alice() -> UserId {
        UserId::new("alice")
    }

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id)
    }

    // ========================================================================
    // Role checks
    // ========================================================================

    #[test]
    fn test_staff_cannot_act_as_tenant_admin() {
        let memberships = vec![TenantMembership::new("alice", "clinic-a", Role::Staff)];
        let decision = decide(&alice(), &memberships, &tenant("clinic-a"), Role::TenantAdmin, None);
        assert_eq!(
            decision,
            Decision::Deny(DenyReason::InsufficientRole {
                actual: StoredRole::Known(Role::Staff),
                required: Role::TenantAdmin,
            })
        );
    }

    #[test]
    fn test_staff_allowed_as_staff() {
        let memberships = vec![TenantMembership::new("alice", "clinic-a", Role::Staff)];
        let decision = decide(&alice(), &memberships, &tenant("clinic-a"), Role::Staff, None);
        match decision {
            Decision::Allow(grant) => {
                assert_eq!(grant.role, Role::Staff);
                assert!(!grant.platform_bypass);
            }
            Decision::Deny(reason) => panic!("expected allow, got {reason}"),
        }
    }

    #[test]
    fn test_higher_role_satisfies_lower_requirement() {
        let memberships = vec![TenantMembership::new("alice", "clinic-a", Role::TenantAdmin)];
        let clinic_a = tenant("clinic-a");
        for required in [Role::Patient, Role::Staff, Role::PracticeManager, Role::TenantAdmin] {
            assert!(decide(&alice(), &memberships, &clinic_a, required, None).is_allowed());
        }
        assert!(
            !decide(&alice(), &memberships, &clinic_a, Role::PlatformAdmin, None).is_allowed()
        );
    }

    // ========================================================================
    // Tenant scoping
    // ========================================================================

    #[test]
    fn test_role_in_one_tenant_grants_nothing_in_another() {
        let memberships = vec![TenantMembership::new("alice", "clinic-a", Role::TenantAdmin)];
        let decision = decide(&alice(), &memberships, &tenant("clinic-b"), Role::Patient, None);
        assert_eq!(decision, Decision::Deny(DenyReason::NoTenantAccess));
    }

    #[test]
    fn test_inactive_membership_is_ignored() {
        let mut membership = TenantMembership::new("alice", "clinic-a", Role::TenantAdmin);
        membership.is_active = false;
        let decision = decide(&alice(), &[membership], &tenant("clinic-a"), Role::Staff, None);
        assert_eq!(decision, Decision::Deny(DenyReason::NoTenantAccess));
    }

    #[test]
    fn test_other_users_memberships_are_ignored() {
        let memberships = vec![TenantMembership::new("bob", "clinic-a", Role::PlatformAdmin)];
        let decision = decide(&alice(), &memberships, &tenant("clinic-a"), Role::Staff, None);
        assert_eq!(decision, Decision::Deny(DenyReason::NoTenantAccess));
    }

    #[test]
    fn test_platform_admin_bypasses_tenant_scope() {
        let bob = UserId::new("bob");
        let memberships = vec![TenantMembership::new("bob", "clinic-a", Role::PlatformAdmin)];
        let decision = decide(&bob, &memberships, &tenant("clinic-b"), Role::TenantAdmin, None);
        match decision {
            Decision::Allow(grant) => {
                assert!(grant.platform_bypass);
                assert_eq!(grant.tenant_id, tenant("clinic-b"));
            }
            Decision::Deny(reason) => panic!("expected allow, got {reason}"),
        }
    }

    #[test]
    fn test_resource_tenant_mismatch_denies_even_platform_admin() {
        let bob = UserId::new("bob");
        let memberships = vec![TenantMembership::new("bob", "clinic-a", Role::PlatformAdmin)];
        let decision = decide(
            &bob,
            &memberships,
            &tenant("clinic-a"),
            Role::Staff,
            Some(&tenant("clinic-b")),
        );
        assert_eq!(decision.deny_reason().map(DenyReason::code), Some("resource_tenant_mismatch"));
    }

    #[test]
    fn test_unrecognized_role_is_denied() {
        let memberships = vec![TenantMembership::new(
            "alice",
            "clinic-a",
            StoredRole::parse("superuser"),
        )];
        let decision = decide(&alice(), &memberships, &tenant("clinic-a"), Role::Patient, None);
        assert_eq!(decision.deny_reason().map(DenyReason::code), Some("insufficient_role"));
    }

    // ========================================================================
    // Operation policy and overrides
    // ========================================================================

    #[test]
    fn test_operation_uses_policy() {
        let policy = OperationPolicy::default();
        let memberships = vec![TenantMembership::new("alice", "clinic-a", Role::Staff)];
        let view = decide_operation(
            &alice(),
            &memberships,
            &tenant("clinic-a"),
            VIEW_PATIENT_RECORD,
            &policy,
            None,
        );
        let delete = decide_operation(
            &alice(),
            &memberships,
            &tenant("clinic-a"),
            DELETE_PATIENT_RECORD,
            &policy,
            None,
        );
        assert!(view.is_allowed());
        assert!(!delete.is_allowed());
    }

    #[test]
    fn test_override_revokes_within_tenant() {
        let policy = OperationPolicy::default();
        let memberships = vec![
            TenantMembership::new("alice", "clinic-a", Role::PracticeManager)
                .with_permission(MANAGE_BILLING, false),
        ];
        let decision = decide_operation(
            &alice(),
            &memberships,
            &tenant("clinic-a"),
            MANAGE_BILLING,
            &policy,
            None,
        );
        assert_eq!(
            decision,
            Decision::Deny(DenyReason::PermissionRevoked {
                operation: MANAGE_BILLING.to_string()
            })
        );
    }

    #[test]
    fn test_override_grants_only_in_its_own_tenant() {
        let policy = OperationPolicy::default();
        let memberships = vec![
            TenantMembership::new("alice", "clinic-a", Role::Staff)
                .with_permission(MANAGE_BILLING, true),
            TenantMembership::new("alice", "clinic-b", Role::Staff),
        ];
        let a = decide_operation(
            &alice(),
            &memberships,
            &tenant("clinic-a"),
            MANAGE_BILLING,
            &policy,
            None,
        );
        let b = decide_operation(
            &alice(),
            &memberships,
            &tenant("clinic-b"),
            MANAGE_BILLING,
            &policy,
            None,
        );
        assert!(a.is_allowed());
        assert!(!b.is_allowed());
    }

    #[test]
    fn test_override_cannot_rescue_unrecognized_role() {
        let policy = OperationPolicy::default();
        let memberships = vec![
            TenantMembership::new("alice", "clinic-a", StoredRole::parse("legacy"))
                .with_permission(VIEW_PATIENT_RECORD, true),
        ];
        let decision = decide_operation(
            &alice(),
            &memberships,
            &tenant("clinic-a"),
            VIEW_PATIENT_RECORD,
            &policy,
            None,
        );
        assert!(!decision.is_allowed());
    }

    #[test]
    fn test_into_result() {
        let err = Decision::Deny(DenyReason::NoTenantAccess)
            .into_result(&alice(), &tenant("clinic-b"))
            .unwrap_err();
        assert_eq!(err.reason(), &DenyReason::NoTenantAccess);
    }

    #[test]
    fn test_highest_role() {
        let memberships = vec![
            TenantMembership::new("alice", "clinic-a", Role::Staff),
            TenantMembership::new("alice", "clinic-b", Role::TenantAdmin),
            TenantMembership::new("alice", "clinic-c", StoredRole::parse("root")),
        ];
        assert_eq!(highest_role(&alice(), &memberships), Some(Role::TenantAdmin));
        assert_eq!(highest_role(&UserId::new("carol"), &memberships), None);
    }
}
