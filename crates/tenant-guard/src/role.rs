//! Role hierarchy.
//!
//! Roles form a total order:
//!
//! ```text
//! patient < staff < practice_manager < tenant_admin < platform_admin
//! ```
//!
//! A role satisfies every requirement at or below its own rank. The order is
//! monotonic: granting a higher role never removes a capability.
//!
//! Roles read back from storage go through [`StoredRole`], which keeps any
//! value this build does not recognize instead of rejecting the row. An
//! unrecognized role ranks below `patient` and satisfies nothing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A role in the tenant-scoped hierarchy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Access to the user's own records only.
    Patient,
    /// Front-desk and clinical staff.
    Staff,
    /// Runs a practice: billing, deletions, scheduling.
    PracticeManager,
    /// Administers memberships and compliance within one tenant.
    TenantAdmin,
    /// Operates the platform. Not bound to any tenant.
    PlatformAdmin,
}

impl Role {
    /// All roles in ascending order.
    pub const ALL: [Role; 5] = [
        Role::Patient,
        Role::Staff,
        Role::PracticeManager,
        Role::TenantAdmin,
        Role::PlatformAdmin,
    ];

    /// Returns the numeric rank of this role.
    pub fn rank(self) -> i8 {
        match self {
            Role::Patient => 0,
            Role::Staff => 1,
            Role::PracticeManager => 2,
            Role::TenantAdmin => 3,
            Role::PlatformAdmin => 4,
        }
    }

    /// Returns true if this role meets `required`.
    pub fn satisfies(self, required: Role) -> bool {
        self.rank() >= required.rank()
    }

    /// Returns true for roles that apply to every tenant.
    pub fn is_tenant_independent(self) -> bool {
        matches!(self, Role::PlatformAdmin)
    }

    /// Returns the canonical storage name of this role.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Staff => "staff",
            Role::PracticeManager => "practice_manager",
            Role::TenantAdmin => "tenant_admin",
            Role::PlatformAdmin => "platform_admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown role name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown role: '{0}'")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == normalized)
            .ok_or_else(|| UnknownRole(s.to_string()))
    }
}

/// Rank assigned to roles this build does not recognize.
pub const UNRANKED: i8 = -1;

/// A role as read from storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StoredRole {
    /// A role in the hierarchy.
    Known(Role),
    /// A value outside the hierarchy. Fails closed.
    Unrecognized(String),
}

impl StoredRole {
    /// Parses a stored role value. Never fails.
    pub fn parse(value: &str) -> Self {
        match value.parse::<Role>() {
            Ok(role) => StoredRole::Known(role),
            Err(_) => StoredRole::Unrecognized(value.to_string()),
        }
    }

    /// Returns the recognized role, if any.
    pub fn role(&self) -> Option<Role> {
        match self {
            StoredRole::Known(role) => Some(*role),
            StoredRole::Unrecognized(_) => None,
        }
    }

    /// Returns the rank, or [`UNRANKED`] for unrecognized values.
    pub fn rank(&self) -> i8 {
        self.role().map_or(UNRANKED, Role::rank)
    }

    /// Returns true if this role meets `required`. Unrecognized roles never do.
    pub fn satisfies(&self, required: Role) -> bool {
        self.role().is_some_and(|role| role.satisfies(required))
    }

    /// Returns true if this is the platform-wide administrator role.
    pub fn is_platform_admin(&self) -> bool {
        matches!(self, StoredRole::Known(Role::PlatformAdmin))
    }

    /// Returns the stored string form.
    pub fn as_str(&self) -> &str {
        match self {
            StoredRole::Known(role) => role.as_str(),
            StoredRole::Unrecognized(raw) => raw,
        }
    }
}

impl fmt::Display for StoredRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoredRole::Known(role) => write!(f, "{}", role),
            StoredRole::Unrecognized(raw) => write!(f, "unrecognized({})", raw),
        }
    }
}

impl From<Role> for StoredRole {
    fn from(role: Role) -> Self {
        StoredRole::Known(role)
    }
}

impl From<String> for StoredRole {
    fn from(value: String) -> Self {
        StoredRole::parse(&value)
    }
}

impl From<StoredRole> for String {
    fn from(role: StoredRole) -> Self {
        role.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranks_are_strictly_increasing() {
        for pair in Role::ALL.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_satisfies_matches_rank_order() {
        for a in Role::ALL {
            for b in Role::ALL {
                assert_eq!(a.satisfies(b), a.rank() >= b.rank(), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_satisfies_is_reflexive_and_transitive() {
        for a in Role::ALL {
            assert!(a.satisfies(a));
            for b in Role::ALL {
                for c in Role::ALL {
                    if a.satisfies(b) && b.satisfies(c) {
                        assert!(a.satisfies(c));
                    }
                }
            }
        }
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("tenant_admin".parse::<Role>().unwrap(), Role::TenantAdmin);
        assert_eq!(" Staff ".parse::<Role>().unwrap(), Role::Staff);
        assert!("superuser".parse::<Role>().is_err());
    }

    #[test]
    fn test_role_serde_names() {
        let json = serde_json::to_string(&Role::PracticeManager).unwrap();
        assert_eq!(json, "\"practice_manager\"");
        let role: Role = serde_json::from_str("\"platform_admin\"").unwrap();
        assert_eq!(role, Role::PlatformAdmin);
        assert!(serde_json::from_str::<Role>("\"owner\"").is_err());
    }

    #[test]
    fn test_unrecognized_role_fails_closed() {
        let stored = StoredRole::parse("billing_clerk");
        assert_eq!(stored, StoredRole::Unrecognized("billing_clerk".to_string()));
        assert_eq!(stored.rank(), UNRANKED);
        assert!(stored.rank() < Role::Patient.rank());
        for required in Role::ALL {
            assert!(!stored.satisfies(required));
        }
        assert_eq!(stored.role(), None);
    }

    #[test]
    fn test_stored_role_round_trips_raw_value() {
        let stored: StoredRole = serde_json::from_str("\"legacy_owner\"").unwrap();
        assert_eq!(serde_json::to_string(&stored).unwrap(), "\"legacy_owner\"");

        let known: StoredRole = serde_json::from_str("\"staff\"").unwrap();
        assert_eq!(known, StoredRole::Known(Role::Staff));
    }

    #[test]
    fn test_only_platform_admin_is_tenant_independent() {
        let independent: Vec<_> = Role::ALL
            .into_iter()
            .filter(|r| r.is_tenant_independent())
            .collect();
        assert_eq!(independent, vec![Role::PlatformAdmin]);
    }
}
