//! Operation to required-role policy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::role::Role;

/// Operation names used by the default policy.
pub mod operations {
    /// Read a patient record.
    pub const VIEW_PATIENT_RECORD: &str = "viewPatientRecord";
    /// Create or change a patient record.
    pub const EDIT_PATIENT_RECORD: &str = "editPatientRecord";
    /// Delete a patient record.
    pub const DELETE_PATIENT_RECORD: &str = "deletePatientRecord";
    /// Book, move or cancel appointments.
    pub const MANAGE_APPOINTMENTS: &str = "manageAppointments";
    /// Work with invoices and payments.
    pub const MANAGE_BILLING: &str = "manageBilling";
    /// Add, change or remove tenant members.
    pub const MANAGE_MEMBERS: &str = "manageMembers";
    /// Read the compliance report of one tenant.
    pub const VIEW_COMPLIANCE_REPORT: &str = "viewComplianceReport";
    /// Read the compliance report across all tenants.
    pub const VIEW_PLATFORM_COMPLIANCE: &str = "viewPlatformCompliance";
    /// Provision a new tenant.
    pub const CREATE_TENANT: &str = "createTenant";
    /// Deactivate a tenant.
    pub const DELETE_TENANT: &str = "deleteTenant";
}

/// Maps operations to the minimum role they require.
///
/// Operations missing from `requirements` need `default_role`, which
/// defaults to `platform_admin`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationPolicy {
    /// Role required by operations missing from `requirements`.
    #[serde(default = "default_role")]
    pub default_role: Role,

    /// Required role per operation name.
    #[serde(default = "default_requirements")]
    pub requirements: BTreeMap<String, Role>,
}

fn default_role() -> Role {
    Role::PlatformAdmin
}

fn default_requirements() -> BTreeMap<String, Role> {
    use operations::*;

    [
        (VIEW_PATIENT_RECORD, Role::Staff),
        (EDIT_PATIENT_RECORD, Role::Staff),
        (DELETE_PATIENT_RECORD, Role::PracticeManager),
        (MANAGE_APPOINTMENTS, Role::Staff),
        (MANAGE_BILLING, Role::PracticeManager),
        (MANAGE_MEMBERS, Role::TenantAdmin),
        (VIEW_COMPLIANCE_REPORT, Role::TenantAdmin),
        (VIEW_PLATFORM_COMPLIANCE, Role::PlatformAdmin),
        (CREATE_TENANT, Role::PlatformAdmin),
        (DELETE_TENANT, Role::PlatformAdmin),
    ]
    .into_iter()
    .map(|(op, role)| (op.to_string(), role))
    .collect()
}

impl Default for OperationPolicy {
    fn default() -> Self {
        Self {
            default_role: default_role(),
            requirements: default_requirements(),
        }
    }
}

impl OperationPolicy {
    /// Creates a policy with no configured operations.
    pub fn empty(default_role: Role) -> Self {
        Self {
            default_role,
            requirements: BTreeMap::new(),
        }
    }

    /// Adds or replaces a requirement.
    pub fn with_requirement(mut self, operation: impl Into<String>, role: Role) -> Self {
        self.requirements.insert(operation.into(), role);
        self
    }

    /// Returns the role an operation requires.
    pub fn required_role(&self, operation: &str) -> Role {
        self.requirements
            .get(operation)
            .copied()
            .unwrap_or(self.default_role)
    }

    /// Returns true if the operation has an explicit requirement.
    pub fn is_configured(&self, operation: &str) -> bool {
        self.requirements.contains_key(operation)
    }
}
