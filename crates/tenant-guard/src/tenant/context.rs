//! Tenant context for data access.
//!
//! A [`TenantContext`] is the proof that an authorization decision allowed a
//! user to act inside one tenant. It can only be built from an allow
//! [`Grant`], so holding one means the guard already ran.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id::{TenantId, UserId};
use crate::authz::Grant;
use crate::role::Role;

/// Request metadata carried into audit entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Client user agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Client IP address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Id correlating log lines of one request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Free-form additional fields.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl RequestMetadata {
    /// Creates empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Sets the client IP address.
    pub fn with_ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    /// Sets the correlation ID for request tracing.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Adds a free-form value.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// An authorized, tenant-scoped context for data access.
///
/// # Examples
///
/// Contexts come out of the access gateway after an allow decision:
///
/// ```no_run
/// # use helios_tenant_guard::{AccessGateway, GuardResult};
/// # async fn example(gateway: AccessGateway) -> GuardResult<()> {
/// use helios_tenant_guard::authz::operations;
/// use helios_tenant_guard::tenant::{RequestMetadata, TenantId, UserId};
///
/// let scope = gateway.begin_request(UserId::new("alice"), RequestMetadata::new());
/// let ctx = scope
///     .authorize(&TenantId::new("clinic-a"), operations::VIEW_PATIENT_RECORD)
///     .await?;
/// assert_eq!(ctx.tenant_id().as_str(), "clinic-a");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TenantContext {
    tenant_id: TenantId,
    user_id: UserId,
    role: Role,
    platform_bypass: bool,
    metadata: Arc<RequestMetadata>,
}

impl TenantContext {
    /// Builds a context from an allow decision.
    pub(crate) fn from_grant(grant: &Grant, metadata: Arc<RequestMetadata>) -> Self {
        Self {
            tenant_id: grant.tenant_id.clone(),
            user_id: grant.user_id.clone(),
            role: grant.role,
            platform_bypass: grant.platform_bypass,
            metadata,
        }
    }

    /// Returns the tenant ID.
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Returns the acting user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Returns the role the grant was made under.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns true if access came from the platform administrator bypass.
    pub fn is_platform_bypass(&self) -> bool {
        self.platform_bypass
    }

    /// Returns the request metadata.
    pub fn metadata(&self) -> &RequestMetadata {
        &self.metadata
    }

    /// Returns the correlation ID, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata.correlation_id.as_deref()
    }
}
