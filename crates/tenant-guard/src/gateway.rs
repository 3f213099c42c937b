//! Request boundary for the application layer.
//!
//! An [`AccessGateway`] is built once per process. Each incoming request
//! calls [`AccessGateway::begin_request`] and works through the returned
//! [`RequestScope`], which owns the request's membership cache. Every
//! operation on the scope authorizes first, then acts.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::audit::{AuditAction, AuditLogEntry, AuditLogger, AuditRecord, AuditStore, TimeWindow};
use crate::authz::{
    Decision, DenyReason, OperationPolicy, decide, decide_operation, highest_role, operations,
};
use crate::compliance::{ComplianceAggregator, ComplianceSnapshot};
use crate::config::GuardConfig;
use crate::error::{
    AccessScope, AuthzError, BackendError, ConfigError, GuardError, GuardResult, ResourceError,
};
use crate::isolation::TenantIsolationFilter;
use crate::membership::{MembershipCache, MembershipResolver, MembershipStore, TenantStore};
use crate::role::{Role, StoredRole};
use crate::store::RecordStore;
use crate::tenant::{
    RequestMetadata, Tenant, TenantContext, TenantId, TenantIdValidator, TenantMembership, UserId,
};

/// Tenant id recorded on denials of platform-wide operations.
pub const PLATFORM_TENANT: &str = "platform";

const MEMBERSHIPS_TABLE: &str = "tenant_memberships";
const TENANTS_TABLE: &str = "tenants";

/// Entry point for authorized, audited access.
#[derive(Clone)]
pub struct AccessGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    memberships: MembershipResolver,
    tenants: Arc<dyn TenantStore>,
    records: TenantIsolationFilter,
    audit: AuditLogger,
    compliance: ComplianceAggregator,
    policy: OperationPolicy,
    validator: TenantIdValidator,
}

impl std::fmt::Debug for AccessGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGateway")
            .field("policy", &self.inner.policy)
            .field("audit", &self.inner.audit)
            .finish_non_exhaustive()
    }
}

impl AccessGateway {
    /// Creates a gateway over one backend that provides every store.
    pub fn new<B>(backend: Arc<B>, config: &GuardConfig) -> GuardResult<Self>
    where
        B: MembershipStore + TenantStore + RecordStore + AuditStore + 'static,
    {
        let audit = AuditLogger::new(backend.clone(), config.audit.clone());
        Self::with_parts(backend.clone(), backend.clone(), backend, audit, config)
    }

    /// Creates a gateway from separate stores and a prepared audit logger.
    pub fn with_parts(
        memberships: Arc<dyn MembershipStore>,
        tenants: Arc<dyn TenantStore>,
        records: Arc<dyn RecordStore>,
        audit: AuditLogger,
        config: &GuardConfig,
    ) -> GuardResult<Self> {
        config
            .validate()
            .map_err(|problems| ConfigError::Invalid { problems })?;
        let validator = TenantIdValidator::new(&config.isolation).map_err(|e| {
            ConfigError::Invalid {
                problems: vec![format!("Invalid tenant id pattern: {}", e)],
            }
        })?;

        let filter = TenantIsolationFilter::new(
            records,
            audit.clone(),
            config.isolation.sensitive_tables.iter().cloned(),
        );
        let compliance =
            ComplianceAggregator::new(audit.store().clone(), config.compliance.clone());

        Ok(Self {
            inner: Arc::new(GatewayInner {
                memberships: MembershipResolver::new(memberships),
                tenants,
                records: filter,
                audit,
                compliance,
                policy: config.operations.clone(),
                validator,
            }),
        })
    }

    /// Returns the audit logger.
    pub fn audit(&self) -> &AuditLogger {
        &self.inner.audit
    }

    /// Returns the operation policy.
    pub fn policy(&self) -> &OperationPolicy {
        &self.inner.policy
    }

    /// Starts a request for `user_id` with a fresh membership cache.
    pub fn begin_request(&self, user_id: UserId, metadata: RequestMetadata) -> RequestScope {
        RequestScope {
            gateway: self.clone(),
            cache: MembershipCache::new(self.inner.memberships.clone()),
            user_id,
            metadata: Arc::new(metadata),
        }
    }
}

/// One request's view of the gateway.
///
/// Memberships are resolved at most once per scope unless invalidated, so
/// a revocation takes effect on the next request.
#[derive(Debug)]
pub struct RequestScope {
    gateway: AccessGateway,
    cache: MembershipCache,
    user_id: UserId,
    metadata: Arc<RequestMetadata>,
}

impl RequestScope {
    /// Returns the acting user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Returns the request metadata.
    pub fn metadata(&self) -> &RequestMetadata {
        &self.metadata
    }

    /// Returns the user's active memberships.
    pub async fn memberships(&self) -> Arc<Vec<TenantMembership>> {
        self.cache.memberships(&self.user_id).await
    }

    /// Returns the tenant the user lands in by default.
    pub async fn primary_tenant(&self) -> Option<TenantId> {
        self.cache.primary_tenant(&self.user_id).await
    }

    /// Drops this request's cached memberships.
    pub fn invalidate_memberships(&self) {
        self.cache.invalidate(&self.user_id);
    }

    /// Returns the tenant isolation filter for data access.
    pub fn records(&self) -> &TenantIsolationFilter {
        &self.gateway.inner.records
    }

    // ========================================================================
    // Authorization
    // ========================================================================

    /// Authorizes an operation in a tenant and returns the data-access context.
    pub async fn authorize(
        &self,
        tenant_id: &TenantId,
        operation: &str,
    ) -> GuardResult<TenantContext> {
        self.authorize_resource(tenant_id, operation, None).await
    }

    /// Authorizes an operation on a record owned by `resource_tenant`.
    pub async fn authorize_resource(
        &self,
        tenant_id: &TenantId,
        operation: &str,
        resource_tenant: Option<&TenantId>,
    ) -> GuardResult<TenantContext> {
        self.validate_tenant(tenant_id)?;
        let memberships = self.memberships().await;
        let decision = decide_operation(
            &self.user_id,
            &memberships,
            tenant_id,
            operation,
            &self.gateway.inner.policy,
            resource_tenant,
        );
        self.conclude(tenant_id, operation, decision).await
    }

    /// Authorizes by minimum role rather than by operation.
    pub async fn authorize_role(
        &self,
        tenant_id: &TenantId,
        required: Role,
        resource_tenant: Option<&TenantId>,
    ) -> GuardResult<TenantContext> {
        self.validate_tenant(tenant_id)?;
        let memberships = self.memberships().await;
        let decision = decide(
            &self.user_id,
            &memberships,
            tenant_id,
            required,
            resource_tenant,
        );
        self.conclude(tenant_id, required.as_str(), decision).await
    }

    /// Returns the decision for an operation without auditing it.
    pub async fn check(&self, tenant_id: &TenantId, operation: &str) -> Decision {
        let memberships = self.memberships().await;
        decide_operation(
            &self.user_id,
            &memberships,
            tenant_id,
            operation,
            &self.gateway.inner.policy,
            None,
        )
    }

    fn validate_tenant(&self, tenant_id: &TenantId) -> GuardResult<()> {
        self.gateway.inner.validator.validate(tenant_id).map_err(|e| {
            warn!(user_id = %self.user_id, error = %e, "Rejected tenant id");
            GuardError::from(e)
        })
    }

    async fn conclude(
        &self,
        tenant_id: &TenantId,
        operation: &str,
        decision: Decision,
    ) -> GuardResult<TenantContext> {
        match decision {
            Decision::Allow(grant) => {
                debug!(
                    user_id = %self.user_id,
                    tenant_id = %tenant_id,
                    operation,
                    role = %grant.role,
                    platform_bypass = grant.platform_bypass,
                    "Access granted"
                );
                Ok(TenantContext::from_grant(&grant, self.metadata.clone()))
            }
            Decision::Deny(reason) => {
                self.deny(AccessScope::Tenant(tenant_id.clone()), tenant_id, operation, reason)
                    .await
            }
        }
    }

    async fn deny<T>(
        &self,
        scope: AccessScope,
        audit_tenant: &TenantId,
        operation: &str,
        reason: DenyReason,
    ) -> GuardResult<T> {
        info!(
            user_id = %self.user_id,
            scope = %scope,
            operation,
            reason = reason.code(),
            "Access denied"
        );
        self.gateway
            .inner
            .audit
            .record_denial(&self.user_id, audit_tenant, operation, &reason, &self.metadata)
            .await;

        Err(AuthzError::Denied {
            user_id: self.user_id.clone(),
            scope,
            reason,
        }
        .into())
    }

    /// Authorizes an operation that is not scoped to one tenant.
    ///
    /// Allowed when any active membership's role meets the operation's
    /// requirement. Membership overrides do not apply.
    async fn authorize_platform(
        &self,
        operation: &str,
        audit_tenant: &TenantId,
    ) -> GuardResult<Role> {
        let memberships = self.memberships().await;
        let required = self.gateway.inner.policy.required_role(operation);

        match highest_role(&self.user_id, &memberships) {
            Some(role) if role.satisfies(required) => Ok(role),
            Some(role) => {
                let reason = DenyReason::InsufficientRole {
                    actual: role.into(),
                    required,
                };
                self.deny(AccessScope::Platform, audit_tenant, operation, reason)
                    .await
            }
            None => {
                self.deny(
                    AccessScope::Platform,
                    audit_tenant,
                    operation,
                    DenyReason::NoTenantAccess,
                )
                .await
            }
        }
    }

    fn entry(&self, tenant_id: &TenantId, table: &str, action: AuditAction) -> AuditLogEntry {
        AuditLogEntry::new(self.user_id.clone(), tenant_id.clone(), table, action)
            .with_metadata((*self.metadata).clone())
    }

    // ========================================================================
    // Membership administration
    // ========================================================================

    /// Denies membership changes to a member whose current role in the
    /// tenant outranks the actor's.
    async fn ensure_not_outranked(
        &self,
        ctx: &TenantContext,
        tenant_id: &TenantId,
        user_id: &UserId,
    ) -> GuardResult<()> {
        let members = self
            .gateway
            .inner
            .memberships
            .store()
            .tenant_members(tenant_id)
            .await?;
        let Some(target) = members.iter().find(|m| &m.user_id == user_id) else {
            return Ok(());
        };
        if target.role.rank() <= ctx.role().rank() {
            return Ok(());
        }

        let required = match &target.role {
            StoredRole::Known(role) => *role,
            StoredRole::Unrecognized(_) => Role::PlatformAdmin,
        };
        let reason = DenyReason::InsufficientRole {
            actual: ctx.role().into(),
            required,
        };
        self.deny(
            AccessScope::Tenant(tenant_id.clone()),
            tenant_id,
            operations::MANAGE_MEMBERS,
            reason,
        )
        .await
    }

    /// Grants `user_id` a role in a tenant, reactivating a past membership.
    ///
    /// Requires `manageMembers`. Members cannot grant a role above their own,
    /// nor change the membership of someone who outranks them.
    pub async fn add_member(
        &self,
        tenant_id: &TenantId,
        user_id: &UserId,
        role: Role,
    ) -> GuardResult<TenantMembership> {
        let ctx = self.authorize(tenant_id, operations::MANAGE_MEMBERS).await?;

        if !ctx.role().satisfies(role) {
            let reason = DenyReason::InsufficientRole {
                actual: ctx.role().into(),
                required: role,
            };
            return self
                .deny(
                    AccessScope::Tenant(tenant_id.clone()),
                    tenant_id,
                    operations::MANAGE_MEMBERS,
                    reason,
                )
                .await;
        }

        let tenant = self.active_tenant(tenant_id).await?;
        self.ensure_not_outranked(&ctx, tenant_id, user_id).await?;

        let store = self.gateway.inner.memberships.store();
        let membership = TenantMembership::new(user_id.clone(), tenant_id.clone(), role)
            .with_invited_by(self.user_id.clone());
        let previous = match tenant.limits.max_users {
            Some(max) => store.upsert_membership_capped(&membership, max).await?,
            None => store.upsert_membership(&membership).await?,
        };

        let action = if previous.is_some() {
            AuditAction::Update
        } else {
            AuditAction::Create
        };
        let mut entry = self
            .entry(tenant_id, MEMBERSHIPS_TABLE, action)
            .with_record_id(membership_key(user_id, tenant_id))
            .with_new_values(to_json(&membership)?);
        if let Some(previous) = &previous {
            entry = entry.with_old_values(to_json(previous)?);
        }
        self.gateway.inner.audit.record(entry).await;

        info!(
            user_id = %self.user_id,
            tenant_id = %tenant_id,
            member = %user_id,
            role = %role,
            "Membership granted"
        );
        self.cache.invalidate(user_id);
        Ok(membership)
    }

    /// Deactivates a member of a tenant. Requires `manageMembers`.
    ///
    /// Members whose role outranks the actor's cannot be removed.
    pub async fn remove_member(
        &self,
        tenant_id: &TenantId,
        user_id: &UserId,
    ) -> GuardResult<TenantMembership> {
        let ctx = self.authorize(tenant_id, operations::MANAGE_MEMBERS).await?;
        self.ensure_not_outranked(&ctx, tenant_id, user_id).await?;

        let store = self.gateway.inner.memberships.store();
        let previous = store.deactivate_membership(user_id, tenant_id).await?;
        let current = TenantMembership {
            is_active: false,
            ..previous.clone()
        };

        let entry = self
            .entry(tenant_id, MEMBERSHIPS_TABLE, AuditAction::Update)
            .with_record_id(membership_key(user_id, tenant_id))
            .with_old_values(to_json(&previous)?)
            .with_new_values(to_json(&current)?);
        self.gateway.inner.audit.record(entry).await;

        info!(
            user_id = %self.user_id,
            tenant_id = %tenant_id,
            member = %user_id,
            "Membership revoked"
        );
        self.cache.invalidate(user_id);
        Ok(current)
    }

    /// Stores or clears the acting user's primary tenant preference.
    ///
    /// The user must hold an active membership in the preferred tenant.
    pub async fn set_primary_tenant(&self, tenant_id: Option<&TenantId>) -> GuardResult<()> {
        if let Some(tenant_id) = tenant_id {
            self.validate_tenant(tenant_id)?;
            let memberships = self.memberships().await;
            if !memberships.iter().any(|m| &m.tenant_id == tenant_id) {
                return Err(AuthzError::Denied {
                    user_id: self.user_id.clone(),
                    scope: AccessScope::Tenant(tenant_id.clone()),
                    reason: DenyReason::NoTenantAccess,
                }
                .into());
            }
        }

        self.gateway
            .inner
            .memberships
            .store()
            .set_primary_tenant(&self.user_id, tenant_id)
            .await
    }

    // ========================================================================
    // Tenant administration
    // ========================================================================

    /// Creates a tenant. Requires `createTenant`.
    pub async fn create_tenant(&self, tenant: Tenant) -> GuardResult<Tenant> {
        self.validate_tenant(&tenant.id)?;
        self.authorize_platform(operations::CREATE_TENANT, &tenant.id)
            .await?;

        self.gateway.inner.tenants.create_tenant(&tenant).await?;

        let entry = self
            .entry(&tenant.id, TENANTS_TABLE, AuditAction::Create)
            .with_record_id(tenant.id.as_str())
            .with_new_values(to_json(&tenant)?);
        self.gateway.inner.audit.record(entry).await;

        info!(user_id = %self.user_id, tenant_id = %tenant.id, "Tenant created");
        Ok(tenant)
    }

    /// Deactivates a tenant. Requires `deleteTenant`.
    ///
    /// Memberships in an inactive tenant stop resolving.
    pub async fn deactivate_tenant(&self, tenant_id: &TenantId) -> GuardResult<Tenant> {
        self.authorize(tenant_id, operations::DELETE_TENANT).await?;

        let previous = self.gateway.inner.tenants.deactivate_tenant(tenant_id).await?;
        let current = Tenant {
            is_active: false,
            ..previous.clone()
        };

        let entry = self
            .entry(tenant_id, TENANTS_TABLE, AuditAction::Update)
            .with_record_id(tenant_id.as_str())
            .with_old_values(to_json(&previous)?)
            .with_new_values(to_json(&current)?);
        self.gateway.inner.audit.record(entry).await;

        info!(user_id = %self.user_id, tenant_id = %tenant_id, "Tenant deactivated");
        self.cache.clear();
        Ok(current)
    }

    async fn active_tenant(&self, tenant_id: &TenantId) -> GuardResult<Tenant> {
        match self.gateway.inner.tenants.get_tenant(tenant_id).await? {
            Some(tenant) if tenant.is_active => Ok(tenant),
            Some(_) => Err(ResourceError::TenantInactive {
                tenant_id: tenant_id.clone(),
            }
            .into()),
            None => Err(ResourceError::TenantNotFound {
                tenant_id: tenant_id.clone(),
            }
            .into()),
        }
    }

    // ========================================================================
    // Compliance
    // ========================================================================

    /// Summarizes the audit log for one tenant, or all tenants when `None`.
    ///
    /// A tenant report requires `viewComplianceReport` in that tenant; a
    /// platform report requires `viewPlatformCompliance`.
    pub async fn compliance_summary(
        &self,
        tenant_id: Option<&TenantId>,
        window: TimeWindow,
    ) -> GuardResult<ComplianceSnapshot> {
        match tenant_id {
            Some(tenant_id) => {
                self.authorize(tenant_id, operations::VIEW_COMPLIANCE_REPORT)
                    .await?;
            }
            None => {
                self.authorize_platform(
                    operations::VIEW_PLATFORM_COMPLIANCE,
                    &TenantId::new(PLATFORM_TENANT),
                )
                .await?;
            }
        }

        self.gateway
            .inner
            .compliance
            .summarize(tenant_id, window)
            .await
    }

    /// Returns every audit entry for one record. Requires `viewComplianceReport`.
    pub async fn access_history(
        &self,
        tenant_id: &TenantId,
        table_name: &str,
        record_id: &str,
        window: TimeWindow,
    ) -> GuardResult<Vec<AuditRecord>> {
        self.authorize(tenant_id, operations::VIEW_COMPLIANCE_REPORT)
            .await?;

        self.gateway
            .inner
            .compliance
            .access_history(tenant_id, table_name, record_id, window)
            .await
    }
}

fn membership_key(user_id: &UserId, tenant_id: &TenantId) -> String {
    format!("{}:{}", user_id, tenant_id)
}

fn to_json<T: Serialize>(value: &T) -> GuardResult<Value> {
    serde_json::to_value(value).map_err(|e| {
        GuardError::Backend(BackendError::SerializationError {
            message: format!("Failed to serialize audit values: {}", e),
        })
    })
}
