//! Command execution.
//!
//! Provisioning commands write straight to the stores, the way an operator
//! bootstraps a platform that has no administrators yet. Every change is
//! still recorded in the audit trail under the configured actor.

use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use chrono::Duration;
use serde_json::{Value, json};
use tracing::{debug, info};

use helios_tenant_guard::audit::{AuditAction, AuditLogEntry, AuditLogger, TimeWindow};
use helios_tenant_guard::backends::sqlite::SqliteBackend;
use helios_tenant_guard::compliance::ComplianceAggregator;
use helios_tenant_guard::membership::{MembershipStore, TenantStore};
use helios_tenant_guard::tenant::{
    RequestMetadata, SubscriptionTier, Tenant, TenantIdValidator, TenantLimits, TenantMembership,
};
use helios_tenant_guard::{AccessGateway, GuardConfig, Role, TenantId, UserId};

use crate::config::{Command, GrantArgs, TenantCommand};

const SOURCE: &str = "guard-admin";

/// An opened database plus the guard services the commands need.
pub struct Admin {
    backend: Arc<SqliteBackend>,
    gateway: AccessGateway,
    audit: AuditLogger,
    compliance: ComplianceAggregator,
    validator: TenantIdValidator,
    actor: UserId,
}

impl Admin {
    /// Opens the database and brings its schema up to date.
    pub fn open(database: &str, config: &GuardConfig, actor: &str) -> anyhow::Result<Self> {
        info!(database, "Opening guard database");
        let backend = Arc::new(SqliteBackend::with_config(database, config.sqlite.clone())?);
        backend.init_schema()?;

        let audit = AuditLogger::new(backend.clone(), config.audit.clone());
        let gateway = AccessGateway::with_parts(
            backend.clone(),
            backend.clone(),
            backend.clone(),
            audit.clone(),
            config,
        )?;
        let compliance = ComplianceAggregator::new(backend.clone(), config.compliance.clone());
        let validator = TenantIdValidator::new(&config.isolation)?;

        Ok(Self {
            backend,
            gateway,
            audit,
            compliance,
            validator,
            actor: UserId::new(actor),
        })
    }

    /// Runs one command and returns its JSON output.
    ///
    /// Entries queued by the command are delivered before returning.
    pub async fn run(&self, command: &Command) -> anyhow::Result<Value> {
        let output = match command {
            Command::Init => json!({ "initialized": true }),
            Command::Tenant(TenantCommand::Create {
                id,
                name,
                specialty,
                tier,
                max_users,
            }) => {
                let mut tenant = Tenant::new(id.as_str(), name.as_str())
                    .with_tier(SubscriptionTier::parse(tier))
                    .with_limits(TenantLimits {
                        max_users: *max_users,
                        ..Default::default()
                    });
                if let Some(specialty) = specialty {
                    tenant = tenant.with_specialty(specialty.as_str());
                }
                self.create_tenant(tenant).await?
            }
            Command::Tenant(TenantCommand::Deactivate { id }) => {
                self.deactivate_tenant(&TenantId::new(id.as_str())).await?
            }
            Command::Grant(args) => self.grant(args).await?,
            Command::Revoke { user, tenant } => {
                self.revoke(&UserId::new(user.as_str()), &TenantId::new(tenant.as_str()))
                    .await?
            }
            Command::Authorize {
                user,
                tenant,
                operation,
            } => {
                self.authorize(
                    &UserId::new(user.as_str()),
                    &TenantId::new(tenant.as_str()),
                    operation,
                )
                .await?
            }
            Command::FlushAudit => {
                let report = self.audit.flush().await?;
                return Ok(json!({
                    "delivered": report.delivered,
                    "duplicates": report.duplicates,
                }));
            }
            Command::Summarize { tenant, hours } => {
                let tenant = tenant.as_deref().map(TenantId::new);
                let snapshot = self
                    .compliance
                    .summarize(tenant.as_ref(), last_hours(*hours)?)
                    .await?;
                serde_json::to_value(snapshot)?
            }
            Command::History {
                tenant,
                table,
                record_id,
                hours,
            } => {
                let history = self
                    .compliance
                    .access_history(
                        &TenantId::new(tenant.as_str()),
                        table,
                        record_id,
                        last_hours(*hours)?,
                    )
                    .await?;
                serde_json::to_value(history)?
            }
        };

        let report = self.audit.flush().await?;
        debug!(delivered = report.delivered, "Flushed audit outbox");
        Ok(output)
    }

    async fn create_tenant(&self, tenant: Tenant) -> anyhow::Result<Value> {
        self.validator.validate(&tenant.id)?;
        self.backend.create_tenant(&tenant).await?;

        let values = serde_json::to_value(&tenant)?;
        self.record(
            self.entry(&tenant.id, "tenants", AuditAction::Create)
                .with_record_id(tenant.id.as_str())
                .with_new_values(values.clone()),
        )
        .await;

        info!(tenant_id = %tenant.id, "Tenant created");
        Ok(values)
    }

    async fn deactivate_tenant(&self, tenant_id: &TenantId) -> anyhow::Result<Value> {
        let previous = self.backend.deactivate_tenant(tenant_id).await?;
        let current = Tenant {
            is_active: false,
            ..previous.clone()
        };

        let values = serde_json::to_value(&current)?;
        self.record(
            self.entry(tenant_id, "tenants", AuditAction::Update)
                .with_record_id(tenant_id.as_str())
                .with_old_values(serde_json::to_value(&previous)?)
                .with_new_values(values.clone()),
        )
        .await;

        info!(tenant_id = %tenant_id, "Tenant deactivated");
        Ok(values)
    }

    async fn grant(&self, args: &GrantArgs) -> anyhow::Result<Value> {
        let role: Role = args.role.parse()?;
        let tenant_id = TenantId::new(args.tenant.as_str());
        self.validator.validate(&tenant_id)?;

        let tenant = match self.backend.get_tenant(&tenant_id).await? {
            Some(tenant) if tenant.is_active => tenant,
            Some(_) => bail!("tenant '{}' is inactive", tenant_id),
            None => bail!("tenant '{}' does not exist", tenant_id),
        };

        let mut membership = TenantMembership::new(args.user.as_str(), tenant_id.clone(), role)
            .with_invited_by(self.actor.clone());
        for (operation, allowed) in &args.permissions {
            membership = membership.with_permission(operation.as_str(), *allowed);
        }

        let previous = match tenant.limits.max_users {
            Some(max) => self.backend.upsert_membership_capped(&membership, max).await?,
            None => self.backend.upsert_membership(&membership).await?,
        };
        let values = serde_json::to_value(&membership)?;
        let action = if previous.is_some() {
            AuditAction::Update
        } else {
            AuditAction::Create
        };
        let mut entry = self
            .entry(&tenant_id, "tenant_memberships", action)
            .with_record_id(format!("{}:{}", membership.user_id, tenant_id))
            .with_new_values(values.clone());
        if let Some(previous) = &previous {
            entry = entry.with_old_values(serde_json::to_value(previous)?);
        }
        self.record(entry).await;

        info!(
            user_id = %membership.user_id,
            tenant_id = %tenant_id,
            role = %role,
            "Membership granted"
        );
        Ok(values)
    }

    async fn revoke(&self, user_id: &UserId, tenant_id: &TenantId) -> anyhow::Result<Value> {
        let previous = self
            .backend
            .deactivate_membership(user_id, tenant_id)
            .await
            .with_context(|| format!("cannot revoke {} from {}", user_id, tenant_id))?;
        let current = TenantMembership {
            is_active: false,
            ..previous.clone()
        };

        let values = serde_json::to_value(&current)?;
        self.record(
            self.entry(tenant_id, "tenant_memberships", AuditAction::Update)
                .with_record_id(format!("{}:{}", user_id, tenant_id))
                .with_old_values(serde_json::to_value(&previous)?)
                .with_new_values(values.clone()),
        )
        .await;

        info!(user_id = %user_id, tenant_id = %tenant_id, "Membership revoked");
        Ok(values)
    }

    /// Evaluates an operation for a user without recording a denial.
    async fn authorize(
        &self,
        user_id: &UserId,
        tenant_id: &TenantId,
        operation: &str,
    ) -> anyhow::Result<Value> {
        self.validator.validate(tenant_id)?;
        let scope = self.gateway.begin_request(
            user_id.clone(),
            RequestMetadata::new().with_extra("source", SOURCE),
        );
        let decision = scope.check(tenant_id, operation).await;

        Ok(json!({
            "user_id": user_id,
            "tenant_id": tenant_id,
            "operation": operation,
            "required_role": self.gateway.policy().required_role(operation).as_str(),
            "allowed": decision.is_allowed(),
            "reason": decision.deny_reason().map(|reason| reason.to_string()),
        }))
    }

    fn entry(&self, tenant_id: &TenantId, table: &str, action: AuditAction) -> AuditLogEntry {
        AuditLogEntry::new(self.actor.clone(), tenant_id.clone(), table, action)
            .with_detail("source", SOURCE)
    }

    async fn record(&self, entry: AuditLogEntry) {
        self.audit.record(entry).await;
    }
}

fn last_hours(hours: i64) -> anyhow::Result<TimeWindow> {
    if hours <= 0 {
        return Err(anyhow!("--hours must be positive, got {}", hours));
    }
    Ok(TimeWindow::last(Duration::hours(hours))?)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::config::AdminConfig;

    fn command(args: &[&str]) -> Command {
        let mut argv = vec!["guard-admin"];
        argv.extend_from_slice(args);
        AdminConfig::try_parse_from(argv).unwrap().command
    }

    fn open(dir: &tempfile::TempDir) -> Admin {
        let path = dir.path().join("guard.db");
        Admin::open(
            path.to_str().unwrap(),
            &GuardConfig::for_testing(),
            "ops",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_provision_and_authorize() {
        let dir = tempfile::tempdir().unwrap();
        let admin = open(&dir);

        admin
            .run(&command(&["tenant", "create", "clinic-a", "Clinic A", "--max-users", "5"]))
            .await
            .unwrap();
        let granted = admin
            .run(&command(&["grant", "alice", "clinic-a", "staff"]))
            .await
            .unwrap();
        assert_eq!(granted["role"], "staff");
        assert_eq!(granted["invited_by"], "ops");

        let allowed = admin
            .run(&command(&["authorize", "alice", "clinic-a", "viewPatientRecord"]))
            .await
            .unwrap();
        assert_eq!(allowed["allowed"], true);
        assert_eq!(allowed["required_role"], "staff");

        let denied = admin
            .run(&command(&["authorize", "alice", "clinic-a", "manageMembers"]))
            .await
            .unwrap();
        assert_eq!(denied["allowed"], false);
        assert!(denied["reason"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_provisioning_is_audited() {
        let dir = tempfile::tempdir().unwrap();
        let admin = open(&dir);

        admin
            .run(&command(&["tenant", "create", "clinic-a", "Clinic A"]))
            .await
            .unwrap();
        admin
            .run(&command(&["grant", "alice", "clinic-a", "tenant_admin"]))
            .await
            .unwrap();
        admin
            .run(&command(&["revoke", "alice", "clinic-a"]))
            .await
            .unwrap();

        let summary = admin
            .run(&command(&["summarize", "--tenant", "clinic-a"]))
            .await
            .unwrap();
        assert_eq!(summary["total_entries"], 3);
        assert_eq!(summary["by_table"]["tenants"]["create"], 1);
        assert_eq!(summary["by_table"]["tenant_memberships"]["create"], 1);
        assert_eq!(summary["by_table"]["tenant_memberships"]["update"], 1);

        let history = admin
            .run(&command(&["history", "clinic-a", "tenant_memberships", "alice:clinic-a"]))
            .await
            .unwrap();
        assert_eq!(history.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_grant_requires_known_role_and_active_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let admin = open(&dir);

        assert!(
            admin
                .run(&command(&["grant", "alice", "clinic-a", "staff"]))
                .await
                .is_err()
        );

        admin
            .run(&command(&["tenant", "create", "clinic-a", "Clinic A"]))
            .await
            .unwrap();
        assert!(
            admin
                .run(&command(&["grant", "alice", "clinic-a", "superuser"]))
                .await
                .is_err()
        );

        admin
            .run(&command(&["tenant", "deactivate", "clinic-a"]))
            .await
            .unwrap();
        assert!(
            admin
                .run(&command(&["grant", "alice", "clinic-a", "staff"]))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_grant_respects_max_users() {
        let dir = tempfile::tempdir().unwrap();
        let admin = open(&dir);

        admin
            .run(&command(&["tenant", "create", "clinic-a", "Clinic A", "--max-users", "1"]))
            .await
            .unwrap();
        admin
            .run(&command(&["grant", "alice", "clinic-a", "staff"]))
            .await
            .unwrap();
        assert!(
            admin
                .run(&command(&["grant", "bob", "clinic-a", "staff"]))
                .await
                .is_err()
        );
        admin
            .run(&command(&["grant", "alice", "clinic-a", "practice_manager"]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejects_malformed_tenant_id() {
        let dir = tempfile::tempdir().unwrap();
        let admin = open(&dir);

        let result = admin
            .run(&command(&["tenant", "create", "clinic/a", "Clinic A"]))
            .await;
        assert!(result.is_err());
    }
}
