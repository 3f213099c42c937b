//! Tenants, memberships and primary tenant preferences for SQLite.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

use crate::clock;
use crate::error::{GuardResult, ResourceError};
use crate::membership::{MembershipStore, TenantStore};
use crate::role::StoredRole;
use crate::tenant::{SubscriptionTier, Tenant, TenantId, TenantLimits, TenantMembership, UserId};

use super::SqliteBackend;
use super::backend::{internal_error, serialization_error};

const MEMBERSHIP_COLUMNS: &str =
    "m.user_id, m.tenant_id, m.role, m.permissions, m.is_active, m.invited_by, m.joined_at, m.created_at";

const TENANT_COLUMNS: &str = "id, name, specialty, subscription_tier, max_users, max_forms, \
     max_submissions, is_active, created_at";

struct RawMembership {
    user_id: String,
    tenant_id: String,
    role: String,
    permissions: String,
    is_active: bool,
    invited_by: Option<String>,
    joined_at: Option<String>,
    created_at: String,
}

impl RawMembership {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            tenant_id: row.get(1)?,
            role: row.get(2)?,
            permissions: row.get(3)?,
            is_active: row.get(4)?,
            invited_by: row.get(5)?,
            joined_at: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_membership(self) -> GuardResult<TenantMembership> {
        let permissions: BTreeMap<String, bool> = serde_json::from_str(&self.permissions)
            .map_err(|e| serialization_error(format!("Invalid membership permissions: {}", e)))?;
        let joined_at = self
            .joined_at
            .as_deref()
            .map(clock::parse_timestamp)
            .transpose()
            .map_err(|e| serialization_error(format!("Invalid joined_at: {}", e)))?;
        let created_at = clock::parse_timestamp(&self.created_at)
            .map_err(|e| serialization_error(format!("Invalid created_at: {}", e)))?;

        Ok(TenantMembership {
            user_id: UserId::new(self.user_id),
            tenant_id: TenantId::new(self.tenant_id),
            role: StoredRole::parse(&self.role),
            permissions,
            is_active: self.is_active,
            invited_by: self.invited_by.map(UserId::new),
            joined_at,
            created_at,
        })
    }
}

struct RawTenant {
    id: String,
    name: String,
    specialty: Option<String>,
    subscription_tier: String,
    max_users: Option<u32>,
    max_forms: Option<u32>,
    max_submissions: Option<u32>,
    is_active: bool,
    created_at: String,
}

impl RawTenant {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            specialty: row.get(2)?,
            subscription_tier: row.get(3)?,
            max_users: row.get(4)?,
            max_forms: row.get(5)?,
            max_submissions: row.get(6)?,
            is_active: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_tenant(self) -> GuardResult<Tenant> {
        let created_at = clock::parse_timestamp(&self.created_at)
            .map_err(|e| serialization_error(format!("Invalid created_at: {}", e)))?;

        Ok(Tenant {
            id: TenantId::new(self.id),
            name: self.name,
            specialty: self.specialty,
            subscription_tier: SubscriptionTier::parse(&self.subscription_tier),
            limits: TenantLimits {
                max_users: self.max_users,
                max_forms: self.max_forms,
                max_submissions: self.max_submissions,
            },
            is_active: self.is_active,
            created_at,
        })
    }
}

fn query_memberships(
    conn: &Connection,
    sql: &str,
    key: &str,
) -> GuardResult<Vec<TenantMembership>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| internal_error(format!("Failed to prepare membership query: {}", e)))?;
    let rows = stmt
        .query_map([key], RawMembership::from_row)
        .map_err(|e| internal_error(format!("Failed to query memberships: {}", e)))?;

    let mut memberships = Vec::new();
    for row in rows {
        let raw = row.map_err(|e| internal_error(format!("Failed to read membership: {}", e)))?;
        memberships.push(raw.into_membership()?);
    }
    Ok(memberships)
}

fn find_membership(
    conn: &Connection,
    user_id: &UserId,
    tenant_id: &TenantId,
) -> GuardResult<Option<TenantMembership>> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {} FROM tenant_memberships m WHERE m.user_id = ?1 AND m.tenant_id = ?2",
                MEMBERSHIP_COLUMNS
            ),
            params![user_id.as_str(), tenant_id.as_str()],
            RawMembership::from_row,
        )
        .optional()
        .map_err(|e| internal_error(format!("Failed to read membership: {}", e)))?;

    raw.map(RawMembership::into_membership).transpose()
}

fn find_tenant(conn: &Connection, tenant_id: &TenantId) -> GuardResult<Option<Tenant>> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM tenants WHERE id = ?1", TENANT_COLUMNS),
            [tenant_id.as_str()],
            RawTenant::from_row,
        )
        .optional()
        .map_err(|e| internal_error(format!("Failed to read tenant: {}", e)))?;

    raw.map(RawTenant::into_tenant).transpose()
}

impl SqliteBackend {
    /// Upserts a membership under the write lock, checking the member cap
    /// against the same snapshot it writes to.
    fn write_membership(
        &self,
        membership: &TenantMembership,
        max_members: Option<u32>,
    ) -> GuardResult<Option<TenantMembership>> {
        let permissions = serde_json::to_string(&membership.permissions)
            .map_err(|e| serialization_error(format!("Failed to serialize permissions: {}", e)))?;

        let mut conn = self.get_connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| internal_error(format!("Failed to begin transaction: {}", e)))?;

        if find_tenant(&tx, &membership.tenant_id)?.is_none() {
            return Err(ResourceError::TenantNotFound {
                tenant_id: membership.tenant_id.clone(),
            }
            .into());
        }

        let previous = find_membership(&tx, &membership.user_id, &membership.tenant_id)?;

        if let Some(max) = max_members {
            let already_member = previous.as_ref().is_some_and(|m| m.is_active);
            let active: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM tenant_memberships WHERE tenant_id = ?1 AND is_active = 1",
                    [membership.tenant_id.as_str()],
                    |row| row.get(0),
                )
                .map_err(|e| internal_error(format!("Failed to count members: {}", e)))?;
            if !already_member && active >= i64::from(max) {
                return Err(ResourceError::LimitExceeded {
                    tenant_id: membership.tenant_id.clone(),
                    limit: "max_users",
                    max,
                }
                .into());
            }
        }

        tx.execute(
            "INSERT INTO tenant_memberships
                (user_id, tenant_id, role, permissions, is_active, invited_by, joined_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (user_id, tenant_id) DO UPDATE SET
                role = excluded.role,
                permissions = excluded.permissions,
                is_active = excluded.is_active,
                invited_by = excluded.invited_by,
                joined_at = excluded.joined_at",
            params![
                membership.user_id.as_str(),
                membership.tenant_id.as_str(),
                membership.role.as_str(),
                permissions,
                membership.is_active,
                membership.invited_by.as_ref().map(UserId::as_str),
                membership.joined_at.as_ref().map(clock::format_timestamp),
                clock::format_timestamp(&membership.created_at)
            ],
        )
        .map_err(|e| internal_error(format!("Failed to upsert membership: {}", e)))?;

        tx.commit()
            .map_err(|e| internal_error(format!("Failed to commit membership: {}", e)))?;

        Ok(previous)
    }
}

#[async_trait]
impl MembershipStore for SqliteBackend {
    async fn active_memberships(&self, user_id: &UserId) -> GuardResult<Vec<TenantMembership>> {
        let conn = self.get_connection()?;
        let sql = format!(
            "SELECT {} FROM tenant_memberships m
             JOIN tenants t ON t.id = m.tenant_id
             WHERE m.user_id = ?1 AND m.is_active = 1 AND t.is_active = 1
             ORDER BY m.created_at, m.rowid",
            MEMBERSHIP_COLUMNS
        );
        query_memberships(&conn, &sql, user_id.as_str())
    }

    async fn tenant_members(&self, tenant_id: &TenantId) -> GuardResult<Vec<TenantMembership>> {
        let conn = self.get_connection()?;
        let sql = format!(
            "SELECT {} FROM tenant_memberships m
             WHERE m.tenant_id = ?1 AND m.is_active = 1
             ORDER BY m.created_at, m.rowid",
            MEMBERSHIP_COLUMNS
        );
        query_memberships(&conn, &sql, tenant_id.as_str())
    }

    async fn upsert_membership(
        &self,
        membership: &TenantMembership,
    ) -> GuardResult<Option<TenantMembership>> {
        self.write_membership(membership, None)
    }

    async fn upsert_membership_capped(
        &self,
        membership: &TenantMembership,
        max_members: u32,
    ) -> GuardResult<Option<TenantMembership>> {
        self.write_membership(membership, Some(max_members))
    }

    async fn deactivate_membership(
        &self,
        user_id: &UserId,
        tenant_id: &TenantId,
    ) -> GuardResult<TenantMembership> {
        let mut conn = self.get_connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| internal_error(format!("Failed to begin transaction: {}", e)))?;

        let previous = match find_membership(&tx, user_id, tenant_id)? {
            Some(m) if m.is_active => m,
            _ => {
                return Err(ResourceError::MembershipNotFound {
                    user_id: user_id.clone(),
                    tenant_id: tenant_id.clone(),
                }
                .into());
            }
        };

        tx.execute(
            "UPDATE tenant_memberships SET is_active = 0 WHERE user_id = ?1 AND tenant_id = ?2",
            params![user_id.as_str(), tenant_id.as_str()],
        )
        .map_err(|e| internal_error(format!("Failed to deactivate membership: {}", e)))?;

        tx.commit()
            .map_err(|e| internal_error(format!("Failed to commit membership: {}", e)))?;

        Ok(previous)
    }

    async fn primary_tenant_preference(&self, user_id: &UserId) -> GuardResult<Option<TenantId>> {
        let conn = self.get_connection()?;
        let preference: Option<Option<String>> = conn
            .query_row(
                "SELECT primary_tenant_id FROM user_profiles WHERE user_id = ?1",
                [user_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| internal_error(format!("Failed to read user profile: {}", e)))?;

        Ok(preference.flatten().map(TenantId::new))
    }

    async fn set_primary_tenant(
        &self,
        user_id: &UserId,
        tenant_id: Option<&TenantId>,
    ) -> GuardResult<()> {
        let conn = self.get_connection()?;
        conn.execute(
            "INSERT INTO user_profiles (user_id, primary_tenant_id, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (user_id) DO UPDATE SET
                primary_tenant_id = excluded.primary_tenant_id,
                updated_at = excluded.updated_at",
            params![
                user_id.as_str(),
                tenant_id.map(TenantId::as_str),
                clock::format_timestamp(&clock::now())
            ],
        )
        .map_err(|e| internal_error(format!("Failed to store primary tenant: {}", e)))?;

        Ok(())
    }
}

#[async_trait]
impl TenantStore for SqliteBackend {
    async fn create_tenant(&self, tenant: &Tenant) -> GuardResult<()> {
        let conn = self.get_connection()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO tenants
                    (id, name, specialty, subscription_tier, max_users, max_forms,
                     max_submissions, is_active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    tenant.id.as_str(),
                    tenant.name,
                    tenant.specialty,
                    tenant.subscription_tier.as_str(),
                    tenant.limits.max_users,
                    tenant.limits.max_forms,
                    tenant.limits.max_submissions,
                    tenant.is_active,
                    clock::format_timestamp(&tenant.created_at)
                ],
            )
            .map_err(|e| internal_error(format!("Failed to create tenant: {}", e)))?;

        if inserted == 0 {
            return Err(ResourceError::AlreadyExists {
                table: "tenants".to_string(),
                id: tenant.id.as_str().to_string(),
            }
            .into());
        }

        Ok(())
    }

    async fn get_tenant(&self, tenant_id: &TenantId) -> GuardResult<Option<Tenant>> {
        let conn = self.get_connection()?;
        find_tenant(&conn, tenant_id)
    }

    async fn deactivate_tenant(&self, tenant_id: &TenantId) -> GuardResult<Tenant> {
        let mut conn = self.get_connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| internal_error(format!("Failed to begin transaction: {}", e)))?;

        let Some(previous) = find_tenant(&tx, tenant_id)? else {
            return Err(ResourceError::TenantNotFound {
                tenant_id: tenant_id.clone(),
            }
            .into());
        };

        tx.execute(
            "UPDATE tenants SET is_active = 0 WHERE id = ?1",
            [tenant_id.as_str()],
        )
        .map_err(|e| internal_error(format!("Failed to deactivate tenant: {}", e)))?;

        tx.commit()
            .map_err(|e| internal_error(format!("Failed to commit tenant: {}", e)))?;

        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::role::Role;

    async fn backend() -> SqliteBackend {
        let backend = SqliteBackend::in_memory().unwrap();
        backend.init_schema().unwrap();
        for id in ["clinic-a", "clinic-b"] {
            backend.create_tenant(&Tenant::new(id, id)).await.unwrap();
        }
        backend
    }

    #[tokio::test]
    async fn test_active_memberships_in_join_order() {
        let backend = backend().await;
        let now = clock::now();
        backend
            .upsert_membership(
                &TenantMembership::new("alice", "clinic-b", Role::Staff).with_created_at(now),
            )
            .await
            .unwrap();
        backend
            .upsert_membership(
                &TenantMembership::new("alice", "clinic-a", Role::TenantAdmin)
                    .with_created_at(now - Duration::days(1))
                    .with_permission("manageBilling", false),
            )
            .await
            .unwrap();

        let memberships = backend
            .active_memberships(&UserId::new("alice"))
            .await
            .unwrap();
        assert_eq!(memberships.len(), 2);
        assert_eq!(memberships[0].tenant_id, TenantId::new("clinic-a"));
        assert_eq!(memberships[0].permission_override("manageBilling"), Some(false));
        assert_eq!(memberships[1].role, StoredRole::from(Role::Staff));
    }

    #[tokio::test]
    async fn test_unrecognized_role_survives_storage() {
        let backend = backend().await;
        backend
            .upsert_membership(&TenantMembership::new("bob", "clinic-a", "superuser".to_string()))
            .await
            .unwrap();

        let memberships = backend.active_memberships(&UserId::new("bob")).await.unwrap();
        assert_eq!(memberships[0].role.role(), None);
        assert_eq!(memberships[0].role.as_str(), "superuser");
    }

    #[tokio::test]
    async fn test_deactivation_hides_membership() {
        let backend = backend().await;
        let alice = UserId::new("alice");
        let clinic = TenantId::new("clinic-a");
        backend
            .upsert_membership(&TenantMembership::new("alice", "clinic-a", Role::Staff))
            .await
            .unwrap();

        let previous = backend.deactivate_membership(&alice, &clinic).await.unwrap();
        assert!(previous.is_active);
        assert!(backend.active_memberships(&alice).await.unwrap().is_empty());
        assert!(backend.deactivate_membership(&alice, &clinic).await.is_err());

        // Upserting again reactivates the same row.
        let prior = backend
            .upsert_membership(&TenantMembership::new("alice", "clinic-a", Role::Staff))
            .await
            .unwrap();
        assert!(prior.is_some_and(|m| !m.is_active));
        assert_eq!(backend.active_memberships(&alice).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_inactive_tenant_hides_memberships() {
        let backend = backend().await;
        backend
            .upsert_membership(&TenantMembership::new("alice", "clinic-a", Role::Staff))
            .await
            .unwrap();
        backend
            .deactivate_tenant(&TenantId::new("clinic-a"))
            .await
            .unwrap();

        assert!(
            backend
                .active_memberships(&UserId::new("alice"))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_membership_requires_existing_tenant() {
        let backend = backend().await;
        let result = backend
            .upsert_membership(&TenantMembership::new("alice", "clinic-z", Role::Staff))
            .await;
        assert!(matches!(
            result,
            Err(crate::error::GuardError::Resource(
                ResourceError::TenantNotFound { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn test_primary_tenant_preference() {
        let backend = backend().await;
        let alice = UserId::new("alice");
        assert_eq!(backend.primary_tenant_preference(&alice).await.unwrap(), None);

        let clinic = TenantId::new("clinic-b");
        backend.set_primary_tenant(&alice, Some(&clinic)).await.unwrap();
        assert_eq!(
            backend.primary_tenant_preference(&alice).await.unwrap(),
            Some(clinic)
        );

        backend.set_primary_tenant(&alice, None).await.unwrap();
        assert_eq!(backend.primary_tenant_preference(&alice).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_tenant_rejected() {
        let backend = backend().await;
        let result = backend.create_tenant(&Tenant::new("clinic-a", "Again")).await;
        assert!(result.is_err());
    }
}
