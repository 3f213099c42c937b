//! Membership resolution with fail-closed semantics.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::MembershipStore;
use crate::error::GuardResult;
use crate::tenant::{TenantId, TenantMembership, UserId};

/// Resolves a user's active memberships.
///
/// A store failure resolves to no memberships, so every check made with the
/// result is denied.
#[derive(Clone)]
pub struct MembershipResolver {
    store: Arc<dyn MembershipStore>,
}

impl std::fmt::Debug for MembershipResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipResolver").finish_non_exhaustive()
    }
}

impl MembershipResolver {
    /// Creates a resolver over a membership store.
    pub fn new(store: Arc<dyn MembershipStore>) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<dyn MembershipStore> {
        &self.store
    }

    /// Returns the user's active memberships, oldest first.
    ///
    /// Store failures are logged and resolve to an empty set.
    pub async fn memberships(&self, user_id: &UserId) -> Vec<TenantMembership> {
        match self.try_memberships(user_id).await {
            Ok(memberships) => memberships,
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    error = %e,
                    "Membership lookup failed, denying all tenant access"
                );
                Vec::new()
            }
        }
    }

    async fn try_memberships(&self, user_id: &UserId) -> GuardResult<Vec<TenantMembership>> {
        let mut memberships = self.store.active_memberships(user_id).await?;
        memberships.retain(|m| m.is_active && &m.user_id == user_id);
        // Stable sort keeps store order for equal timestamps.
        memberships.sort_by_key(|m| m.created_at);
        Ok(memberships)
    }

    /// Returns the tenant a user lands in by default.
    ///
    /// The stored preference wins while that membership is still active.
    /// Otherwise the earliest active membership is used. A user with no
    /// active membership has no primary tenant.
    pub async fn primary_tenant(&self, user_id: &UserId) -> Option<TenantId> {
        let memberships = self.memberships(user_id).await;
        self.primary_tenant_from(user_id, &memberships).await
    }

    pub(crate) async fn primary_tenant_from(
        &self,
        user_id: &UserId,
        memberships: &[TenantMembership],
    ) -> Option<TenantId> {
        let preference = match self.store.primary_tenant_preference(user_id).await {
            Ok(preference) => preference,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Primary tenant lookup failed");
                None
            }
        };

        if let Some(preferred) = preference {
            if memberships.iter().any(|m| m.tenant_id == preferred) {
                return Some(preferred);
            }
            debug!(
                user_id = %user_id,
                tenant_id = %preferred,
                "Primary tenant preference is stale, falling back"
            );
        }

        memberships.first().map(|m| m.tenant_id.clone())
    }
}

/// Per-request membership cache.
///
/// The first resolution for a user is kept until the cache is dropped or
/// invalidated. A new request gets a new cache, so revocations are visible
/// on the next request at the latest. Failed lookups are never cached.
#[derive(Debug)]
pub struct MembershipCache {
    resolver: MembershipResolver,
    entries: Mutex<HashMap<UserId, Arc<Vec<TenantMembership>>>>,
}

impl MembershipCache {
    /// Creates an empty cache.
    pub fn new(resolver: MembershipResolver) -> Self {
        Self {
            resolver,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the user's active memberships, resolving on first use.
    pub async fn memberships(&self, user_id: &UserId) -> Arc<Vec<TenantMembership>> {
        if let Some(cached) = self.entries.lock().get(user_id).cloned() {
            return cached;
        }

        match self.resolver.try_memberships(user_id).await {
            Ok(memberships) => {
                let memberships = Arc::new(memberships);
                self.entries
                    .lock()
                    .insert(user_id.clone(), Arc::clone(&memberships));
                memberships
            }
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    error = %e,
                    "Membership lookup failed, denying all tenant access"
                );
                Arc::new(Vec::new())
            }
        }
    }

    /// Returns the user's primary tenant using the cached memberships.
    pub async fn primary_tenant(&self, user_id: &UserId) -> Option<TenantId> {
        let memberships = self.memberships(user_id).await;
        self.resolver.primary_tenant_from(user_id, &memberships).await
    }

    /// Drops the cached memberships of one user.
    pub fn invalidate(&self, user_id: &UserId) {
        self.entries.lock().remove(user_id);
    }

    /// Drops every cached entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
