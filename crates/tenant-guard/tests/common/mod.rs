//! Shared setup for tenant guard integration tests.
//!
//! Tenants and memberships are seeded straight through the store traits,
//! the way a provisioning job would, so tests start from a known state
//! without going through the gateway's own authorization.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use helios_tenant_guard::audit::{
    AlertSink, AuditAlert, AuditFilter, AuditLogger, AuditRecord, AuditStore,
};
use helios_tenant_guard::authz::DenyReason;
use helios_tenant_guard::backends::sqlite::SqliteBackend;
use helios_tenant_guard::membership::{MembershipStore, TenantStore};
use helios_tenant_guard::role::StoredRole;
use helios_tenant_guard::tenant::{RequestMetadata, Tenant, TenantMembership};
use helios_tenant_guard::{AccessGateway, GuardConfig, GuardError, RequestScope, UserId};

/// Collects raised audit alerts for assertions.
#[derive(Default)]
pub struct CollectingSink {
    alerts: Mutex<Vec<AuditAlert>>,
}

impl CollectingSink {
    pub fn alerts(&self) -> Vec<AuditAlert> {
        self.alerts.lock().clone()
    }
}

impl AlertSink for CollectingSink {
    fn raise(&self, alert: &AuditAlert) {
        self.alerts.lock().push(alert.clone());
    }
}

pub fn create_backend() -> Arc<SqliteBackend> {
    let backend = SqliteBackend::in_memory().expect("Failed to create SQLite backend");
    backend.init_schema().expect("Failed to initialize schema");
    Arc::new(backend)
}

pub fn create_file_backend(path: &Path) -> Arc<SqliteBackend> {
    let backend = SqliteBackend::open(path).expect("Failed to open SQLite database");
    backend.init_schema().expect("Failed to initialize schema");
    Arc::new(backend)
}

/// A gateway over `backend` with fast retries and a collecting alert sink.
pub fn create_gateway(backend: Arc<SqliteBackend>) -> (AccessGateway, Arc<CollectingSink>) {
    create_gateway_with(backend, GuardConfig::for_testing())
}

pub fn create_gateway_with(
    backend: Arc<SqliteBackend>,
    config: GuardConfig,
) -> (AccessGateway, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::default());
    let audit = AuditLogger::with_alert_sink(backend.clone(), config.audit.clone(), sink.clone());
    let gateway = AccessGateway::with_parts(
        backend.clone(),
        backend.clone(),
        backend,
        audit,
        &config,
    )
    .expect("Failed to build gateway");
    (gateway, sink)
}

pub async fn seed_tenant(backend: &SqliteBackend, id: &str) {
    backend
        .create_tenant(&Tenant::new(id, format!("Clinic {}", id)))
        .await
        .expect("Failed to seed tenant");
}

pub async fn seed_membership(
    backend: &SqliteBackend,
    user: &str,
    tenant: &str,
    role: impl Into<StoredRole>,
) {
    backend
        .upsert_membership(&TenantMembership::new(user, tenant, role))
        .await
        .expect("Failed to seed membership");
}

pub fn scope(gateway: &AccessGateway, user: &str) -> RequestScope {
    gateway.begin_request(
        UserId::new(user),
        RequestMetadata::new()
            .with_ip_address("10.0.0.1")
            .with_correlation_id(format!("req-{}", user)),
    )
}

/// Delivers the outbox and returns the whole audit log.
pub async fn delivered_log(gateway: &AccessGateway) -> Vec<AuditRecord> {
    gateway.audit().flush().await.expect("Failed to flush audit outbox");
    gateway
        .audit()
        .store()
        .entries(&AuditFilter::new(), 0, 10_000)
        .await
        .expect("Failed to read audit log")
}

/// Extracts the denial reason from an authorization error.
pub fn deny_reason(err: GuardError) -> DenyReason {
    match err {
        GuardError::Authorization(e) => e.reason().clone(),
        other => panic!("expected an authorization denial, got {other:?}"),
    }
}
