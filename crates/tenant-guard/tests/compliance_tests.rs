//! Compliance reports over the delivered audit log.

mod common;

use chrono::{Duration, Utc};
use serde_json::json;

use helios_tenant_guard::audit::{AuditAction, AuditOutcome, TimeWindow};
use helios_tenant_guard::authz::{DenyReason, operations};
use helios_tenant_guard::error::{AccessScope, AuthzError};
use helios_tenant_guard::gateway::PLATFORM_TENANT;
use helios_tenant_guard::{AccessGateway, GuardError, PublicError, Role, TenantId};

use common::*;

fn last_hour() -> TimeWindow {
    TimeWindow::last(Duration::hours(1)).unwrap()
}

/// Seeds two clinics with some recorded activity and delivers it.
///
/// clinic-a: alice (staff) creates, updates and reads patient p1.
/// clinic-b: frank (tenant admin) creates appointment b1, and alice is
/// denied a patient read.
async fn clinics_with_activity() -> AccessGateway {
    let backend = create_backend();
    seed_tenant(&backend, "clinic-a").await;
    seed_tenant(&backend, "clinic-b").await;
    seed_membership(&backend, "alice", "clinic-a", Role::Staff).await;
    seed_membership(&backend, "erin", "clinic-a", Role::TenantAdmin).await;
    seed_membership(&backend, "frank", "clinic-b", Role::TenantAdmin).await;
    seed_membership(&backend, "bob", "clinic-a", Role::PlatformAdmin).await;
    let (gateway, _sink) = create_gateway(backend);

    let alice = scope(&gateway, "alice");
    let ctx = alice
        .authorize(&TenantId::new("clinic-a"), operations::EDIT_PATIENT_RECORD)
        .await
        .unwrap();
    alice
        .records()
        .create(Some(&ctx), "patients", json!({"id": "p1", "name": "Ann"}))
        .await
        .unwrap();
    alice
        .records()
        .update(Some(&ctx), "patients", "p1", json!({"name": "Anne"}))
        .await
        .unwrap();
    alice
        .records()
        .read(Some(&ctx), "patients", "p1")
        .await
        .unwrap();
    let denied = alice
        .authorize(&TenantId::new("clinic-b"), operations::VIEW_PATIENT_RECORD)
        .await;
    assert!(denied.is_err());

    let frank = scope(&gateway, "frank");
    let ctx = frank
        .authorize(&TenantId::new("clinic-b"), operations::MANAGE_APPOINTMENTS)
        .await
        .unwrap();
    frank
        .records()
        .create(Some(&ctx), "appointments", json!({"id": "b1"}))
        .await
        .unwrap();

    gateway.audit().flush().await.unwrap();
    gateway
}

#[tokio::test]
async fn test_tenant_summary_counts_only_that_tenant() {
    let gateway = clinics_with_activity().await;
    let window = last_hour();

    let report = scope(&gateway, "erin")
        .compliance_summary(Some(&TenantId::new("clinic-a")), window)
        .await
        .unwrap();

    assert_eq!(report.tenant_id, Some(TenantId::new("clinic-a")));
    assert_eq!(report.total_entries, 3);
    let patients = &report.by_table["patients"];
    assert_eq!(
        (patients.create, patients.read, patients.update, patients.delete),
        (1, 1, 1, 0)
    );
    assert_eq!(report.by_outcome.success, 3);
    assert_eq!(report.by_outcome.denied, 0);
    assert_eq!(report.distinct_actors, 1);
    assert!(report.denials_by_actor.is_empty());

    let report_b = scope(&gateway, "frank")
        .compliance_summary(Some(&TenantId::new("clinic-b")), window)
        .await
        .unwrap();
    assert_eq!(report_b.total_entries, 2);
    assert_eq!(report_b.by_outcome.denied, 1);
    assert_eq!(report_b.denials_by_actor.get("alice"), Some(&1));
    assert_eq!(report_b.distinct_actors, 2);
}

#[tokio::test]
async fn test_summary_is_repeatable() {
    let gateway = clinics_with_activity().await;
    let window = last_hour();
    let erin = scope(&gateway, "erin");
    let clinic_a = TenantId::new("clinic-a");

    let first = erin.compliance_summary(Some(&clinic_a), window).await.unwrap();
    let second = erin.compliance_summary(Some(&clinic_a), window).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_platform_summary_spans_tenants() {
    let gateway = clinics_with_activity().await;

    let report = scope(&gateway, "bob")
        .compliance_summary(None, last_hour())
        .await
        .unwrap();
    assert_eq!(report.tenant_id, None);
    assert_eq!(report.total_entries, 5);
    assert_eq!(report.distinct_actors, 2);
}

#[tokio::test]
async fn test_reports_require_admin_roles() {
    let gateway = clinics_with_activity().await;
    let clinic_a = TenantId::new("clinic-a");

    let err = scope(&gateway, "alice")
        .compliance_summary(Some(&clinic_a), last_hour())
        .await
        .unwrap_err();
    assert_eq!(
        deny_reason(err),
        DenyReason::InsufficientRole {
            actual: Role::Staff.into(),
            required: Role::TenantAdmin,
        }
    );

    // A tenant admin of one clinic cannot read another clinic's report.
    let err = scope(&gateway, "erin")
        .compliance_summary(Some(&TenantId::new("clinic-b")), last_hour())
        .await
        .unwrap_err();
    assert_eq!(deny_reason(err), DenyReason::NoTenantAccess);

    let err = scope(&gateway, "erin")
        .compliance_summary(None, last_hour())
        .await
        .unwrap_err();
    match err {
        GuardError::Authorization(AuthzError::Denied { scope, reason, .. }) => {
            assert_eq!(scope, AccessScope::Platform);
            assert_eq!(
                reason,
                DenyReason::InsufficientRole {
                    actual: Role::TenantAdmin.into(),
                    required: Role::PlatformAdmin,
                }
            );
        }
        other => panic!("expected a platform denial, got {other:?}"),
    }

    let log = delivered_log(&gateway).await;
    let platform_denial = log
        .iter()
        .map(|r| &r.entry)
        .find(|e| e.tenant_id.as_str() == PLATFORM_TENANT)
        .unwrap();
    assert_eq!(platform_denial.actor_id.as_str(), "erin");
    assert_eq!(platform_denial.outcome, AuditOutcome::Denied);
    assert_eq!(
        platform_denial.request_metadata.extra["operation"],
        operations::VIEW_PLATFORM_COMPLIANCE
    );
}

#[tokio::test]
async fn test_access_history_is_oldest_first() {
    let gateway = clinics_with_activity().await;

    let history = scope(&gateway, "erin")
        .access_history(&TenantId::new("clinic-a"), "patients", "p1", last_hour())
        .await
        .unwrap();
    let actions: Vec<_> = history.iter().map(|r| r.entry.action).collect();
    assert_eq!(
        actions,
        vec![AuditAction::Create, AuditAction::Update, AuditAction::Read]
    );
    assert!(history.windows(2).all(|w| w[0].sequence < w[1].sequence));

    // The same record id in another tenant has no history here.
    let other = scope(&gateway, "frank")
        .access_history(&TenantId::new("clinic-b"), "patients", "p1", last_hour())
        .await
        .unwrap();
    assert!(other.is_empty());
}

#[tokio::test]
async fn test_window_bounds_the_report() {
    let gateway = clinics_with_activity().await;
    let now = Utc::now();

    let past = TimeWindow::new(now - Duration::days(2), now - Duration::days(1)).unwrap();
    let report = scope(&gateway, "bob")
        .compliance_summary(None, past)
        .await
        .unwrap();
    assert_eq!(report.total_entries, 0);
    assert!(report.by_table.is_empty());

    let empty = TimeWindow::new(now, now).unwrap_err();
    assert_eq!(GuardError::from(empty).public_error(), PublicError::BadRequest);
}
