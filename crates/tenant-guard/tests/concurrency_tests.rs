//! Concurrent writes against a file-backed database.

mod common;

use serde_json::json;

use helios_tenant_guard::audit::AuditAction;
use helios_tenant_guard::authz::operations;
use helios_tenant_guard::error::ResourceError;
use helios_tenant_guard::{GuardError, Role, TenantId};

use common::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_chain_audit_values() {
    let dir = tempfile::tempdir().unwrap();
    let backend = create_file_backend(&dir.path().join("guard.db"));
    seed_tenant(&backend, "clinic-a").await;
    seed_membership(&backend, "alice", "clinic-a", Role::Staff).await;
    seed_membership(&backend, "dave", "clinic-a", Role::Staff).await;
    let (gateway, _sink) = create_gateway(backend);
    let clinic_a = TenantId::new("clinic-a");

    let alice = scope(&gateway, "alice");
    let alice_ctx = alice
        .authorize(&clinic_a, operations::EDIT_PATIENT_RECORD)
        .await
        .unwrap();
    let dave = scope(&gateway, "dave");
    let dave_ctx = dave
        .authorize(&clinic_a, operations::EDIT_PATIENT_RECORD)
        .await
        .unwrap();
    alice
        .records()
        .create(Some(&alice_ctx), "patients", json!({"id": "p1", "allergies": []}))
        .await
        .unwrap();

    let first = {
        let records = alice.records().clone();
        tokio::spawn(async move {
            records
                .update(Some(&alice_ctx), "patients", "p1", json!({"allergies": ["latex"]}))
                .await
        })
    };
    let second = {
        let records = dave.records().clone();
        tokio::spawn(async move {
            records
                .update(Some(&dave_ctx), "patients", "p1", json!({"allergies": ["penicillin"]}))
                .await
        })
    };

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    let mut versions = vec![first.version, second.version];
    versions.sort();
    assert_eq!(versions, vec![2, 3]);

    let log = delivered_log(&gateway).await;
    let updates: Vec<_> = log
        .iter()
        .map(|r| &r.entry)
        .filter(|e| e.action == AuditAction::Update)
        .collect();
    assert_eq!(updates.len(), 2);

    // Whichever update committed second saw the first one's result.
    assert_eq!(updates[1].old_values, updates[0].new_values);
    assert_eq!(updates[0].old_values.as_ref().unwrap()["version"], 1);
    assert_eq!(updates[1].new_values.as_ref().unwrap()["version"], 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_of_one_id_admit_one() {
    let dir = tempfile::tempdir().unwrap();
    let backend = create_file_backend(&dir.path().join("guard.db"));
    seed_tenant(&backend, "clinic-a").await;
    seed_membership(&backend, "alice", "clinic-a", Role::Staff).await;
    let (gateway, _sink) = create_gateway(backend);

    let alice = scope(&gateway, "alice");
    let ctx = alice
        .authorize(&TenantId::new("clinic-a"), operations::MANAGE_APPOINTMENTS)
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for slot in 0..8 {
        let records = alice.records().clone();
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            records
                .create(Some(&ctx), "appointments", json!({"id": "a1", "slot": slot}))
                .await
        }));
    }

    let mut created = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => created += 1,
            Err(GuardError::Resource(ResourceError::AlreadyExists { .. })) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((created, rejected), (1, 7));

    let log = delivered_log(&gateway).await;
    let successes = log
        .iter()
        .filter(|r| r.entry.action == AuditAction::Create && r.entry.old_values.is_none())
        .filter(|r| r.entry.new_values.is_some())
        .count();
    assert_eq!(successes, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_tenants_keep_their_own_records() {
    let dir = tempfile::tempdir().unwrap();
    let backend = create_file_backend(&dir.path().join("guard.db"));
    let mut contexts = Vec::new();
    for i in 0..4 {
        let tenant = format!("clinic-{}", i);
        let user = format!("staff-{}", i);
        seed_tenant(&backend, &tenant).await;
        seed_membership(&backend, &user, &tenant, Role::Staff).await;
        contexts.push(user);
    }
    let (gateway, _sink) = create_gateway(backend);
    let dispatcher = gateway.audit().start_dispatcher();

    let mut tasks = Vec::new();
    for (i, user) in contexts.into_iter().enumerate() {
        let scope = scope(&gateway, &user);
        tasks.push(tokio::spawn(async move {
            let tenant = TenantId::new(format!("clinic-{}", i));
            let ctx = scope
                .authorize(&tenant, operations::EDIT_PATIENT_RECORD)
                .await?;
            for n in 0..5 {
                scope
                    .records()
                    .create(Some(&ctx), "patients", json!({"id": format!("p{}-{}", i, n)}))
                    .await?;
            }
            scope
                .records()
                .list(Some(&ctx), "patients", Default::default())
                .await
        }));
    }

    for task in tasks {
        let listed = task.await.unwrap().unwrap();
        assert_eq!(listed.len(), 5);
        let tenant = &listed[0].tenant_id;
        assert!(listed.iter().all(|r| &r.tenant_id == tenant));
    }

    dispatcher.shutdown().await;
    let log = delivered_log(&gateway).await;
    // Five creates and one audited list per tenant.
    assert_eq!(log.len(), 4 * 6);
}
