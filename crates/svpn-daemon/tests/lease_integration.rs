//! Lease coordinator against the `SQLite` document store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use svpn_core::document::{DocPath, Document, DocumentStore};
use svpn_daemon::admin::{self, CodeSpec};
use svpn_daemon::lease::{Decision, GrantKind, LeaseCoordinator};
use svpn_daemon::storage::{Catalog, SqliteStore};

const TTL: Duration = Duration::from_secs(120);

fn code_path() -> DocPath {
    "codes/SHARED".parse().unwrap()
}

async fn lock_of(store: &SqliteStore) -> Value {
    let doc = store.get(&code_path()).await.unwrap().unwrap();
    doc.get("lock").cloned().unwrap_or(Value::Null)
}

/// True when the lock is absent or released.
fn unheld(lock: &Value) -> bool {
    lock.get("holderId")
        .and_then(Value::as_str)
        .is_none_or(str::is_empty)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_grant_exactly_one_holder() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("store.db");

    let seed = SqliteStore::open(&db_path, "admin").await.unwrap();
    admin::add_code(&seed, &Catalog::default(), "SHARED", &CodeSpec::default())
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let holder = format!("d-holder-{i}");
        let store = SqliteStore::open(&db_path, holder.clone())
            .await
            .unwrap()
            .with_limits(Duration::from_secs(10), 50);
        tasks.push(tokio::spawn(async move {
            let coordinator = LeaseCoordinator::new(Arc::new(store), Catalog::default(), TTL);
            let now = coordinator.now().await.unwrap();
            let decision = coordinator
                .acquire_or_resume("SHARED", &holder, "linux", now)
                .await
                .unwrap();
            (holder, decision)
        }));
    }

    let mut winners = Vec::new();
    for task in tasks {
        let (holder, decision) = task.await.unwrap();
        if decision.is_granted() {
            winners.push(holder);
        }
    }
    assert_eq!(winners.len(), 1, "winners: {winners:?}");
    assert_eq!(lock_of(&seed).await["holderId"], json!(winners[0]));
    assert_eq!(lock_of(&seed).await["generation"], json!(1));
}

#[tokio::test]
async fn lease_lifecycle_on_sqlite() {
    let store = Arc::new(SqliteStore::open_in_memory("d-h1").await.unwrap());
    admin::add_code(store.as_ref(), &Catalog::default(), "SHARED", &CodeSpec::default())
        .await
        .unwrap();
    let coordinator = LeaseCoordinator::new(Arc::clone(&store), Catalog::default(), TTL);
    let t0 = coordinator.now().await.unwrap();

    // H1 takes a fresh lease.
    let Decision::Granted(grant) = coordinator
        .acquire_or_resume("SHARED", "H1", "linux", t0)
        .await
        .unwrap()
    else {
        panic!("expected grant");
    };
    assert_eq!(grant.kind, GrantKind::Fresh);

    // H2 is denied while it is live.
    let decision = coordinator
        .acquire_or_resume("SHARED", "H2", "windows", t0 + Duration::from_secs(60))
        .await
        .unwrap();
    assert!(!decision.is_granted());

    // H1 renews; H2 still cannot take it.
    let t1 = t0 + Duration::from_secs(100);
    assert!(coordinator.renew("SHARED", "H1", "linux", t1).await);
    let decision = coordinator
        .acquire_or_resume("SHARED", "H2", "windows", t1 + Duration::from_secs(100))
        .await
        .unwrap();
    assert!(!decision.is_granted());

    // Once stale, H2 takes over and H1 learns it lost the lease.
    let t2 = t1 + TTL + Duration::from_secs(1);
    let Decision::Granted(grant) = coordinator
        .acquire_or_resume("SHARED", "H2", "windows", t2)
        .await
        .unwrap()
    else {
        panic!("expected takeover");
    };
    assert_eq!(grant.kind, GrantKind::TakenOver);
    assert_eq!(grant.lease.unwrap().generation, 2);
    assert!(!coordinator.renew("SHARED", "H1", "linux", t2).await);

    // H1 cannot release H2's lease; H2 can.
    coordinator.release("SHARED", "H1").await;
    assert_eq!(lock_of(&store).await["holderId"], json!("H2"));
    coordinator.release("SHARED", "H2").await;
    let lock = lock_of(&store).await;
    assert!(unheld(&lock));
    assert_eq!(lock["generation"], json!(2));

    // A new holder after release gets the next generation.
    let Decision::Granted(grant) = coordinator
        .acquire_or_resume("SHARED", "H3", "android", t2)
        .await
        .unwrap()
    else {
        panic!("expected grant after release");
    };
    assert_eq!(grant.kind, GrantKind::Fresh);
    assert_eq!(grant.lease.unwrap().generation, 3);
}

#[tokio::test]
async fn revoked_code_evicts_holder() {
    let store = Arc::new(SqliteStore::open_in_memory("admin").await.unwrap());
    let catalog = Catalog::default();
    admin::add_code(store.as_ref(), &catalog, "SHARED", &CodeSpec::default())
        .await
        .unwrap();
    let coordinator = LeaseCoordinator::new(Arc::clone(&store), catalog.clone(), TTL);
    let now = coordinator.now().await.unwrap();
    assert!(
        coordinator
            .acquire_or_resume("SHARED", "H1", "linux", now)
            .await
            .unwrap()
            .is_granted()
    );

    admin::revoke_code(store.as_ref(), &catalog, "SHARED").await.unwrap();
    assert!(!coordinator.renew("SHARED", "H1", "linux", now).await);
    assert!(
        coordinator
            .acquire_or_resume("SHARED", "H1", "linux", now)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn unknown_fields_survive_lease_writes() {
    let store = Arc::new(SqliteStore::open_in_memory("admin").await.unwrap());
    let mut doc = Document::new();
    doc.insert("active".into(), json!(true));
    doc.insert("note".into(), json!("issued by reseller 7"));
    store.patch(&code_path(), doc, None).await.unwrap();

    let coordinator = LeaseCoordinator::new(Arc::clone(&store), Catalog::default(), TTL);
    let now = coordinator.now().await.unwrap();
    coordinator
        .acquire_or_resume("SHARED", "H1", "linux", now)
        .await
        .unwrap();
    coordinator.release("SHARED", "H1").await;

    let doc = store.get(&code_path()).await.unwrap().unwrap();
    assert_eq!(doc.get("note"), Some(&json!("issued by reseller 7")));
    assert_eq!(store.last_writer(&code_path()).await.unwrap().as_deref(), Some("admin"));
}
