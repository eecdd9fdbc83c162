use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Duration as ChronoDuration;
use edc_edr_core::core::{
    db::edr::{EdrStore, EdrStoreRef},
    lock::{
        memory::{InMemoryEdrLock, LockTable},
        EdrLock, LockError, LockOutcome,
    },
    model::edr::{now, EdrCredential},
};
use edc_edr_store_sql::db::{
    postgres::{edr::PostgresEdrStore, lock::PostgresEdrLock},
    sqlite::edr::SqliteEdrStore,
};
use uuid::Uuid;

use crate::store::edr::create_entry;

fn credential(token: &str, expires_in: ChronoDuration) -> EdrCredential {
    EdrCredential::builder()
        .endpoint("http://provider/public")
        .auth_token(token)
        .expires_at(now() + expires_in)
        .build()
}

async fn acquire<L: EdrLock>(lock: &L, id: &str) -> Result<LockOutcome, LockError> {
    lock.acquire_lock(id, &credential("old", ChronoDuration::seconds(-10)))
        .await
}

#[tokio::test]
async fn in_process_lock_over_sqlite() {
    let store = SqliteEdrStore::connect("sqlite::memory:").await.unwrap();
    store.migrate().await.unwrap();

    let id = Uuid::new_v4().to_string();
    store
        .save(
            create_entry(&id, "asset", "provider"),
            credential("old", ChronoDuration::seconds(-10)),
        )
        .await
        .unwrap();

    let lock = InMemoryEdrLock::new(
        Arc::new(LockTable::new()),
        EdrStoreRef::of(store.clone()),
        Duration::from_millis(100),
    );

    let LockOutcome::Acquired(handle) = acquire(&lock, &id).await.unwrap() else {
        panic!("Expected the lock to be acquired")
    };

    let err = acquire(&lock, &id).await.unwrap_err();
    assert!(matches!(err, LockError::Timeout(..)));

    store
        .save(
            create_entry(&id, "asset", "provider"),
            credential("new", ChronoDuration::hours(1)),
        )
        .await
        .unwrap();
    lock.release_lock(&handle).await.unwrap();

    assert_eq!(acquire(&lock, &id).await.unwrap(), LockOutcome::Fresh);
    assert!(lock.table().is_empty());
}

#[tokio::test]
#[ignore = "requires EDR_TEST_POSTGRES_URL"]
async fn postgres_lock_is_shared_between_instances() {
    let url = crate::store::edr::edr_postgres::postgres_url();

    let store = PostgresEdrStore::connect(&url).await.unwrap();
    store.migrate().await.unwrap();

    let id = Uuid::new_v4().to_string();
    store
        .save(
            create_entry(&id, "asset", "provider"),
            credential("old", ChronoDuration::seconds(-10)),
        )
        .await
        .unwrap();

    let first = PostgresEdrLock::connect(&url, Duration::from_millis(200))
        .await
        .unwrap();
    let second = PostgresEdrLock::connect(&url, Duration::from_millis(200))
        .await
        .unwrap();

    let LockOutcome::Acquired(handle) = acquire(&first, &id).await.unwrap() else {
        panic!("Expected the lock to be acquired")
    };

    let err = acquire(&second, &id).await.unwrap_err();
    assert!(matches!(err, LockError::Timeout(..)));

    store
        .save(
            create_entry(&id, "asset", "provider"),
            credential("new", ChronoDuration::hours(1)),
        )
        .await
        .unwrap();

    second.release_lock(&handle).await.unwrap();
    first.release_lock(&handle).await.unwrap();
    first.release_lock(&handle).await.unwrap();

    assert_eq!(acquire(&second, &id).await.unwrap(), LockOutcome::Fresh);
}

#[tokio::test]
#[ignore = "requires EDR_TEST_POSTGRES_URL"]
async fn postgres_lock_unknown_entry() {
    let url = crate::store::edr::edr_postgres::postgres_url();
    let store = PostgresEdrStore::connect(&url).await.unwrap();
    store.migrate().await.unwrap();

    let lock = PostgresEdrLock::connect(&url, Duration::from_millis(200))
        .await
        .unwrap();

    let err = acquire(&lock, &Uuid::new_v4().to_string())
        .await
        .unwrap_err();

    assert!(matches!(err, LockError::Store(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires EDR_TEST_POSTGRES_URL"]
async fn postgres_only_one_concurrent_acquirer_refreshes() {
    let url = crate::store::edr::edr_postgres::postgres_url();

    let store = PostgresEdrStore::connect(&url).await.unwrap();
    store.migrate().await.unwrap();

    let id = Uuid::new_v4().to_string();
    store
        .save(
            create_entry(&id, "asset", "provider"),
            credential("old", ChronoDuration::seconds(-10)),
        )
        .await
        .unwrap();

    let instances = [
        PostgresEdrLock::connect(&url, Duration::from_secs(5))
            .await
            .unwrap(),
        PostgresEdrLock::connect(&url, Duration::from_secs(5))
            .await
            .unwrap(),
    ];
    let refreshes = Arc::new(AtomicUsize::new(0));

    let tasks = (0..8)
        .map(|i| {
            let lock = instances[i % instances.len()].clone();
            let store = store.clone();
            let id = id.clone();
            let refreshes = refreshes.clone();

            tokio::spawn(async move {
                match acquire(&lock, &id).await.unwrap() {
                    LockOutcome::Acquired(handle) => {
                        refreshes.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        store
                            .save(
                                create_entry(&id, "asset", "provider"),
                                credential("new", ChronoDuration::hours(1)),
                            )
                            .await
                            .unwrap();
                        lock.release_lock(&handle).await.unwrap();
                    }
                    LockOutcome::Fresh => {}
                }
            })
        })
        .collect::<Vec<_>>();

    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(
        store.resolve_reference(&id).await.unwrap().unwrap().auth_token,
        "new"
    );
}
