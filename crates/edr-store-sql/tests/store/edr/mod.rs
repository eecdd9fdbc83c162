use chrono::Duration;
use edc_edr_core::core::{
    db::edr::{EdrStore, QuerySpec, StoreError},
    model::edr::{now, EdrCredential, EdrEntry, EdrState},
};
use futures::TryStreamExt;
use uuid::Uuid;

use crate::store::Tester;

mod edr_memory;
pub mod edr_postgres;
mod edr_sqlite;

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

pub fn create_entry(id: &str, asset_id: &str, provider_id: &str) -> EdrEntry {
    EdrEntry::builder()
        .transfer_process_id(id)
        .asset_id(asset_id)
        .agreement_id("agreement")
        .contract_negotiation_id("negotiation")
        .provider_id(provider_id)
        .build()
}

pub fn create_credential(token: &str) -> EdrCredential {
    EdrCredential::builder()
        .endpoint("http://provider/public")
        .auth_token(token)
        .refresh_token("refresh")
        .refresh_endpoint("http://provider/token")
        .expires_in(300)
        .issued_at(now())
        .build()
}

pub async fn save_and_find<T: EdrStore>(tester: impl Tester<T>) {
    let store = tester.store();
    let id = unique("tp");

    let credential = create_credential("token");
    store
        .save(create_entry(&id, "asset", "provider"), credential.clone())
        .await
        .unwrap();

    let cached = store.find_by_id(&id).await.unwrap().unwrap();

    assert_eq!(cached.credential, credential);
    assert_eq!(cached.entry.transfer_process_id, id);
    assert_eq!(cached.entry.state, EdrState::Negotiated);
    assert_eq!(cached.entry.contract_negotiation_id.as_deref(), Some("negotiation"));
    assert_eq!(cached.entry.version, 1);

    let reference = store.resolve_reference(&id).await.unwrap();
    assert_eq!(reference, Some(credential));
}

pub async fn find_missing<T: EdrStore>(tester: impl Tester<T>) {
    let store = tester.store();
    let id = unique("tp-missing");

    assert!(store.find_by_id(&id).await.unwrap().is_none());
    assert!(store.resolve_reference(&id).await.unwrap().is_none());
}

pub async fn save_upserts<T: EdrStore>(tester: impl Tester<T>) {
    let store = tester.store();
    let id = unique("tp");

    let mut entry = create_entry(&id, "asset", "provider");
    entry.created_at = now() - Duration::hours(1);
    store
        .save(entry.clone(), create_credential("first"))
        .await
        .unwrap();

    entry.transition_to_refreshing().unwrap();
    entry.created_at = now();
    store
        .save(entry.clone(), create_credential("second"))
        .await
        .unwrap();

    let cached = store.find_by_id(&id).await.unwrap().unwrap();

    assert_eq!(cached.credential.auth_token, "second");
    assert_eq!(cached.entry.state, EdrState::Negotiated);
    assert_eq!(cached.entry.state_count, 1);
    assert_eq!(cached.entry.version, 2);
    assert!(cached.entry.created_at < entry.created_at);

    let entries = store
        .query_for_entries(QuerySpec::builder().transfer_process_id(id).build())
        .try_collect::<Vec<_>>()
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
}

pub async fn lease<T: EdrStore>(tester: impl Tester<T>) {
    let store = tester.store();
    let id = unique("tp");

    store
        .save(create_entry(&id, "asset", "provider"), create_credential("token"))
        .await
        .unwrap();

    let leased = store.find_by_id_and_lease(&id).await.unwrap();
    assert_eq!(leased.edr.entry.transfer_process_id, id);
    assert_eq!(leased.lease.token, leased.edr.entry.version);
    assert!(leased.lease.expires_at > now());

    let err = store.find_by_id_and_lease(&id).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyLeased(_)));

    store.break_lease(&leased.lease).await.unwrap();
    store.find_by_id_and_lease(&id).await.unwrap();
}

pub async fn lease_missing<T: EdrStore>(tester: impl Tester<T>) {
    let store = tester.store();

    let err = store
        .find_by_id_and_lease(&unique("tp-missing"))
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::NotFound(_)));
}

pub async fn break_stale_lease<T: EdrStore>(tester: impl Tester<T>) {
    let store = tester.store();
    let id = unique("tp");

    store
        .save(create_entry(&id, "asset", "provider"), create_credential("token"))
        .await
        .unwrap();

    let leased = store.find_by_id_and_lease(&id).await.unwrap();

    let mut stale = leased.lease.clone();
    stale.token -= 1;
    store.break_lease(&stale).await.unwrap();

    let mut foreign = leased.lease.clone();
    foreign.holder = unique("holder");
    store.break_lease(&foreign).await.unwrap();

    let err = store.find_by_id_and_lease(&id).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyLeased(_)));
}

pub async fn update_compare_and_swap<T: EdrStore>(tester: impl Tester<T>) {
    let store = tester.store();
    let id = unique("tp");

    store
        .save(create_entry(&id, "asset", "provider"), create_credential("token"))
        .await
        .unwrap();

    let mut entry = store.find_by_id(&id).await.unwrap().unwrap().entry;
    let stale = entry.clone();

    entry.transition_to_refreshing().unwrap();
    let updated = store.update(entry).await.unwrap();

    assert_eq!(updated.state, EdrState::Refreshing);
    assert_eq!(updated.version, stale.version + 1);

    let err = store.update(stale).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    let cached = store.find_by_id(&id).await.unwrap().unwrap();
    assert_eq!(cached.entry.state, EdrState::Refreshing);
    assert_eq!(cached.entry.version, updated.version);
    assert_eq!(cached.credential.auth_token, "token");
}

pub async fn update_releases_lease<T: EdrStore>(tester: impl Tester<T>) {
    let store = tester.store();
    let id = unique("tp");

    store
        .save(create_entry(&id, "asset", "provider"), create_credential("token"))
        .await
        .unwrap();

    let leased = store.find_by_id_and_lease(&id).await.unwrap();
    let mut entry = leased.edr.entry;
    entry.error_detail = Some("failed".to_string());

    let updated = store.update(entry).await.unwrap();
    assert_eq!(updated.error_detail.as_deref(), Some("failed"));

    store.find_by_id_and_lease(&id).await.unwrap();
}

pub async fn update_missing<T: EdrStore>(tester: impl Tester<T>) {
    let store = tester.store();

    let err = store
        .update(create_entry(&unique("tp-missing"), "asset", "provider"))
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::NotFound(_)));
}

pub async fn delete<T: EdrStore>(tester: impl Tester<T>) {
    let store = tester.store();
    let id = unique("tp");

    store
        .save(create_entry(&id, "asset", "provider"), create_credential("token"))
        .await
        .unwrap();

    let deleted = store.delete_by_transfer_process_id(&id).await.unwrap();
    assert_eq!(deleted.transfer_process_id, id);
    assert!(store.find_by_id(&id).await.unwrap().is_none());

    let err = store.delete_by_transfer_process_id(&id).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

pub async fn delete_leased<T: EdrStore>(tester: impl Tester<T>) {
    let store = tester.store();
    let id = unique("tp");

    store
        .save(create_entry(&id, "asset", "provider"), create_credential("token"))
        .await
        .unwrap();

    let leased = store.find_by_id_and_lease(&id).await.unwrap();

    let err = store.delete_by_transfer_process_id(&id).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyLeased(_)));

    store.break_lease(&leased.lease).await.unwrap();
    store.delete_by_transfer_process_id(&id).await.unwrap();
}

pub async fn references_for_asset<T: EdrStore>(tester: impl Tester<T>) {
    let store = tester.store();
    let asset = unique("asset");

    store
        .save(
            create_entry(&unique("tp"), &asset, "provider-1"),
            create_credential("one"),
        )
        .await
        .unwrap();
    store
        .save(
            create_entry(&unique("tp"), &asset, "provider-2"),
            create_credential("two"),
        )
        .await
        .unwrap();
    store
        .save(
            create_entry(&unique("tp"), &unique("asset"), "provider-1"),
            create_credential("other"),
        )
        .await
        .unwrap();

    let all = store.references_for_asset(&asset, None).await.unwrap();
    assert_eq!(all.len(), 2);

    let one = store
        .references_for_asset(&asset, Some("provider-1".to_string()))
        .await
        .unwrap();
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].auth_token, "one");

    let none = store
        .references_for_asset(&asset, Some("provider-3".to_string()))
        .await
        .unwrap();
    assert!(none.is_empty());
}

pub async fn query_filters_and_pages<T: EdrStore>(tester: impl Tester<T>) {
    let store = tester.store();
    let asset = unique("asset");
    let base = now() - Duration::minutes(1);

    let mut ids = vec![];
    for i in 0..5 {
        let id = format!("{}-{}", asset, i);
        let mut entry = create_entry(&id, &asset, "provider");
        entry.created_at = base + Duration::milliseconds(i);
        store
            .save(entry, create_credential(&format!("token-{}", i)))
            .await
            .unwrap();
        ids.push(id);
    }
    store
        .save(
            create_entry(&unique("tp"), &unique("asset"), "provider"),
            create_credential("other"),
        )
        .await
        .unwrap();

    let all = store
        .query_for_entries(QuerySpec::builder().asset_id(asset.clone()).build())
        .try_collect::<Vec<_>>()
        .await
        .unwrap();
    assert_eq!(
        all.iter()
            .map(|e| e.transfer_process_id.clone())
            .collect::<Vec<_>>(),
        ids
    );

    let page = store
        .query_for_entries(
            QuerySpec::builder()
                .asset_id(asset.clone())
                .offset(1)
                .limit(3)
                .build(),
        )
        .try_collect::<Vec<_>>()
        .await
        .unwrap();
    assert_eq!(
        page.iter()
            .map(|e| e.transfer_process_id.clone())
            .collect::<Vec<_>>(),
        ids[1..4].to_vec()
    );

    let refreshing = store
        .query_for_entries(
            QuerySpec::builder()
                .asset_id(asset.clone())
                .state(EdrState::Refreshing)
                .build(),
        )
        .try_collect::<Vec<_>>()
        .await
        .unwrap();
    assert!(refreshing.is_empty());

    let by_provider = store
        .query_for_entries(
            QuerySpec::builder()
                .asset_id(asset)
                .provider_id("provider")
                .contract_negotiation_id("negotiation")
                .build(),
        )
        .try_collect::<Vec<_>>()
        .await
        .unwrap();
    assert_eq!(by_provider.len(), 5);
}

#[macro_export]
macro_rules! generate_edr_store_tests {
    ($tester:ident $(, #[$attr: meta])*) => {
        macro_rules! test {
            ($title: ident, $func: path) => {
                crate::declare_test_fn!($tester, $title, $func $(, #[$attr])*);
            };
        }

        test!(save_and_find, crate::store::edr::save_and_find);
        test!(find_missing, crate::store::edr::find_missing);
        test!(save_upserts, crate::store::edr::save_upserts);
        test!(lease, crate::store::edr::lease);
        test!(lease_missing, crate::store::edr::lease_missing);
        test!(break_stale_lease, crate::store::edr::break_stale_lease);
        test!(update_compare_and_swap, crate::store::edr::update_compare_and_swap);
        test!(update_releases_lease, crate::store::edr::update_releases_lease);
        test!(update_missing, crate::store::edr::update_missing);
        test!(delete, crate::store::edr::delete);
        test!(delete_leased, crate::store::edr::delete_leased);
        test!(references_for_asset, crate::store::edr::references_for_asset);
        test!(query_filters_and_pages, crate::store::edr::query_filters_and_pages);
    };
}
