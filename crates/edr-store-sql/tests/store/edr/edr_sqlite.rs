use async_trait::async_trait;
use edc_edr_store_sql::db::sqlite::edr::SqliteEdrStore;

use crate::{generate_edr_store_tests, store::Tester};

pub struct SqliteTester(SqliteEdrStore);

#[async_trait]
impl Tester<SqliteEdrStore> for SqliteTester {
    async fn create() -> Self {
        let store = SqliteEdrStore::connect("sqlite::memory:")
            .await
            .unwrap()
            .with_page_size(2);

        store.migrate().await.unwrap();
        SqliteTester(store)
    }

    fn store(&self) -> &SqliteEdrStore {
        &self.0
    }
}

generate_edr_store_tests!(SqliteTester);
