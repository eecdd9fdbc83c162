use async_trait::async_trait;
use edc_edr_core::core::db::memory::edr::InMemoryEdrStore;

use crate::{generate_edr_store_tests, store::Tester};

pub struct MemoryTester(InMemoryEdrStore);

#[async_trait]
impl Tester<InMemoryEdrStore> for MemoryTester {
    async fn create() -> Self {
        MemoryTester(InMemoryEdrStore::default())
    }

    fn store(&self) -> &InMemoryEdrStore {
        &self.0
    }
}

generate_edr_store_tests!(MemoryTester);
