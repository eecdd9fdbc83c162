mod config;
pub mod lock;
pub mod store;

pub use config::{EdrBackend, EdrDbConfig};
pub use lock::edr_lock_extension;
pub use store::edr_store_extension;
