pub mod db;
pub mod extensions;

pub use extensions::{edr_lock_extension, edr_store_extension, EdrDbConfig};
