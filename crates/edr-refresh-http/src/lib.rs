pub mod client;
pub mod config;
pub mod extensions;
pub mod model;

pub use client::{HttpTokenRefresher, RefreshError};
pub use config::RefreshConfig;
pub use extensions::http_refresher_extension;
