pub mod config;
pub mod core;
pub mod extensions;

pub use config::SweeperConfig;
