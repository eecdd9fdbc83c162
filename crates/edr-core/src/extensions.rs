pub mod service;
pub mod sweeper;

pub use service::edr_service_extension;
pub use sweeper::edr_sweeper_extension;
