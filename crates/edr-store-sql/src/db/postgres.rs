pub mod edr;
pub mod lock;
