pub mod edr;
pub mod memory;
