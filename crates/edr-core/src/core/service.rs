pub mod edr;
pub mod refresh;
pub mod sweeper;
