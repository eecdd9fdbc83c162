pub mod edr;
