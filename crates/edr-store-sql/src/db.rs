pub mod edr;
pub mod postgres;
pub mod sqlite;
