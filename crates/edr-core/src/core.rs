pub mod db;
pub mod lock;
pub mod model;
pub mod service;
