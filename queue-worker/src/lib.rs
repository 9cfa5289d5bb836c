pub mod config;
pub mod error;
pub mod policy;
pub mod pool;
