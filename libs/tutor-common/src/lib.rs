pub mod config;
pub mod literal;
pub mod redis;
pub mod types;
