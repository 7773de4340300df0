//! Shared types, errors and configuration for the devi2c bus core

pub mod config;
pub mod error;
pub mod types;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
