//! Configuration management for the server: loading the TOML config file.
//!
//! This module provides a unified interface to all configuration-related functionality,
//! i.e. data types and loading utilities.

mod loader;
mod types;

pub use loader::*;
pub use types::*;
