//! Configuration module
//!
//! Handles loading server settings from TOML.

mod server;

pub use server::*;
