//! Configuration module
//!
//! Handles loading server settings from a TOML file.

mod file;

pub use file::*;
