//! Configuration module for the stm transcoding daemon
//!
//! Handles loading configuration from TOML files, environment variable
//! overrides, and atomic persist-back of operator edits.

pub mod config;

pub use config::*;
