//! kiln_core - Core library shared by the daemon, runtimes and CLI
//!
//! This crate provides:
//! - Daemon, inference and cache configuration
//! - Keep-alive (TTL) parsing for resident models
//! - Local model registry and model metadata

pub mod config;
pub mod keep_alive;
pub mod models;
pub mod registry;

pub use config::Config;
pub use keep_alive::{KeepAlive, KeepAliveError};
pub use models::{ModelFormat, ModelInfo};
pub use registry::ModelRegistry;
