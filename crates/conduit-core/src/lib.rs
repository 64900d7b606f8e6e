//! # conduit-core
//!
//! Core types shared across Conduit.
//!
//! This crate provides:
//! - Configuration system (defaults, config files, environment)
//! - MCP server configuration and validation
//! - Common error types

pub mod config;
pub mod error;
pub mod server;

pub use config::{Config, HealthConfig, McpConfig, ServerEntry};
pub use error::{Error, Result, ServerConfigError};
pub use server::{ServerConfig, TransportConfig, TransportKind};
