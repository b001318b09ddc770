//! `wsrelay` Core Library
//!
//! Shared functionality for the relay binary and library:
//! - Configuration loading, merging and validation
//! - Tracing/logging initialization
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{RelayConfig, RelaySettings, Role};
pub use error::{Error, Result};
