//! mongolink Common - Shared utilities and types
//!
//! This crate provides functionality used across all mongolink components:
//! - Error types and handling
//! - Client configuration
//! - Tracing bootstrap

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::{AuthMechanism, ClientConfig, Credentials, TlsConfig};
pub use error::{AuthError, CommandError, Error, FrameError, NetworkError, Result};
