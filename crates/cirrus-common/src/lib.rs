//! Cirrus Common - Shared types and utilities
//!
//! This crate provides common types, error definitions, and utilities
//! used across all Cirrus components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod msg;
pub mod types;

pub use checksum::{Checksum, DigestBuilder, Digests};
pub use config::Config;
pub use error::{Error, Result};
pub use msg::{Action, ActionMsg, CopyMsg, GetMsg, What};
pub use types::*;
