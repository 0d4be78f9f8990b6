//! Common types shared by the graphdrive crates.
//!
//! This module provides the error type every operation reports through,
//! the normalized remote path type, and a wrapper for credentials that
//! must not leak into logs.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{DrivePath, SecretString};
