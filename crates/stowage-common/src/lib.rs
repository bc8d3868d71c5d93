//! # stowage-common
//!
//! Shared utilities and types for the Stowage crates.
//!
//! This crate provides common functionality used across all Stowage crates:
//! - The error taxonomy every store and the transfer engine report through
//! - Standard filesystem paths for on-disk stores

#![warn(missing_docs)]

pub mod error;
pub mod paths;

pub use error::{StowageError, StowageResult};
pub use paths::StowagePaths;
