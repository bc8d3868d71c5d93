//! # Stowage
//!
//! Command-line front end for content-addressable OCI artifact stores.
//!
//! ## Usage
//!
//! ```text
//! stowage pull ghcr.io/org/app:v1
//! stowage push sha256:... registry.example.com/org/app --tag release
//! stowage stat sha256:... --manifest
//! ```
//!
//! Pulled artifacts land in a local store chosen with `--store` (a name
//! under the data directory, or a path).

#![warn(missing_docs)]

pub mod cli;
