//! # stowage-oci
//!
//! OCI (Open Container Initiative) content types for Stowage.
//!
//! This crate provides Rust types for:
//! - Content digests and streaming hashing
//! - Descriptors, image manifests and indexes (OCI and Docker v2)
//! - Image configs and their history-recording editor
//! - Canonical JSON encoding and manifest assembly

#![warn(missing_docs)]

pub mod builder;
pub mod config;
pub mod digest;
pub mod image;
pub mod json;

pub use builder::ImageManifestBuilder;
pub use config::{ExecutionConfig, History, ImageConfig, ImageConfigWriter, RootFs};
pub use digest::{Digest, DigestHasher};
pub use image::{
    Descriptor, ImageIndex, ImageManifest, Manifest, ManifestBody, ManifestDescriptor,
    ManifestKind, Platform, media_types, select_platform, sniff_media_type,
};
