//! # stowage-store
//!
//! Content-addressable storage for OCI artifacts.
//!
//! This crate provides:
//! - The [`OciStore`] contract shared by all backends
//! - In-memory, filesystem, registry and stacked stores
//! - Artifact reference parsing
//! - Docker-compatible registry credential lookup

#![warn(missing_docs)]

pub mod credentials;
pub mod local;
pub mod memory;
pub mod reference;
pub mod registry;
pub mod stacked;
pub mod store;

pub use credentials::{Credential, CredentialSource, DockerCredentials};
pub use local::LocalStore;
pub use memory::InMemoryStore;
pub use reference::ImageReference;
pub use registry::{RegistryConfig, RegistryStore, Scope};
pub use stacked::StackedStore;
pub use store::{BlobStat, ByteStream, DescriptorTemplate, Flavor, OciStore, PushTarget};
