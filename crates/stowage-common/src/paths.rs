//! Standard filesystem paths for Stowage.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Directory holding named stores when no explicit path is given.
///
/// `STOWAGE_ROOT` overrides the per-user data directory.
pub static STOWAGE_DATA_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var_os("STOWAGE_ROOT").map_or_else(
        || {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from(".local/share"))
                .join("stowage")
        },
        PathBuf::from,
    )
});

/// Default store identifier.
pub const DEFAULT_STORE: &str = "storage";

/// Only digest algorithm laid out on disk.
pub const SHA256: &str = "sha256";

/// On-disk layout of a filesystem store.
///
/// ```text
/// <root>/blobs/sha256/<hex>
/// <root>/manifests/sha256/<hex>
/// <root>/staging/
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StowagePaths {
    /// Store root directory.
    pub root: PathBuf,
}

impl StowagePaths {
    /// Resolve a store identifier to its root.
    ///
    /// Identifiers that look like paths (`./x`, `../x`, `/x`) are used as is;
    /// anything else names an isolated store under [`STOWAGE_DATA_DIR`].
    #[must_use]
    pub fn resolve(identifier: &str) -> Self {
        let as_path = Path::new(identifier);
        if identifier.starts_with("./") || identifier.starts_with("../") || as_path.is_absolute() {
            Self::with_root(as_path)
        } else {
            Self::with_root(STOWAGE_DATA_DIR.join(identifier))
        }
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory for one namespace (`blobs` or `manifests`) and algorithm.
    #[must_use]
    pub fn namespace(&self, namespace: &str, algorithm: &str) -> PathBuf {
        self.root.join(namespace).join(algorithm)
    }

    /// File for one object.
    #[must_use]
    pub fn object(&self, namespace: &str, algorithm: &str, hex: &str) -> PathBuf {
        self.namespace(namespace, algorithm).join(hex)
    }

    /// Content-addressable blob directory.
    #[must_use]
    pub fn blobs(&self) -> PathBuf {
        self.namespace("blobs", SHA256)
    }

    /// Content-addressable manifest directory.
    #[must_use]
    pub fn manifests(&self) -> PathBuf {
        self.namespace("manifests", SHA256)
    }

    /// Scratch directory for writes that have not been published yet.
    ///
    /// Lives under the root so publishing is a same-filesystem link.
    #[must_use]
    pub fn staging(&self) -> PathBuf {
        self.root.join("staging")
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.blobs())?;
        std::fs::create_dir_all(self.manifests())?;
        std::fs::create_dir_all(self.staging())?;
        Ok(())
    }
}

impl Default for StowagePaths {
    fn default() -> Self {
        Self::resolve(DEFAULT_STORE)
    }
}
