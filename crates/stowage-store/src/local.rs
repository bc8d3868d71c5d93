//! Filesystem store.
//!
//! Objects live at `<root>/<blobs|manifests>/sha256/<hex>`. Every write is
//! staged under `<root>/staging` and published with a no-clobber rename, so
//! readers never see a partial object and concurrent writers of the same
//! digest settle on whichever copy landed first.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use stowage_common::{StowageError, StowagePaths, StowageResult};
use stowage_oci::{Descriptor, Digest, DigestHasher};
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument};

use crate::store::{
    BlobStat, ByteStream, DescriptorTemplate, Flavor, OciStore, check_received, settle_existing,
};

const KIND: &str = "local";

/// Store rooted in a local directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    paths: StowagePaths,
}

impl LocalStore {
    /// Store for `identifier`, resolved with [`StowagePaths::resolve`].
    ///
    /// Directories are not created; call [`LocalStore::init`] or use
    /// [`LocalStore::open`].
    #[must_use]
    pub fn new(identifier: &str) -> Self {
        Self {
            paths: StowagePaths::resolve(identifier),
        }
    }

    /// Store rooted at an explicit directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            paths: StowagePaths::with_root(root),
        }
    }

    /// Resolve `identifier` and create the directory layout.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directories cannot be created.
    pub async fn open(identifier: &str) -> StowageResult<Self> {
        let store = Self::new(identifier);
        store.init().await?;
        Ok(store)
    }

    /// Create the directory layout.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directories cannot be created.
    pub async fn init(&self) -> StowageResult<()> {
        for dir in [
            self.paths.blobs(),
            self.paths.manifests(),
            self.paths.staging(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        debug!(root = %self.paths.root.display(), "Initialized local store");
        Ok(())
    }

    /// Store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    /// Where an object lives (whether or not it exists).
    #[must_use]
    pub fn object_path(&self, flavor: Flavor, digest: &Digest) -> PathBuf {
        self.paths
            .object(flavor.dir_name(), digest.algorithm(), digest.hex())
    }

    async fn existing_size(path: &Path) -> StowageResult<Option<u64>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Existing object settles the write; `true` means nothing more to do.
    async fn already_present(path: &Path, digest: &Digest, size: u64) -> StowageResult<bool> {
        match Self::existing_size(path).await? {
            Some(existing) => settle_existing(digest, existing, size).map(|()| true),
            None => Ok(false),
        }
    }

    fn stage(&self) -> StowageResult<(tokio::fs::File, TempPath)> {
        let staged = tempfile::Builder::new()
            .prefix("ingest-")
            .tempfile_in(self.paths.staging())?;
        let (file, path) = staged.into_parts();
        Ok((tokio::fs::File::from_std(file), path))
    }

    /// Move a staged file into place without replacing an existing object.
    fn publish(staged: TempPath, target: &Path, digest: &Digest, size: u64) -> StowageResult<()> {
        match staged.persist_noclobber(target) {
            Ok(()) => {
                debug!(%digest, size, path = %target.display(), "Published object");
                Ok(())
            }
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                // Lost a race with another writer; the staged copy is dropped.
                let existing = std::fs::metadata(target)?.len();
                settle_existing(digest, existing, size)
            }
            Err(e) => Err(e.error.into()),
        }
    }

    fn not_found(flavor: Flavor, digest: &Digest) -> StowageError {
        StowageError::not_found(KIND, format!("{flavor} {digest}"))
    }
}

#[async_trait]
impl OciStore for LocalStore {
    fn kind(&self) -> &'static str {
        KIND
    }

    #[instrument(skip(self, template, data), fields(size = data.len()))]
    async fn put_from_bytes(
        &self,
        flavor: Flavor,
        template: DescriptorTemplate,
        data: Bytes,
    ) -> StowageResult<Descriptor> {
        let descriptor = template.complete(&data)?;
        let target = self.object_path(flavor, &descriptor.digest);
        if Self::already_present(&target, &descriptor.digest, descriptor.size).await? {
            return Ok(descriptor);
        }

        let (mut file, staged) = self.stage()?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        Self::publish(staged, &target, &descriptor.digest, descriptor.size)?;
        Ok(descriptor)
    }

    #[instrument(skip(self, descriptor, stream), fields(digest = %descriptor.digest))]
    async fn put_from_stream(
        &self,
        flavor: Flavor,
        descriptor: &Descriptor,
        mut stream: ByteStream,
    ) -> StowageResult<Descriptor> {
        let target = self.object_path(flavor, &descriptor.digest);
        if Self::already_present(&target, &descriptor.digest, descriptor.size).await? {
            return Ok(descriptor.clone());
        }

        let (mut file, staged) = self.stage()?;
        let mut hasher = DigestHasher::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        drop(file);

        check_received(descriptor, hasher)?;
        Self::publish(staged, &target, &descriptor.digest, descriptor.size)?;
        Ok(descriptor.clone())
    }

    /// Copies the file without rehashing it; only the size is checked.
    async fn put_from_file(
        &self,
        flavor: Flavor,
        descriptor: &Descriptor,
        path: &Path,
    ) -> StowageResult<Descriptor> {
        let target = self.object_path(flavor, &descriptor.digest);
        if Self::already_present(&target, &descriptor.digest, descriptor.size).await? {
            return Ok(descriptor.clone());
        }

        let (file, staged) = self.stage()?;
        drop(file);
        let copied = tokio::fs::copy(path, &staged).await?;
        if copied != descriptor.size {
            return Err(StowageError::SizeMismatch {
                digest: descriptor.digest.to_string(),
                expected: descriptor.size,
                actual: copied,
            });
        }

        Self::publish(staged, &target, &descriptor.digest, descriptor.size)?;
        Ok(descriptor.clone())
    }

    async fn stat(&self, flavor: Flavor, digest: &Digest) -> StowageResult<Option<BlobStat>> {
        Ok(Self::existing_size(&self.object_path(flavor, digest))
            .await?
            .map(|size| BlobStat { size }))
    }

    async fn describe_manifest(&self, _reference: &str) -> StowageResult<Descriptor> {
        Err(StowageError::unsupported(KIND, "describe_manifest"))
    }

    async fn get_full(&self, flavor: Flavor, digest: &Digest) -> StowageResult<Bytes> {
        match tokio::fs::read(self.object_path(flavor, digest)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Self::not_found(flavor, digest)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_stream(&self, flavor: Flavor, digest: &Digest) -> StowageResult<ByteStream> {
        match tokio::fs::File::open(self.object_path(flavor, digest)).await {
            Ok(file) => Ok(ReaderStream::new(file).map_err(StowageError::from).boxed()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Self::not_found(flavor, digest)),
            Err(e) => Err(e.into()),
        }
    }
}
