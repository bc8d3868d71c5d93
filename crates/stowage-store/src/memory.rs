//! Process-local store, mainly for tests and staging.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use parking_lot::RwLock;
use stowage_common::{StowageError, StowageResult};
use stowage_oci::{Descriptor, Digest, DigestHasher, sniff_media_type};
use tracing::debug;

use crate::store::{
    BlobStat, ByteStream, DescriptorTemplate, Flavor, OciStore, PushTarget, check_received,
    file_stream, settle_existing, stream_from_bytes,
};

const KIND: &str = "memory";

/// Store backed by in-process maps.
///
/// Manifests can additionally be tagged so that
/// [`OciStore::describe_manifest`] resolves names as well as digests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    blobs: RwLock<HashMap<Digest, Bytes>>,
    manifests: RwLock<HashMap<Digest, Bytes>>,
    tags: RwLock<HashMap<String, Descriptor>>,
}

impl InMemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Point `name` at a manifest descriptor.
    pub fn tag(&self, name: impl Into<String>, descriptor: Descriptor) {
        self.tags.write().insert(name.into(), descriptor);
    }

    /// Number of objects of one flavor.
    #[must_use]
    pub fn len(&self, flavor: Flavor) -> usize {
        self.objects(flavor).read().len()
    }

    /// Whether no objects of either flavor are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty() && self.manifests.read().is_empty()
    }

    const fn objects(&self, flavor: Flavor) -> &RwLock<HashMap<Digest, Bytes>> {
        match flavor {
            Flavor::Blob => &self.blobs,
            Flavor::Manifest => &self.manifests,
        }
    }

    fn existing_size(&self, flavor: Flavor, digest: &Digest) -> Option<u64> {
        self.objects(flavor)
            .read()
            .get(digest)
            .map(|data| data.len() as u64)
    }

    fn insert(&self, flavor: Flavor, digest: &Digest, data: Bytes) -> StowageResult<()> {
        let mut objects = self.objects(flavor).write();
        if let Some(existing) = objects.get(digest) {
            return settle_existing(digest, existing.len() as u64, data.len() as u64);
        }
        debug!(%flavor, %digest, size = data.len(), "Stored object in memory");
        objects.insert(digest.clone(), data);
        Ok(())
    }

    fn lookup(&self, flavor: Flavor, digest: &Digest) -> StowageResult<Bytes> {
        self.objects(flavor)
            .read()
            .get(digest)
            .cloned()
            .ok_or_else(|| StowageError::not_found(KIND, format!("{flavor} {digest}")))
    }
}

#[async_trait]
impl OciStore for InMemoryStore {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn put_from_bytes(
        &self,
        flavor: Flavor,
        template: DescriptorTemplate,
        data: Bytes,
    ) -> StowageResult<Descriptor> {
        let descriptor = template.complete(&data)?;
        self.insert(flavor, &descriptor.digest, data)?;
        Ok(descriptor)
    }

    async fn put_from_stream(
        &self,
        flavor: Flavor,
        descriptor: &Descriptor,
        stream: ByteStream,
    ) -> StowageResult<Descriptor> {
        if let Some(existing) = self.existing_size(flavor, &descriptor.digest) {
            settle_existing(&descriptor.digest, existing, descriptor.size)?;
            return Ok(descriptor.clone());
        }

        let (hasher, buffer) = stream
            .try_fold(
                (DigestHasher::new(), BytesMut::new()),
                |(mut hasher, mut buffer), chunk| async move {
                    hasher.update(&chunk);
                    buffer.extend_from_slice(&chunk);
                    Ok((hasher, buffer))
                },
            )
            .await?;
        check_received(descriptor, hasher)?;

        self.insert(flavor, &descriptor.digest, buffer.freeze())?;
        Ok(descriptor.clone())
    }

    async fn put_from_file(
        &self,
        flavor: Flavor,
        descriptor: &Descriptor,
        path: &Path,
    ) -> StowageResult<Descriptor> {
        let stream = file_stream(path).await?;
        self.put_from_stream(flavor, descriptor, stream).await
    }

    async fn stat(&self, flavor: Flavor, digest: &Digest) -> StowageResult<Option<BlobStat>> {
        Ok(self
            .existing_size(flavor, digest)
            .map(|size| BlobStat { size }))
    }

    async fn describe_manifest(&self, reference: &str) -> StowageResult<Descriptor> {
        if let Some(descriptor) = self.tags.read().get(reference) {
            return Ok(descriptor.clone());
        }

        let digest = Digest::parse(reference)
            .map_err(|_| StowageError::not_found(KIND, format!("manifest {reference}")))?;
        let data = self.lookup(Flavor::Manifest, &digest)?;
        Ok(Descriptor::new(
            sniff_media_type(&data)?,
            digest,
            data.len() as u64,
        ))
    }

    async fn get_full(&self, flavor: Flavor, digest: &Digest) -> StowageResult<Bytes> {
        self.lookup(flavor, digest)
    }

    async fn get_stream(&self, flavor: Flavor, digest: &Digest) -> StowageResult<ByteStream> {
        self.lookup(flavor, digest).map(stream_from_bytes)
    }
}

#[async_trait]
impl PushTarget for InMemoryStore {
    async fn has_blob(&self, digest: &Digest) -> StowageResult<bool> {
        Ok(self.existing_size(Flavor::Blob, digest).is_some())
    }

    async fn upload_blob(&self, descriptor: &Descriptor, stream: ByteStream) -> StowageResult<()> {
        self.put_from_stream(Flavor::Blob, descriptor, stream)
            .await
            .map(drop)
    }

    async fn put_manifest(
        &self,
        reference: &str,
        media_type: &str,
        body: Bytes,
    ) -> StowageResult<Digest> {
        let descriptor = self
            .put_from_bytes(Flavor::Manifest, DescriptorTemplate::new(media_type), body)
            .await?;
        if Digest::parse(reference).is_err() {
            self.tag(reference, descriptor.clone());
        }
        Ok(descriptor.digest)
    }
}
