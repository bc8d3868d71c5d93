//! The store contract shared by every backend.
//!
//! A store holds two content-addressed namespaces ([`Flavor::Blob`] and
//! [`Flavor::Manifest`]) keyed by [`Digest`]. Writes are idempotent: putting
//! bytes that are already present is a no-op, while a size disagreement under
//! one digest is reported as [`StowageError::DigestClash`].

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use stowage_common::{StowageError, StowageResult};
use stowage_oci::{Descriptor, Digest, DigestHasher};
use tokio_util::io::ReaderStream;

/// Streamed object content.
pub type ByteStream = BoxStream<'static, StowageResult<Bytes>>;

/// Namespace partition of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flavor {
    /// Configs and layers.
    Blob,
    /// Manifests and indexes.
    Manifest,
}

impl Flavor {
    /// Singular name, used in messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Manifest => "manifest",
        }
    }

    /// Directory name in on-disk layouts.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Blob => "blobs",
            Self::Manifest => "manifests",
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an existence probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobStat {
    /// Stored size in bytes.
    pub size: u64,
}

/// A descriptor whose digest and size are not known yet.
///
/// Input to [`OciStore::put_from_bytes`]; the store fills in the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorTemplate {
    /// Media type of the content.
    pub media_type: String,
    /// Expected digest; verified against the content when present.
    pub digest: Option<Digest>,
    /// Annotations carried into the completed descriptor.
    pub annotations: HashMap<String, String>,
}

impl DescriptorTemplate {
    /// Template with only a media type.
    #[must_use]
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            digest: None,
            annotations: HashMap::new(),
        }
    }

    /// Expect the content to hash to `digest`.
    #[must_use]
    pub fn with_digest(mut self, digest: Digest) -> Self {
        self.digest = Some(digest);
        self
    }

    /// Add one annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Check `data` against the expected digest and complete the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::DigestMismatch`] if a digest was supplied and
    /// `data` does not hash to it.
    pub fn complete(self, data: &[u8]) -> StowageResult<Descriptor> {
        let actual = Digest::of(data);
        if let Some(expected) = &self.digest {
            if expected != &actual {
                return Err(StowageError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        let mut descriptor = Descriptor::new(self.media_type, actual, data.len() as u64);
        descriptor.annotations = self.annotations;
        Ok(descriptor)
    }
}

impl From<&Descriptor> for DescriptorTemplate {
    fn from(descriptor: &Descriptor) -> Self {
        Self {
            media_type: descriptor.media_type.clone(),
            digest: Some(descriptor.digest.clone()),
            annotations: descriptor.annotations.clone(),
        }
    }
}

/// Uniform interface over registry, filesystem, in-memory and stacked stores.
///
/// None of the operations retry; retry policy belongs to the caller.
#[async_trait]
pub trait OciStore: Send + Sync {
    /// Short backend name used in logs and errors.
    fn kind(&self) -> &'static str;

    /// Hash `data`, verify any supplied digest, persist it if absent.
    async fn put_from_bytes(
        &self,
        flavor: Flavor,
        template: DescriptorTemplate,
        data: Bytes,
    ) -> StowageResult<Descriptor>;

    /// Persist streamed content described by `descriptor` if absent.
    async fn put_from_stream(
        &self,
        flavor: Flavor,
        descriptor: &Descriptor,
        stream: ByteStream,
    ) -> StowageResult<Descriptor>;

    /// Persist the file at `path`, described by `descriptor`, if absent.
    async fn put_from_file(
        &self,
        flavor: Flavor,
        descriptor: &Descriptor,
        path: &Path,
    ) -> StowageResult<Descriptor>;

    /// Probe for an object. Absence is `Ok(None)`, never an error.
    async fn stat(&self, flavor: Flavor, digest: &Digest) -> StowageResult<Option<BlobStat>>;

    /// Resolve a tag or digest to a manifest descriptor without fetching the body.
    async fn describe_manifest(&self, reference: &str) -> StowageResult<Descriptor>;

    /// Read a whole object.
    async fn get_full(&self, flavor: Flavor, digest: &Digest) -> StowageResult<Bytes>;

    /// Read an object as a stream.
    async fn get_stream(&self, flavor: Flavor, digest: &Digest) -> StowageResult<ByteStream>;
}

/// Destination of a push: the registry-only calls the pusher drives directly.
#[async_trait]
pub trait PushTarget: Send + Sync {
    /// Whether the blob is already present.
    async fn has_blob(&self, digest: &Digest) -> StowageResult<bool>;

    /// Upload a blob from a stream.
    async fn upload_blob(&self, descriptor: &Descriptor, stream: ByteStream) -> StowageResult<()>;

    /// Store a manifest under `reference` (a tag or digest).
    ///
    /// Returns the digest the target computed for the stored bytes.
    async fn put_manifest(
        &self,
        reference: &str,
        media_type: &str,
        body: Bytes,
    ) -> StowageResult<Digest>;
}

/// Single-chunk stream over `data`.
#[must_use]
pub fn stream_from_bytes(data: Bytes) -> ByteStream {
    stream::once(async move { Ok(data) }).boxed()
}

/// Stream the file at `path`.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be opened.
pub async fn file_stream(path: &Path) -> StowageResult<ByteStream> {
    let file = tokio::fs::File::open(path).await?;
    Ok(ReaderStream::new(file).map_err(StowageError::from).boxed())
}

/// Drain a stream into memory.
///
/// # Errors
///
/// Returns the first error the stream yields.
pub async fn collect_stream(stream: ByteStream) -> StowageResult<Bytes> {
    let buffer = stream
        .try_fold(BytesMut::new(), |mut buffer, chunk| async move {
            buffer.extend_from_slice(&chunk);
            Ok(buffer)
        })
        .await?;
    Ok(buffer.freeze())
}

/// Confirm that streamed content matches its descriptor.
///
/// # Errors
///
/// Returns [`StowageError::SizeMismatch`] or [`StowageError::DigestMismatch`].
pub fn check_received(descriptor: &Descriptor, hasher: DigestHasher) -> StowageResult<()> {
    if hasher.len() != descriptor.size {
        return Err(StowageError::SizeMismatch {
            digest: descriptor.digest.to_string(),
            expected: descriptor.size,
            actual: hasher.len(),
        });
    }

    let actual = hasher.finalize();
    if actual != descriptor.digest {
        return Err(StowageError::DigestMismatch {
            expected: descriptor.digest.to_string(),
            actual: actual.to_string(),
        });
    }

    Ok(())
}

/// Compare an existing object's size with incoming content under one digest.
///
/// # Errors
///
/// Returns [`StowageError::DigestClash`] when the sizes differ.
pub fn settle_existing(digest: &Digest, existing: u64, incoming: u64) -> StowageResult<()> {
    if existing == incoming {
        Ok(())
    } else {
        Err(StowageError::DigestClash {
            digest: digest.to_string(),
            existing,
            incoming,
        })
    }
}

#[cfg(test)]
mod tests {
    use stowage_oci::media_types;

    use super::*;

    #[test]
    fn template_completes_and_verifies() {
        let template = DescriptorTemplate::new(media_types::CONFIG).with_annotation("k", "v");
        let descriptor = template.clone().complete(b"{}").unwrap();
        assert_eq!(descriptor.size, 2);
        assert_eq!(descriptor.digest, Digest::of(b"{}"));
        assert_eq!(descriptor.annotations["k"], "v");

        let wrong = template.with_digest(Digest::of(b"other"));
        assert!(matches!(
            wrong.complete(b"{}"),
            Err(StowageError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn check_received_reports_size_before_digest() {
        let descriptor = Descriptor::for_content(media_types::LAYER_TAR, b"abcd");

        let mut short = DigestHasher::new();
        short.update(b"abc");
        assert!(matches!(
            check_received(&descriptor, short),
            Err(StowageError::SizeMismatch { expected: 4, actual: 3, .. })
        ));

        let mut forged = DigestHasher::new();
        forged.update(b"abce");
        assert!(matches!(
            check_received(&descriptor, forged),
            Err(StowageError::DigestMismatch { .. })
        ));

        let mut good = DigestHasher::new();
        good.update(b"abcd");
        check_received(&descriptor, good).unwrap();
    }

    #[tokio::test]
    async fn collect_concatenates_chunks() {
        let chunks = vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))];
        let collected = collect_stream(stream::iter(chunks).boxed()).await.unwrap();
        assert_eq!(&collected[..], b"abcd");
    }

    #[test]
    fn flavor_names() {
        assert_eq!(Flavor::Blob.dir_name(), "blobs");
        assert_eq!(Flavor::Manifest.to_string(), "manifest");
    }
}
