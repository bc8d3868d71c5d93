//! Publishing a stored artifact graph to a registry.

use std::sync::Arc;

use bytes::Bytes;
use stowage_common::{StowageError, StowageResult};
use stowage_oci::{Descriptor, Digest, ImageManifest, Manifest, ManifestBody, sniff_media_type};
use stowage_store::{Flavor, OciStore, PushTarget};
use tracing::{debug, info, instrument};

use crate::progress::{ProgressEvent, ProgressReporter, TransferReport};

/// Uploads manifests and their blobs from `source` to a [`PushTarget`].
pub struct Pusher {
    source: Arc<dyn OciStore>,
    target: Arc<dyn PushTarget>,
    progress: ProgressReporter,
}

impl std::fmt::Debug for Pusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pusher")
            .field("source", &self.source.kind())
            .finish_non_exhaustive()
    }
}

impl Pusher {
    /// Push from `source` into `target`.
    #[must_use]
    pub fn new(source: Arc<dyn OciStore>, target: Arc<dyn PushTarget>) -> Self {
        Self {
            source,
            target,
            progress: ProgressReporter::silent(),
        }
    }

    /// Report progress through `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    /// Push the manifest stored under `digest`, naming it `reference` at the target.
    ///
    /// Child manifests of an index are put by digest before the index itself.
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::RegistryDigestMismatch`] if the target stores
    /// any manifest under a digest other than the source's, and fails on the
    /// first store or transport error.
    #[instrument(skip(self), fields(digest = %digest))]
    pub async fn push(&self, digest: &Digest, reference: &str) -> StowageResult<TransferReport> {
        let (manifest, bytes) = self.fetch_manifest(digest).await?;
        let descriptor = Descriptor::new(manifest.media_type(), digest.clone(), bytes.len() as u64);
        let mut report = TransferReport::new(descriptor.clone());

        match &manifest.body {
            ManifestBody::Index(index) => {
                debug!(children = index.manifests.len(), "Pushing index");
                for child in &index.manifests {
                    self.push_image(&child.descriptor, &mut report).await?;
                }
            }
            ManifestBody::Image(image) => self.push_blobs(image, &mut report).await?,
        }

        self.put_manifest(&descriptor, reference, bytes, &mut report).await?;
        info!(
            reference,
            uploaded = report.blobs_copied,
            skipped = report.blobs_skipped,
            "Push complete"
        );
        Ok(report)
    }

    async fn fetch_manifest(&self, digest: &Digest) -> StowageResult<(Manifest, Bytes)> {
        let bytes = self.source.get_full(Flavor::Manifest, digest).await?;
        digest.verify(&bytes)?;
        let fallback = sniff_media_type(&bytes)?;
        let manifest = Manifest::parse(&bytes, Some(&fallback))?;
        Ok((manifest, bytes))
    }

    async fn push_image(
        &self,
        child: &Descriptor,
        report: &mut TransferReport,
    ) -> StowageResult<()> {
        let (manifest, bytes) = self.fetch_manifest(&child.digest).await?;
        let ManifestBody::Image(image) = &manifest.body else {
            return Err(StowageError::UnsupportedMediaType {
                media_type: format!("{} nested in an index", manifest.media_type()),
            });
        };

        self.push_blobs(image, report).await?;
        let descriptor = Descriptor::new(manifest.media_type(), child.digest.clone(), child.size);
        self.put_manifest(&descriptor, child.digest.as_str(), bytes, report).await
    }

    async fn push_blobs(
        &self,
        image: &ImageManifest,
        report: &mut TransferReport,
    ) -> StowageResult<()> {
        for blob in image.blobs() {
            if self.target.has_blob(&blob.digest).await? {
                debug!(digest = %blob.digest, "Blob already in registry");
                report.skipped(&self.progress, blob);
                continue;
            }

            self.progress.report(ProgressEvent::BlobStarted {
                digest: blob.digest.clone(),
                size: blob.size,
            });
            let stream = self.source.get_stream(Flavor::Blob, &blob.digest).await?;
            let (stream, _) = self.progress.track(blob, stream);
            self.target.upload_blob(blob, stream).await?;
            report.copied(&self.progress, blob, blob.size);
        }
        Ok(())
    }

    async fn put_manifest(
        &self,
        descriptor: &Descriptor,
        reference: &str,
        bytes: Bytes,
        report: &mut TransferReport,
    ) -> StowageResult<()> {
        let confirmed = self
            .target
            .put_manifest(reference, &descriptor.media_type, bytes)
            .await?;
        if confirmed != descriptor.digest {
            return Err(StowageError::RegistryDigestMismatch {
                expected: descriptor.digest.to_string(),
                actual: confirmed.to_string(),
            });
        }
        report.manifest(&self.progress, descriptor);
        Ok(())
    }
}
