//! Copying an artifact graph out of a source store.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use stowage_common::{StowageError, StowageResult};
use stowage_oci::{Descriptor, Manifest, ManifestBody, ManifestKind};
use stowage_store::store::settle_existing;
use stowage_store::{DescriptorTemplate, Flavor, OciStore};
use tracing::{debug, info, instrument};

use crate::progress::{ProgressEvent, ProgressReporter, TransferReport};

/// Annotation recording where a pulled manifest came from.
pub const ORIGIN_ANNOTATION: &str = "vnd.stowage.origin";

/// Materializes manifests and their blobs from `source` into `target`.
///
/// Blobs move one at a time and manifests are written only after every blob
/// they reference is in place, so an interrupted pull can simply be re-run.
pub struct Puller {
    source: Arc<dyn OciStore>,
    target: Arc<dyn OciStore>,
    origin: String,
    progress: ProgressReporter,
}

impl std::fmt::Debug for Puller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Puller")
            .field("source", &self.source.kind())
            .field("target", &self.target.kind())
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl Puller {
    /// Pull from `source` into `target`, annotating manifests with `origin`.
    #[must_use]
    pub fn new(
        source: Arc<dyn OciStore>,
        target: Arc<dyn OciStore>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            source,
            target,
            origin: origin.into(),
            progress: ProgressReporter::silent(),
        }
    }

    /// Report progress through `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    /// Resolve `reference` in the source and copy everything it points at.
    ///
    /// # Errors
    ///
    /// Fails on the first store error. Blobs already written stay in the
    /// target.
    #[instrument(skip(self), fields(origin = %self.origin))]
    pub async fn pull(&self, reference: &str) -> StowageResult<TransferReport> {
        let descriptor = self.source.describe_manifest(reference).await?;
        info!(
            digest = %descriptor.digest,
            media_type = %descriptor.media_type,
            "Resolved manifest"
        );
        self.progress.report(ProgressEvent::Resolved {
            reference: reference.to_string(),
            descriptor: descriptor.clone(),
        });

        self.pull_descriptor(&descriptor).await
    }

    /// Copy the manifest `descriptor` names, and everything below it.
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::UnsupportedMediaType`] for unrecognised
    /// manifest kinds and for indexes nested inside indexes.
    pub async fn pull_descriptor(&self, descriptor: &Descriptor) -> StowageResult<TransferReport> {
        let (manifest, bytes) = self.fetch_manifest(descriptor).await?;
        let mut report = TransferReport::new(descriptor.clone());

        match manifest.body {
            ManifestBody::Index(index) => {
                debug!(children = index.manifests.len(), "Pulling index");
                for child in &index.manifests {
                    self.pull_image(&child.descriptor, &mut report).await?;
                }
            }
            ManifestBody::Image(image) => {
                for blob in image.blobs() {
                    self.copy_blob(blob, &mut report).await?;
                }
            }
        }

        let written = self.write_manifest(descriptor, bytes, &mut report).await?;
        report.descriptor = written;
        info!(
            copied = report.blobs_copied,
            skipped = report.blobs_skipped,
            bytes = report.bytes_copied,
            "Pull complete"
        );
        Ok(report)
    }

    async fn pull_image(
        &self,
        descriptor: &Descriptor,
        report: &mut TransferReport,
    ) -> StowageResult<()> {
        let (manifest, bytes) = self.fetch_manifest(descriptor).await?;
        let ManifestBody::Image(image) = manifest.body else {
            return Err(StowageError::UnsupportedMediaType {
                media_type: format!("{} nested in an index", manifest.kind.media_type()),
            });
        };

        for blob in image.blobs() {
            self.copy_blob(blob, report).await?;
        }
        self.write_manifest(descriptor, bytes, report).await?;
        Ok(())
    }

    async fn fetch_manifest(&self, descriptor: &Descriptor) -> StowageResult<(Manifest, Bytes)> {
        ManifestKind::parse(&descriptor.media_type)?;

        let bytes = self
            .source
            .get_full(Flavor::Manifest, &descriptor.digest)
            .await?;
        descriptor.digest.verify(&bytes)?;

        let manifest = Manifest::parse(&bytes, Some(&descriptor.media_type))?;
        Ok((manifest, bytes))
    }

    #[instrument(skip(self, blob, report), fields(digest = %blob.digest, size = blob.size))]
    async fn copy_blob(&self, blob: &Descriptor, report: &mut TransferReport) -> StowageResult<()> {
        if let Some(existing) = self.target.stat(Flavor::Blob, &blob.digest).await? {
            settle_existing(&blob.digest, existing.size, blob.size)?;
            info!("Blob already present");
            report.skipped(&self.progress, blob);
            return Ok(());
        }

        self.progress.report(ProgressEvent::BlobStarted {
            digest: blob.digest.clone(),
            size: blob.size,
        });
        let stream = self.source.get_stream(Flavor::Blob, &blob.digest).await?;
        let (stream, counter) = self.progress.track(blob, stream);
        self.target
            .put_from_stream(Flavor::Blob, blob, stream)
            .await?;

        // Zero means the target found the blob itself and never read the stream.
        let transferred = counter.load(Ordering::Relaxed);
        if transferred != 0 && transferred != blob.size {
            return Err(StowageError::SizeMismatch {
                digest: blob.digest.to_string(),
                expected: blob.size,
                actual: transferred,
            });
        }

        debug!(transferred, "Blob copied");
        report.copied(&self.progress, blob, transferred);
        Ok(())
    }

    async fn write_manifest(
        &self,
        descriptor: &Descriptor,
        bytes: Bytes,
        report: &mut TransferReport,
    ) -> StowageResult<Descriptor> {
        let template =
            DescriptorTemplate::from(descriptor).with_annotation(ORIGIN_ANNOTATION, &self.origin);
        let written = self
            .target
            .put_from_bytes(Flavor::Manifest, template, bytes)
            .await?;
        report.manifest(&self.progress, &written);
        Ok(written)
    }
}
