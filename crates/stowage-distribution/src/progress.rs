//! Transfer progress events and reporting.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use stowage_oci::{Descriptor, Digest};
use stowage_store::ByteStream;
use tokio::sync::mpsc;

/// Something that happened during a pull or push.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// The reference resolved to a root manifest.
    Resolved { reference: String, descriptor: Descriptor },
    /// The destination already had this blob.
    BlobSkipped { digest: Digest, size: u64 },
    /// A blob transfer began.
    BlobStarted { digest: Digest, size: u64 },
    /// More bytes of a blob were transferred.
    BlobProgress { digest: Digest, transferred: u64, total: u64 },
    /// A blob transfer completed.
    BlobFinished { digest: Digest, size: u64 },
    /// A manifest was stored at the destination.
    ManifestWritten { digest: Digest, media_type: String },
}

type Callback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Side channel for [`ProgressEvent`]s.
///
/// Cloning shares the same sink.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    callback: Option<Callback>,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("silent", &self.is_silent())
            .finish()
    }
}

impl ProgressReporter {
    /// Discard every event.
    #[must_use]
    pub fn silent() -> Self {
        Self::default()
    }

    /// Call `callback` for every event.
    #[must_use]
    pub fn from_fn(callback: impl Fn(ProgressEvent) + Send + Sync + 'static) -> Self {
        Self {
            callback: Some(Arc::new(callback)),
        }
    }

    /// Forward events into an unbounded channel.
    ///
    /// Events sent after the receiver is dropped are discarded.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let reporter = Self::from_fn(move |event| {
            // Ignore SendError (receiver gone)
            let _ = sender.send(event);
        });
        (reporter, receiver)
    }

    /// Whether events are discarded.
    #[must_use]
    pub const fn is_silent(&self) -> bool {
        self.callback.is_none()
    }

    /// Deliver one event.
    pub fn report(&self, event: ProgressEvent) {
        if let Some(callback) = &self.callback {
            callback(event);
        }
    }

    /// Wrap a blob stream so every chunk reports [`ProgressEvent::BlobProgress`].
    ///
    /// The returned counter holds the number of bytes that passed through.
    pub(crate) fn track(
        &self,
        blob: &Descriptor,
        stream: ByteStream,
    ) -> (ByteStream, Arc<AtomicU64>) {
        let counter = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&counter);
        let reporter = self.clone();
        let digest = blob.digest.clone();
        let total = blob.size;

        let stream = stream
            .inspect_ok(move |chunk| {
                let transferred = seen.fetch_add(chunk.len() as u64, Ordering::Relaxed)
                    + chunk.len() as u64;
                reporter.report(ProgressEvent::BlobProgress {
                    digest: digest.clone(),
                    transferred,
                    total,
                });
            })
            .boxed();

        (stream, counter)
    }
}

/// Outcome of a pull or push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    /// Root manifest as stored at the destination.
    pub descriptor: Descriptor,
    /// Blobs transferred.
    pub blobs_copied: usize,
    /// Blobs the destination already had.
    pub blobs_skipped: usize,
    /// Bytes transferred across all copied blobs.
    pub bytes_copied: u64,
    /// Manifests stored, children and root included.
    pub manifests_written: usize,
}

impl TransferReport {
    pub(crate) const fn new(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            blobs_copied: 0,
            blobs_skipped: 0,
            bytes_copied: 0,
            manifests_written: 0,
        }
    }

    pub(crate) fn skipped(&mut self, reporter: &ProgressReporter, blob: &Descriptor) {
        self.blobs_skipped += 1;
        reporter.report(ProgressEvent::BlobSkipped {
            digest: blob.digest.clone(),
            size: blob.size,
        });
    }

    pub(crate) fn copied(&mut self, reporter: &ProgressReporter, blob: &Descriptor, bytes: u64) {
        self.blobs_copied += 1;
        self.bytes_copied += bytes;
        reporter.report(ProgressEvent::BlobFinished {
            digest: blob.digest.clone(),
            size: blob.size,
        });
    }

    pub(crate) fn manifest(&mut self, reporter: &ProgressReporter, descriptor: &Descriptor) {
        self.manifests_written += 1;
        reporter.report(ProgressEvent::ManifestWritten {
            digest: descriptor.digest.clone(),
            media_type: descriptor.media_type.clone(),
        });
    }
}
