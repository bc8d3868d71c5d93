//! Stowage distribution engine.
//!
//! Walks manifest graphs between stores:
//! - [`Puller`] copies a reference and everything it points at into a store
//! - [`Pusher`] publishes a stored manifest to a registry
//!
//! Only the four recognised manifest kinds are handled. Blobs already present
//! at the destination are skipped, so re-running an interrupted transfer
//! resumes it.

pub mod progress;
pub mod pull;
pub mod push;

use std::sync::Arc;

use stowage_common::StowageResult;
use stowage_oci::Digest;
use stowage_store::{CredentialSource, ImageReference, OciStore, RegistryStore, Scope};

pub use progress::{ProgressEvent, ProgressReporter, TransferReport};
pub use pull::{ORIGIN_ANNOTATION, Puller};
pub use push::Pusher;

/// Pull `reference` from its registry into `target`.
///
/// Manifests are annotated with the repository's canonical name.
///
/// # Errors
///
/// Returns credential, transport and store errors.
pub async fn pull_full_artifact(
    target: Arc<dyn OciStore>,
    reference: &ImageReference,
    credentials: &dyn CredentialSource,
    progress: ProgressReporter,
) -> StowageResult<TransferReport> {
    let registry = RegistryStore::connect(reference, &[Scope::Pull], credentials).await?;
    Puller::new(Arc::new(registry), target, reference.canonical_name())
        .with_progress(progress)
        .pull(reference.target())
        .await
}

/// Push the manifest stored in `source` under `digest` to `destination`.
///
/// `force_tag` replaces whatever tag or digest `destination` names.
///
/// # Errors
///
/// Returns credential, transport and store errors, and
/// [`stowage_common::StowageError::RegistryDigestMismatch`] if the registry
/// stores a manifest under an unexpected digest.
pub async fn push_full_artifact(
    source: Arc<dyn OciStore>,
    digest: &Digest,
    destination: &ImageReference,
    force_tag: Option<&str>,
    credentials: &dyn CredentialSource,
    progress: ProgressReporter,
) -> StowageResult<TransferReport> {
    let destination = match force_tag {
        Some(tag) => destination.with_tag(tag),
        None => destination.clone(),
    };
    let registry =
        RegistryStore::connect(&destination, &[Scope::Pull, Scope::Push], credentials).await?;
    Pusher::new(source, Arc::new(registry))
        .with_progress(progress)
        .push(digest, destination.target())
        .await
}
