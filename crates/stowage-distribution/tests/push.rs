//! Pushing into in-process push targets.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use common::{seed_image, seed_index};
use parking_lot::Mutex;
use stowage_common::{StowageError, StowageResult};
use stowage_distribution::Pusher;
use stowage_oci::{Descriptor, Digest, media_types};
use stowage_store::{ByteStream, Flavor, InMemoryStore, OciStore, PushTarget};

fn pusher(source: &Arc<InMemoryStore>, target: Arc<dyn PushTarget>) -> Pusher {
    Pusher::new(source.clone() as Arc<dyn OciStore>, target)
}

#[tokio::test]
async fn image_push_uploads_missing_blobs_then_tags() {
    let source = Arc::new(InMemoryStore::new());
    let image = seed_image(source.as_ref(), 1).await;
    let target = Arc::new(InMemoryStore::new());

    let report = pusher(&source, target.clone())
        .push(&image.descriptor.digest, "v1")
        .await
        .unwrap();
    assert_eq!(report.blobs_copied, 2);
    assert_eq!(report.bytes_copied, 1010);
    assert_eq!(report.manifests_written, 1);
    assert_eq!(report.descriptor.media_type, media_types::MANIFEST);

    let tagged = target.describe_manifest("v1").await.unwrap();
    assert_eq!(tagged.digest, image.descriptor.digest);
    for (desc, data) in &image.blobs {
        assert_eq!(&target.get_full(Flavor::Blob, &desc.digest).await.unwrap(), data);
    }

    let again = pusher(&source, target)
        .push(&image.descriptor.digest, "v1")
        .await
        .unwrap();
    assert_eq!(again.blobs_copied, 0);
    assert_eq!(again.blobs_skipped, 2);
}

#[tokio::test]
async fn index_push_puts_children_by_digest_first() {
    let source = Arc::new(InMemoryStore::new());
    let (index, amd64, arm64) = seed_index(source.as_ref()).await;
    let target = Arc::new(Recording::default());

    let report = pusher(&source, target.clone())
        .push(&index.descriptor.digest, "multi")
        .await
        .unwrap();
    assert_eq!(report.blobs_copied, 4);
    assert_eq!(report.manifests_written, 3);

    let puts = target.puts.lock().clone();
    assert_eq!(
        puts,
        vec![
            amd64.descriptor.digest.to_string(),
            arm64.descriptor.digest.to_string(),
            "multi".to_string(),
        ]
    );
    assert_eq!(
        target.inner.describe_manifest("multi").await.unwrap().media_type,
        media_types::INDEX
    );
}

#[tokio::test]
async fn rewritten_digest_aborts_the_push() {
    let source = Arc::new(InMemoryStore::new());
    let image = seed_image(source.as_ref(), 2).await;
    let target = Arc::new(Recording {
        rewrite: true,
        ..Recording::default()
    });

    let err = pusher(&source, target)
        .push(&image.descriptor.digest, "v1")
        .await
        .unwrap_err();
    match err {
        StowageError::RegistryDigestMismatch { expected, actual } => {
            assert_eq!(expected, image.descriptor.digest.to_string());
            assert_ne!(actual, expected);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn rewritten_child_digest_stops_before_the_index() {
    let source = Arc::new(InMemoryStore::new());
    let (index, _, _) = seed_index(source.as_ref()).await;
    let target = Arc::new(Recording {
        rewrite: true,
        ..Recording::default()
    });

    let err = pusher(&source, target.clone())
        .push(&index.descriptor.digest, "multi")
        .await
        .unwrap_err();
    assert!(matches!(err, StowageError::RegistryDigestMismatch { .. }), "{err}");
    assert_eq!(target.puts.lock().len(), 1);
}

#[tokio::test]
async fn missing_source_manifest_is_not_found() {
    let source = Arc::new(InMemoryStore::new());
    let err = pusher(&source, Arc::new(InMemoryStore::new()))
        .push(&Digest::of(b"absent"), "v1")
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err}");
}

/// Push target that records manifest puts and can rewrite digests.
#[derive(Default)]
struct Recording {
    inner: InMemoryStore,
    puts: Mutex<Vec<String>>,
    rewrite: bool,
}

#[async_trait]
impl PushTarget for Recording {
    async fn has_blob(&self, digest: &Digest) -> StowageResult<bool> {
        self.inner.has_blob(digest).await
    }

    async fn upload_blob(&self, descriptor: &Descriptor, stream: ByteStream) -> StowageResult<()> {
        self.inner.upload_blob(descriptor, stream).await
    }

    async fn put_manifest(
        &self,
        reference: &str,
        media_type: &str,
        body: Bytes,
    ) -> StowageResult<Digest> {
        self.puts.lock().push(reference.to_string());
        let digest = self.inner.put_manifest(reference, media_type, body).await?;
        if self.rewrite {
            Ok(Digest::of(b"rewritten by the registry"))
        } else {
            Ok(digest)
        }
    }
}
