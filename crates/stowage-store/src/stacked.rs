//! Read-through composition of several stores with one write sink.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use stowage_common::{StowageError, StowageResult};
use stowage_oci::{Descriptor, Digest};
use tracing::{debug, trace};

use crate::store::{BlobStat, ByteStream, DescriptorTemplate, Flavor, OciStore};

const KIND: &str = "stacked";

/// Several stores presented as one.
///
/// Reads consult the writable store first, then each read-only store in
/// order; the first source that has the object answers. A miss
/// ([`StowageError::NotFound`]) or an operation the source does not support
/// moves on to the next source, while any other error stops the lookup.
/// Writes go to the writable store only.
#[derive(Clone, Default)]
pub struct StackedStore {
    writable: Option<Arc<dyn OciStore>>,
    readable: Vec<Arc<dyn OciStore>>,
}

impl std::fmt::Debug for StackedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackedStore")
            .field("writable", &self.writable.as_ref().map(|s| s.kind()))
            .field(
                "readable",
                &self.readable.iter().map(|s| s.kind()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl StackedStore {
    /// Stack of `readable` sources plus an optional write sink.
    #[must_use]
    pub fn new(readable: Vec<Arc<dyn OciStore>>, writable: Option<Arc<dyn OciStore>>) -> Self {
        Self { writable, readable }
    }

    /// Set the write sink.
    #[must_use]
    pub fn with_writable(mut self, store: Arc<dyn OciStore>) -> Self {
        self.writable = Some(store);
        self
    }

    /// Append a read-only source.
    #[must_use]
    pub fn with_readable(mut self, store: Arc<dyn OciStore>) -> Self {
        self.readable.push(store);
        self
    }

    fn sources(&self) -> impl Iterator<Item = &Arc<dyn OciStore>> {
        self.writable.iter().chain(self.readable.iter())
    }

    fn sink(&self) -> StowageResult<&Arc<dyn OciStore>> {
        self.writable
            .as_ref()
            .ok_or_else(|| StowageError::Configuration {
                message: "No writable store registered; write refused".to_string(),
            })
    }

    async fn first_hit<'s, T, F, Fut>(&'s self, what: &str, op: F) -> StowageResult<T>
    where
        F: Fn(&'s dyn OciStore) -> Fut,
        Fut: Future<Output = StowageResult<T>>,
    {
        let mut miss = None;
        let mut unsupported = None;

        for store in self.sources() {
            match op(store.as_ref()).await {
                Ok(value) => {
                    trace!(source = store.kind(), what, "Stacked read hit");
                    return Ok(value);
                }
                Err(e) if e.is_not_found() => {
                    debug!(source = store.kind(), what, "Missed, trying next source");
                    miss.get_or_insert(e);
                }
                Err(e) if e.is_unsupported() => {
                    unsupported.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(miss
            .or(unsupported)
            .unwrap_or_else(|| StowageError::not_found(KIND, what)))
    }
}

#[async_trait]
impl OciStore for StackedStore {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn put_from_bytes(
        &self,
        flavor: Flavor,
        template: DescriptorTemplate,
        data: Bytes,
    ) -> StowageResult<Descriptor> {
        self.sink()?.put_from_bytes(flavor, template, data).await
    }

    async fn put_from_stream(
        &self,
        flavor: Flavor,
        descriptor: &Descriptor,
        stream: ByteStream,
    ) -> StowageResult<Descriptor> {
        self.sink()?
            .put_from_stream(flavor, descriptor, stream)
            .await
    }

    async fn put_from_file(
        &self,
        flavor: Flavor,
        descriptor: &Descriptor,
        path: &Path,
    ) -> StowageResult<Descriptor> {
        self.sink()?.put_from_file(flavor, descriptor, path).await
    }

    async fn stat(&self, flavor: Flavor, digest: &Digest) -> StowageResult<Option<BlobStat>> {
        for store in self.sources() {
            match store.stat(flavor, digest).await {
                Ok(Some(stat)) => return Ok(Some(stat)),
                Ok(None) => {}
                Err(e) if e.is_not_found() || e.is_unsupported() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn describe_manifest(&self, reference: &str) -> StowageResult<Descriptor> {
        self.first_hit(reference, |store| store.describe_manifest(reference))
            .await
    }

    async fn get_full(&self, flavor: Flavor, digest: &Digest) -> StowageResult<Bytes> {
        self.first_hit(digest.as_str(), |store| store.get_full(flavor, digest))
            .await
    }

    async fn get_stream(&self, flavor: Flavor, digest: &Digest) -> StowageResult<ByteStream> {
        self.first_hit(digest.as_str(), |store| store.get_stream(flavor, digest))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use stowage_oci::media_types;

    use super::*;
    use crate::memory::InMemoryStore;

    /// Source whose every call fails with a transport error.
    #[derive(Default)]
    struct Broken {
        calls: AtomicUsize,
    }

    impl Broken {
        fn fail<T>(&self) -> StowageResult<T> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StowageError::Network {
                message: "boom".to_string(),
            })
        }
    }

    #[async_trait]
    impl OciStore for Broken {
        fn kind(&self) -> &'static str {
            "broken"
        }

        async fn put_from_bytes(
            &self,
            _flavor: Flavor,
            _template: DescriptorTemplate,
            _data: Bytes,
        ) -> StowageResult<Descriptor> {
            self.fail()
        }

        async fn put_from_stream(
            &self,
            _flavor: Flavor,
            _descriptor: &Descriptor,
            _stream: ByteStream,
        ) -> StowageResult<Descriptor> {
            self.fail()
        }

        async fn put_from_file(
            &self,
            _flavor: Flavor,
            _descriptor: &Descriptor,
            _path: &Path,
        ) -> StowageResult<Descriptor> {
            self.fail()
        }

        async fn stat(&self, _flavor: Flavor, _digest: &Digest) -> StowageResult<Option<BlobStat>> {
            self.fail()
        }

        async fn describe_manifest(&self, _reference: &str) -> StowageResult<Descriptor> {
            self.fail()
        }

        async fn get_full(&self, _flavor: Flavor, _digest: &Digest) -> StowageResult<Bytes> {
            self.fail()
        }

        async fn get_stream(&self, _flavor: Flavor, _digest: &Digest) -> StowageResult<ByteStream> {
            self.fail()
        }
    }

    fn is_boom(err: &StowageError) -> bool {
        matches!(err, StowageError::Network { message } if message == "boom")
    }

    async fn put(store: &InMemoryStore, data: &'static [u8]) -> Descriptor {
        store
            .put_from_bytes(
                Flavor::Blob,
                DescriptorTemplate::new(media_types::LAYER_TAR),
                Bytes::from_static(data),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn reads_fall_through_in_order() {
        let first = Arc::new(InMemoryStore::new());
        let second = Arc::new(InMemoryStore::new());
        let only_second = put(&second, b"deep").await;

        let stacked = StackedStore::new(
            vec![first as Arc<dyn OciStore>, second as Arc<dyn OciStore>],
            None,
        );
        let data = stacked.get_full(Flavor::Blob, &only_second.digest).await.unwrap();
        assert_eq!(&data[..], b"deep");
        assert_eq!(
            stacked.stat(Flavor::Blob, &only_second.digest).await.unwrap(),
            Some(BlobStat { size: 4 })
        );

        let absent = Digest::of(b"nowhere");
        assert!(stacked.get_full(Flavor::Blob, &absent).await.unwrap_err().is_not_found());
        assert!(stacked.stat(Flavor::Blob, &absent).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writes_need_a_sink() {
        let readable = Arc::new(InMemoryStore::new()) as Arc<dyn OciStore>;
        let stacked = StackedStore::new(vec![readable], None);
        let err = stacked
            .put_from_bytes(
                Flavor::Blob,
                DescriptorTemplate::new(media_types::LAYER_TAR),
                Bytes::from_static(b"x"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StowageError::Configuration { .. }));
    }

    #[tokio::test]
    async fn writes_go_only_to_sink_and_sink_is_read_first() {
        let sink = Arc::new(InMemoryStore::new());
        let below = Arc::new(InMemoryStore::new());
        let stacked = StackedStore::default()
            .with_readable(below.clone())
            .with_writable(sink.clone());

        let descriptor = stacked
            .put_from_bytes(
                Flavor::Blob,
                DescriptorTemplate::new(media_types::LAYER_TAR),
                Bytes::from_static(b"new"),
            )
            .await
            .unwrap();
        assert_eq!(sink.len(Flavor::Blob), 1);
        assert!(below.is_empty());
        assert!(stacked.stat(Flavor::Blob, &descriptor.digest).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unsupported_sources_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let local = Arc::new(crate::local::LocalStore::with_root(dir.path()));
        local.init().await.unwrap();

        let memory = Arc::new(InMemoryStore::new());
        let manifest = Bytes::from(format!(
            r#"{{"schemaVersion":2,"mediaType":"{}","manifests":[]}}"#,
            media_types::INDEX
        ));
        let descriptor = memory
            .put_from_bytes(Flavor::Manifest, DescriptorTemplate::new(media_types::INDEX), manifest)
            .await
            .unwrap();
        memory.tag("v1", descriptor.clone());

        let stacked = StackedStore::new(
            vec![memory as Arc<dyn OciStore>],
            Some(local.clone() as Arc<dyn OciStore>),
        );
        assert_eq!(stacked.describe_manifest("v1").await.unwrap(), descriptor);

        let only_local = StackedStore::new(Vec::new(), Some(local as Arc<dyn OciStore>));
        assert!(only_local.describe_manifest("v1").await.unwrap_err().is_unsupported());
    }

    #[tokio::test]
    async fn transport_errors_stop_the_lookup() {
        let broken = Arc::new(Broken::default());
        let healthy = Arc::new(InMemoryStore::new());
        let blob = put(&healthy, b"present").await;
        let manifest = Bytes::from(format!(
            r#"{{"schemaVersion":2,"mediaType":"{}","manifests":[]}}"#,
            media_types::INDEX
        ));
        let index = healthy
            .put_from_bytes(Flavor::Manifest, DescriptorTemplate::new(media_types::INDEX), manifest)
            .await
            .unwrap();
        healthy.tag("v1", index);

        let stacked = StackedStore::new(
            vec![broken.clone() as Arc<dyn OciStore>, healthy as Arc<dyn OciStore>],
            None,
        );

        let err = stacked.get_full(Flavor::Blob, &blob.digest).await.unwrap_err();
        assert!(is_boom(&err), "{err}");
        let Err(err) = stacked.get_stream(Flavor::Blob, &blob.digest).await else {
            panic!("stream served past a failing source");
        };
        assert!(is_boom(&err), "{err}");
        let err = stacked.describe_manifest("v1").await.unwrap_err();
        assert!(is_boom(&err), "{err}");
        let err = stacked.stat(Flavor::Blob, &blob.digest).await.unwrap_err();
        assert!(is_boom(&err), "{err}");

        assert_eq!(broken.calls.load(Ordering::SeqCst), 4);
    }
}
