//! Pull and push against a mock registry.

mod common;

use std::sync::Arc;

use common::seed_image;
use mockito::{Matcher, Server};
use stowage_distribution::{
    ORIGIN_ANNOTATION, ProgressReporter, pull_full_artifact, push_full_artifact,
};
use stowage_oci::media_types;
use stowage_store::credentials::Anonymous;
use stowage_store::{Flavor, ImageReference, InMemoryStore, OciStore};

#[tokio::test]
async fn pull_full_artifact_from_registry() {
    let mut server = Server::new_async().await;
    let scratch = InMemoryStore::new();
    let image = seed_image(&scratch, 8).await;

    server
        .mock("HEAD", "/v2/team/app/manifests/v1")
        .with_status(200)
        .with_header("content-type", media_types::MANIFEST)
        .with_header("docker-content-digest", image.descriptor.digest.as_str())
        .with_body(image.body.clone())
        .create_async()
        .await;
    server
        .mock(
            "GET",
            format!("/v2/team/app/manifests/{}", image.descriptor.digest).as_str(),
        )
        .with_status(200)
        .with_header("content-type", media_types::MANIFEST)
        .with_body(image.body.clone())
        .create_async()
        .await;
    let mut blob_mocks = Vec::new();
    for (desc, data) in &image.blobs {
        let mock = server
            .mock("GET", format!("/v2/team/app/blobs/{}", desc.digest).as_str())
            .with_status(200)
            .with_body(data.clone())
            .expect(1)
            .create_async()
            .await;
        blob_mocks.push(mock);
    }

    let reference = format!("{}/team/app:v1", server.host_with_port());
    let reference = ImageReference::parse(&reference).unwrap();
    let target = Arc::new(InMemoryStore::new());

    let report = pull_full_artifact(
        target.clone(),
        &reference,
        &Anonymous,
        ProgressReporter::silent(),
    )
    .await
    .unwrap();

    assert_eq!(report.blobs_copied, 2);
    assert_eq!(report.bytes_copied, 1010);
    assert_eq!(
        report.descriptor.annotations[ORIGIN_ANNOTATION],
        format!("{}/team/app", server.host_with_port())
    );
    let stored = target
        .get_full(Flavor::Manifest, &image.descriptor.digest)
        .await
        .unwrap();
    assert_eq!(stored, image.body);

    let again = pull_full_artifact(target, &reference, &Anonymous, ProgressReporter::silent())
        .await
        .unwrap();
    assert_eq!(again.bytes_copied, 0);
    for mock in blob_mocks {
        mock.assert_async().await;
    }
}

#[tokio::test]
async fn push_full_artifact_to_registry_with_forced_tag() {
    let mut server = Server::new_async().await;
    let source = Arc::new(InMemoryStore::new());
    let image = seed_image(source.as_ref(), 9).await;

    let config = &image.blobs[0].0;
    let layer = image.layer();

    server
        .mock("HEAD", format!("/v2/team/app/blobs/{}", config.digest).as_str())
        .with_status(200)
        .with_body(image.blobs[0].1.clone())
        .create_async()
        .await;
    server
        .mock("HEAD", format!("/v2/team/app/blobs/{}", layer.digest).as_str())
        .with_status(404)
        .create_async()
        .await;
    let start = server
        .mock("POST", "/v2/team/app/blobs/uploads/")
        .with_status(202)
        .with_header("location", "/v2/team/app/blobs/uploads/s1")
        .expect(1)
        .create_async()
        .await;
    let finish = server
        .mock("PUT", "/v2/team/app/blobs/uploads/s1")
        .match_query(Matcher::UrlEncoded("digest".into(), layer.digest.to_string()))
        .with_status(201)
        .create_async()
        .await;
    let manifest = server
        .mock("PUT", "/v2/team/app/manifests/release")
        .match_header("content-type", media_types::MANIFEST)
        .match_body(Matcher::Exact(String::from_utf8(image.body.to_vec()).unwrap()))
        .with_status(201)
        .with_header("docker-content-digest", image.descriptor.digest.as_str())
        .create_async()
        .await;

    let destination = format!("{}/team/app:v1", server.host_with_port());
    let destination = ImageReference::parse(&destination).unwrap();
    let report = push_full_artifact(
        source as Arc<dyn OciStore>,
        &image.descriptor.digest,
        &destination,
        Some("release"),
        &Anonymous,
        ProgressReporter::silent(),
    )
    .await
    .unwrap();

    assert_eq!(report.blobs_copied, 1);
    assert_eq!(report.blobs_skipped, 1);
    start.assert_async().await;
    finish.assert_async().await;
    manifest.assert_async().await;
}
