//! Artifacts seeded into source stores.

#![allow(dead_code)]

use bytes::Bytes;
use stowage_oci::json::to_canonical_json;
use stowage_oci::{
    Descriptor, ImageIndex, ImageManifestBuilder, ManifestDescriptor, Platform, media_types,
};
use stowage_store::{DescriptorTemplate, Flavor, OciStore};

/// A manifest and the blobs it references, as stored.
pub struct Seeded {
    pub descriptor: Descriptor,
    pub body: Bytes,
    pub blobs: Vec<(Descriptor, Bytes)>,
}

impl Seeded {
    pub fn layer(&self) -> &Descriptor {
        &self.blobs[1].0
    }
}

/// Image with a 10-byte config and one 1000-byte layer filled with `fill` (0-9).
pub async fn seed_image(store: &dyn OciStore, fill: u8) -> Seeded {
    let config = Bytes::from(format!("{{\"fill\":{fill}}}").into_bytes());
    assert_eq!(config.len(), 10);
    let layer = Bytes::from(vec![fill; 1000]);

    let mut builder = ImageManifestBuilder::new();
    let config_desc = builder.write_blob(media_types::CONFIG, config.clone());
    let layer_desc = builder.write_blob(media_types::LAYER_TAR, layer.clone());
    builder.set_config(config_desc.clone()).add_layer(layer_desc.clone());
    let (descriptor, body) = builder.build().unwrap();

    let blobs = vec![(config_desc, config), (layer_desc, layer)];
    for (desc, data) in &blobs {
        store
            .put_from_bytes(Flavor::Blob, DescriptorTemplate::from(desc), data.clone())
            .await
            .unwrap();
    }
    put_manifest(store, &descriptor, body.clone()).await;

    Seeded {
        descriptor,
        body,
        blobs,
    }
}

/// Index over one amd64 and one arm64 image.
pub async fn seed_index(store: &dyn OciStore) -> (Seeded, Seeded, Seeded) {
    let amd64 = seed_image(store, 1).await;
    let arm64 = seed_image(store, 2).await;

    let index = ImageIndex::new(vec![
        ManifestDescriptor::new(amd64.descriptor.clone(), Some(Platform::linux_amd64())),
        ManifestDescriptor::new(arm64.descriptor.clone(), Some(Platform::linux_arm64())),
    ]);
    let body = Bytes::from(to_canonical_json(&index).unwrap());
    let descriptor = Descriptor::for_content(media_types::INDEX, &body);
    put_manifest(store, &descriptor, body.clone()).await;

    let seeded = Seeded {
        descriptor,
        body,
        blobs: Vec::new(),
    };
    (seeded, amd64, arm64)
}

pub async fn put_manifest(store: &dyn OciStore, descriptor: &Descriptor, body: Bytes) {
    store
        .put_from_bytes(Flavor::Manifest, DescriptorTemplate::from(descriptor), body)
        .await
        .unwrap();
}
