//! Assembling image manifests from raw blobs.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use stowage_common::StowageResult;

use crate::digest::Digest;
use crate::image::{Descriptor, ImageManifest, media_types};
use crate::json::to_canonical_json;

/// Bytes of the OCI empty JSON object (`{}`).
pub const EMPTY_JSON: &[u8] = b"{}";

/// Descriptor for [`EMPTY_JSON`], with the content inlined.
#[must_use]
pub fn empty_json_descriptor() -> Descriptor {
    let mut descriptor = Descriptor::for_content(media_types::EMPTY_JSON, EMPTY_JSON);
    descriptor.data = Some("e30=".to_string());
    descriptor
}

/// Builds an OCI image manifest while collecting the blobs it references.
///
/// The config defaults to the empty JSON descriptor until one is set.
#[derive(Debug, Clone)]
pub struct ImageManifestBuilder {
    config: Descriptor,
    layers: Vec<Descriptor>,
    annotations: HashMap<String, String>,
    blobs: BTreeMap<Digest, (Descriptor, Bytes)>,
}

impl Default for ImageManifestBuilder {
    fn default() -> Self {
        Self {
            config: empty_json_descriptor(),
            layers: Vec::new(),
            annotations: HashMap::new(),
            blobs: BTreeMap::new(),
        }
    }
}

impl ImageManifestBuilder {
    /// Start an empty manifest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash `content` and keep it for later upload.
    pub fn write_blob(&mut self, media_type: &str, content: impl Into<Bytes>) -> Descriptor {
        let content = content.into();
        let descriptor = Descriptor::for_content(media_type, &content);
        self.blobs
            .insert(descriptor.digest.clone(), (descriptor.clone(), content));
        descriptor
    }

    /// Use `descriptor` as the image config.
    pub fn set_config(&mut self, descriptor: Descriptor) -> &mut Self {
        self.config = descriptor;
        self
    }

    /// Append a layer.
    pub fn add_layer(&mut self, descriptor: Descriptor) -> &mut Self {
        self.layers.push(descriptor);
        self
    }

    /// Set a manifest-level annotation.
    pub fn set_annotation(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Blobs written so far, keyed by digest.
    pub fn blobs(&self) -> impl Iterator<Item = (&Descriptor, &Bytes)> {
        self.blobs.values().map(|(d, b)| (d, b))
    }

    /// Current manifest document.
    #[must_use]
    pub fn manifest(&self) -> ImageManifest {
        ImageManifest {
            schema_version: 2,
            media_type: Some(media_types::MANIFEST.to_string()),
            artifact_type: None,
            config: self.config.clone(),
            layers: self.layers.clone(),
            subject: None,
            annotations: self.annotations.clone(),
        }
    }

    /// Encode the manifest canonically and describe it.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the manifest cannot be encoded.
    pub fn build(&self) -> StowageResult<(Descriptor, Bytes)> {
        let bytes = Bytes::from(to_canonical_json(&self.manifest())?);
        let descriptor = Descriptor::for_content(media_types::MANIFEST, &bytes);
        Ok((descriptor, bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Manifest;

    #[test]
    fn empty_json_descriptor_is_well_known() {
        let descriptor = empty_json_descriptor();
        assert_eq!(
            descriptor.digest.as_str(),
            "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
        assert_eq!(descriptor.size, 2);
    }

    #[test]
    fn build_produces_parseable_manifest() {
        let mut builder = ImageManifestBuilder::new();
        let config = builder.write_blob(media_types::CONFIG, &b"{\"os\":\"linux\"}"[..]);
        let layer = builder.write_blob(media_types::LAYER_TAR, vec![0u8; 1000]);
        builder
            .set_config(config.clone())
            .add_layer(layer.clone())
            .set_annotation("org.opencontainers.image.title", "demo");

        let (descriptor, bytes) = builder.build().unwrap();
        assert_eq!(descriptor.size, bytes.len() as u64);
        descriptor.digest.verify(&bytes).unwrap();
        assert_eq!(builder.blobs().count(), 2);

        let parsed = Manifest::parse(&bytes, None).unwrap();
        assert_eq!(parsed.media_type(), media_types::MANIFEST);

        // Building twice is byte-identical.
        assert_eq!(builder.build().unwrap().1, bytes);
    }
}
