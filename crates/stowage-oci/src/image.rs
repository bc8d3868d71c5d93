//! Manifest documents and the descriptors that link them.
//!
//! Field layout follows OCI image-spec v1.1. Docker v2 schema 2 manifests and
//! manifest lists use the same JSON shape, so one set of structs reads both.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use stowage_common::{StowageError, StowageResult};

use crate::digest::Digest;

/// OCI Image Manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Always 2.
    pub schema_version: u32,
    /// Declared manifest media type; optional for OCI, required for Docker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Set when the manifest carries a non-image artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Config blob.
    pub config: Descriptor,
    /// Image layers.
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    /// Manifest this one refers to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl ImageManifest {
    /// Config followed by every layer, in transfer order.
    pub fn blobs(&self) -> impl Iterator<Item = &Descriptor> {
        std::iter::once(&self.config).chain(self.layers.iter())
    }
}

/// Index (or Docker manifest list) over per-platform manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Always 2.
    pub schema_version: u32,
    /// Declared media type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Set when the index groups non-image artifacts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Children, one per platform.
    pub manifests: Vec<ManifestDescriptor>,
    /// Manifest this index refers to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl ImageIndex {
    /// Create an OCI index over the given children.
    #[must_use]
    pub fn new(manifests: Vec<ManifestDescriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(media_types::INDEX.to_string()),
            artifact_type: None,
            manifests,
            subject: None,
            annotations: HashMap::new(),
        }
    }
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// What the referenced bytes are.
    pub media_type: String,
    /// Content digest.
    pub digest: Digest,
    /// Exact length of the referenced bytes.
    pub size: u64,
    /// URLs for downloading.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    /// Annotations.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    /// Inline copy of the content, base64.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Artifact type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

impl Descriptor {
    /// Create a descriptor with no annotations.
    #[must_use]
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            urls: Vec::new(),
            annotations: HashMap::new(),
            data: None,
            artifact_type: None,
        }
    }

    /// Describe `content` under `media_type`.
    #[must_use]
    pub fn for_content(media_type: impl Into<String>, content: &[u8]) -> Self {
        Self::new(media_type, Digest::of(content), content.len() as u64)
    }

    /// Add one annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }
}

/// Entry of an index: a child manifest and the platform it targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDescriptor {
    /// Base descriptor.
    #[serde(flatten)]
    pub descriptor: Descriptor,
    /// Platform information.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl ManifestDescriptor {
    /// Attach a platform to a descriptor.
    #[must_use]
    pub const fn new(descriptor: Descriptor, platform: Option<Platform>) -> Self {
        Self {
            descriptor,
            platform,
        }
    }
}

/// Operating system and CPU a manifest was built for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    /// Operating system.
    pub os: String,
    /// Architecture.
    pub architecture: String,
    /// OS version.
    #[serde(rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    /// OS features.
    #[serde(rename = "os.features", default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,
    /// Architecture variant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Create a platform from an OS and architecture.
    #[must_use]
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            os_version: None,
            os_features: Vec::new(),
            variant: None,
        }
    }

    /// `linux/amd64`
    #[must_use]
    pub fn linux_amd64() -> Self {
        Self::new("linux", "amd64")
    }

    /// `linux/arm64`
    #[must_use]
    pub fn linux_arm64() -> Self {
        Self::new("linux", "arm64")
    }
}

/// Pick the child manifest built for `os`/`architecture`.
///
/// Returns the first match in index order.
#[must_use]
pub fn select_platform<'a>(
    index: &'a ImageIndex,
    os: &str,
    architecture: &str,
) -> Option<&'a ManifestDescriptor> {
    index.manifests.iter().find(|child| {
        child
            .platform
            .as_ref()
            .is_some_and(|p| p.os == os && p.architecture == architecture)
    })
}

/// The four manifest kinds the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifestKind {
    /// `application/vnd.oci.image.manifest.v1+json`
    OciManifest,
    /// `application/vnd.oci.image.index.v1+json`
    OciIndex,
    /// `application/vnd.docker.distribution.manifest.v2+json`
    DockerManifest,
    /// `application/vnd.docker.distribution.manifest.list.v2+json`
    DockerList,
}

impl ManifestKind {
    /// Map a media type to a kind, if recognised.
    #[must_use]
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type {
            media_types::MANIFEST => Some(Self::OciManifest),
            media_types::INDEX => Some(Self::OciIndex),
            media_types::DOCKER_MANIFEST => Some(Self::DockerManifest),
            media_types::DOCKER_INDEX => Some(Self::DockerList),
            _ => None,
        }
    }

    /// Like [`ManifestKind::from_media_type`] but failing on unknown types.
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::UnsupportedMediaType`] for anything else.
    pub fn parse(media_type: &str) -> StowageResult<Self> {
        Self::from_media_type(media_type).ok_or_else(|| StowageError::UnsupportedMediaType {
            media_type: media_type.to_string(),
        })
    }

    /// Canonical media type string.
    #[must_use]
    pub const fn media_type(self) -> &'static str {
        match self {
            Self::OciManifest => media_types::MANIFEST,
            Self::OciIndex => media_types::INDEX,
            Self::DockerManifest => media_types::DOCKER_MANIFEST,
            Self::DockerList => media_types::DOCKER_INDEX,
        }
    }

    /// Whether this kind lists other manifests.
    #[must_use]
    pub const fn is_index(self) -> bool {
        matches!(self, Self::OciIndex | Self::DockerList)
    }
}

/// Parsed manifest body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestBody {
    /// Single image (config + layers).
    Image(ImageManifest),
    /// Index / manifest list.
    Index(ImageIndex),
}

/// A manifest together with its recognised kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Kind derived from the media type.
    pub kind: ManifestKind,
    /// Parsed content.
    pub body: ManifestBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaTypeProbe {
    media_type: Option<String>,
    manifests: Option<serde::de::IgnoredAny>,
}

/// Media type of a manifest document when nothing else describes it.
///
/// Uses the declared `mediaType`, otherwise OCI index if the document lists
/// `manifests` and OCI image manifest if not.
///
/// # Errors
///
/// Returns [`StowageError::Serialization`] for malformed JSON.
pub fn sniff_media_type(bytes: &[u8]) -> StowageResult<String> {
    let probe: MediaTypeProbe = serde_json::from_slice(bytes)?;
    Ok(match probe.media_type {
        Some(media_type) => media_type,
        None if probe.manifests.is_some() => media_types::INDEX.to_string(),
        None => media_types::MANIFEST.to_string(),
    })
}

impl Manifest {
    /// Parse manifest bytes.
    ///
    /// The document's own `mediaType` wins; `fallback_media_type` (usually
    /// from the descriptor that pointed here) is used when the field is absent.
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::UnsupportedMediaType`] for unknown kinds and
    /// [`StowageError::Serialization`] for malformed JSON.
    pub fn parse(bytes: &[u8], fallback_media_type: Option<&str>) -> StowageResult<Self> {
        let probe: MediaTypeProbe = serde_json::from_slice(bytes)?;
        let media_type = probe
            .media_type
            .as_deref()
            .or(fallback_media_type)
            .unwrap_or_default();
        let kind = ManifestKind::parse(media_type)?;

        let body = if kind.is_index() {
            ManifestBody::Index(serde_json::from_slice(bytes)?)
        } else {
            ManifestBody::Image(serde_json::from_slice(bytes)?)
        };

        Ok(Self { kind, body })
    }

    /// Media type string for this manifest.
    #[must_use]
    pub const fn media_type(&self) -> &'static str {
        self.kind.media_type()
    }
}

/// Media type strings.
#[allow(missing_docs)]
pub mod media_types {
    pub const MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const EMPTY_JSON: &str = "application/vnd.oci.empty.v1+json";

    /// Schema 1; advertised in `Accept` but refused when pulled.
    pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_INDEX: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

    /// Everything sent in `Accept` when asking a registry for a manifest.
    pub const ACCEPTED_MANIFESTS: [&str; 5] = [
        MANIFEST,
        INDEX,
        DOCKER_MANIFEST,
        DOCKER_INDEX,
        DOCKER_MANIFEST_V1,
    ];
}
