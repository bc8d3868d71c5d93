//! Artifact reference parsing.

use std::fmt;
use std::str::FromStr;

use stowage_common::{StowageError, StowageResult};
use stowage_oci::Digest;

/// A parsed `registry/repository[:tag][@digest]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, with port if one was given.
    pub registry: String,
    /// Repository path within the registry.
    pub repository: String,
    /// Tag, if any.
    pub tag: Option<String>,
    /// Digest, if any.
    pub digest: Option<Digest>,
}

impl ImageReference {
    /// Registry assumed when none is given.
    pub const DEFAULT_REGISTRY: &'static str = "docker.io";
    /// Tag assumed when neither tag nor digest is given.
    pub const DEFAULT_TAG: &'static str = "latest";

    /// Parse a reference string.
    ///
    /// Examples:
    /// - `alpine` -> docker.io/library/alpine:latest
    /// - `localhost:5000/app@sha256:...` -> localhost:5000/app, digest only
    /// - `ghcr.io/org/app:v1.0` -> ghcr.io/org/app:v1.0
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::InvalidReference`] for empty names, empty path
    /// components or malformed digests.
    pub fn parse(reference: &str) -> StowageResult<Self> {
        let input = reference.trim();
        let invalid = |reason: &str| StowageError::InvalidReference {
            reference: input.to_string(),
            reason: reason.to_string(),
        };

        let (name, digest) = match input.split_once('@') {
            Some((name, digest)) => {
                let digest = Digest::parse(digest).map_err(|_| invalid("malformed digest"))?;
                (name, Some(digest))
            }
            None => (input, None),
        };

        // A colon after the last slash separates the tag; earlier ones are ports.
        let last_slash = name.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(idx) => {
                let idx = last_slash + idx;
                (&name[..idx], Some(name[idx + 1..].to_string()))
            }
            None => (name, None),
        };
        if tag.as_deref() == Some("") {
            return Err(invalid("empty tag"));
        }

        let (registry, repository) = match name.split_once('/') {
            Some((host, rest))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host.to_string(), rest.to_string())
            }
            Some(_) => (Self::DEFAULT_REGISTRY.to_string(), name.to_string()),
            None => (
                Self::DEFAULT_REGISTRY.to_string(),
                format!("library/{name}"),
            ),
        };

        if repository.split('/').any(str::is_empty) || name.is_empty() {
            return Err(invalid("empty repository component"));
        }
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(invalid("repository must be lowercase"));
        }

        let tag = match (&tag, &digest) {
            (None, None) => Some(Self::DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// `registry/repository`, without tag or digest.
    #[must_use]
    pub fn canonical_name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// What to ask the registry for: the tag when present, else the digest.
    #[must_use]
    pub fn target(&self) -> &str {
        match (&self.tag, &self.digest) {
            (Some(tag), _) => tag,
            (None, Some(digest)) => digest.as_str(),
            (None, None) => Self::DEFAULT_TAG,
        }
    }

    /// Same repository under a different tag, with any digest dropped.
    #[must_use]
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag.into()),
            digest: None,
        }
    }

    /// Same repository pinned to `digest`, with any tag dropped.
    #[must_use]
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest),
        }
    }

    /// Full reference string.
    #[must_use]
    pub fn full_reference(&self) -> String {
        let mut out = self.canonical_name();
        if let Some(tag) = &self.tag {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(digest.as_str());
        }
        out
    }
}

impl FromStr for ImageReference {
    type Err = StowageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_reference())
    }
}
