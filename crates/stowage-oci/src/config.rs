//! Image configuration documents and a history-recording editor.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stowage_common::StowageResult;

use crate::digest::Digest;
use crate::image::{Descriptor, media_types};
use crate::json::to_canonical_json;

/// OCI image configuration (`application/vnd.oci.image.config.v1+json`).
///
/// Fields this type does not model (`container_config`, `docker_version`,
/// ...) are kept in `other` and written back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// When the image was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    /// Image author.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// CPU architecture, e.g. `amd64`.
    pub architecture: String,
    /// Operating system, e.g. `linux`.
    pub os: String,
    /// Defaults for containers started from the image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ExecutionConfig>,
    /// Layer diff IDs.
    pub rootfs: RootFs,
    /// Build steps, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
    /// Unmodelled top-level fields.
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Container defaults, in Docker's `PascalCase` field naming.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutionConfig {
    /// User (and optionally group) to run as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// `KEY=value` pairs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Entrypoint argv.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    /// Default arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    /// Initial working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Image labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// `ExposedPorts`, `Volumes`, `StopSignal` and anything else.
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// The `rootfs` section: uncompressed layer digests, bottom first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    /// Always `layers`.
    #[serde(rename = "type")]
    pub fs_type: String,
    /// Digests of the uncompressed layer tarballs.
    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// One step of the image's build history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    /// When the step ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    /// The instruction that produced this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Step author.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Free-form note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Set when the step changed metadata only and added no layer.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

impl ImageConfig {
    /// Empty config for `os`/`architecture`.
    #[must_use]
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            created: None,
            author: None,
            architecture: architecture.into(),
            os: os.into(),
            config: None,
            rootfs: RootFs::default(),
            history: Vec::new(),
            other: Map::new(),
        }
    }

    /// Parse a config blob.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if `bytes` is not a valid config.
    pub fn parse(bytes: &[u8]) -> StowageResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Derives a new image config from a base one.
///
/// Every edit appends a history entry stamped with the writer's creation
/// time and comment.
#[derive(Debug, Clone)]
pub struct ImageConfigWriter {
    config: ImageConfig,
    created: DateTime<Utc>,
    comment: String,
}

impl ImageConfigWriter {
    /// Start from `base`, stamping the result with the current time.
    #[must_use]
    pub fn new(base: ImageConfig, comment: impl Into<String>) -> Self {
        Self::at(base, comment, Utc::now())
    }

    /// Start from `base`, stamping the result with `created`.
    #[must_use]
    pub fn at(mut base: ImageConfig, comment: impl Into<String>, created: DateTime<Utc>) -> Self {
        base.created = Some(created);
        Self {
            config: base,
            created,
            comment: comment.into(),
        }
    }

    /// Timestamp applied to the config and to every new history entry.
    #[must_use]
    pub const fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// The config as edited so far.
    #[must_use]
    pub const fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// Consume the writer.
    #[must_use]
    pub fn into_config(self) -> ImageConfig {
        self.config
    }

    /// Value of environment variable `key`, if set.
    #[must_use]
    pub fn get_env(&self, key: &str) -> Option<&str> {
        let prefix = format!("{key}=");
        self.config
            .config
            .as_ref()?
            .env
            .iter()
            .find_map(|entry| entry.strip_prefix(&prefix))
    }

    /// Set `key` to `value`, replacing any earlier value.
    pub fn set_env(&mut self, key: &str, value: &str) -> &mut Self {
        let prefix = format!("{key}=");
        let entry = format!("{key}={value}");
        let env = &mut self.execution().env;
        env.retain(|existing| !existing.starts_with(&prefix));
        env.push(entry.clone());
        self.record_empty_layer(format!("ENV {entry}"))
    }

    /// Replace the entrypoint.
    pub fn set_entrypoint(&mut self, args: Vec<String>) -> &mut Self {
        let created_by = format!("ENTRYPOINT [{}]", quote_args(&args));
        self.execution().entrypoint = Some(args);
        self.record_empty_layer(created_by)
    }

    /// Replace the default command.
    pub fn set_command(&mut self, args: Vec<String>) -> &mut Self {
        let created_by = format!("CMD [{}]", quote_args(&args));
        self.execution().cmd = Some(args);
        self.record_empty_layer(created_by)
    }

    /// Record a metadata-only step.
    pub fn record_empty_layer(&mut self, created_by: impl Into<String>) -> &mut Self {
        self.push_history(created_by.into(), true);
        self
    }

    /// Record a step that added a layer whose uncompressed digest is `diff_id`.
    pub fn record_diff_layer(&mut self, command: impl Into<String>, diff_id: Digest) -> &mut Self {
        self.push_history(command.into(), false);
        self.config.rootfs.diff_ids.push(diff_id);
        self
    }

    /// Encode the config canonically and describe it.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the config cannot be encoded.
    pub fn build(&self) -> StowageResult<(Descriptor, Bytes)> {
        let bytes = Bytes::from(to_canonical_json(&self.config)?);
        let descriptor = Descriptor::for_content(media_types::CONFIG, &bytes);
        Ok((descriptor, bytes))
    }

    fn execution(&mut self) -> &mut ExecutionConfig {
        self.config.config.get_or_insert_with(ExecutionConfig::default)
    }

    fn push_history(&mut self, created_by: String, empty_layer: bool) {
        self.config.history.push(History {
            created: Some(self.created),
            created_by: Some(created_by),
            author: None,
            comment: Some(self.comment.clone()),
            empty_layer,
        });
    }
}

fn quote_args(args: &[String]) -> String {
    args.iter()
        .map(|arg| Value::String(arg.clone()).to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    const BASE: &str = r#"{
        "architecture": "amd64",
        "os": "linux",
        "created": "2024-01-01T00:00:00Z",
        "docker_version": "24.0.7",
        "config": {
            "Env": ["PATH=/usr/bin", "HOME=/root"],
            "Cmd": ["/bin/sh"],
            "ExposedPorts": {"80/tcp": {}}
        },
        "rootfs": {
            "type": "layers",
            "diff_ids": ["sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"]
        },
        "history": [{"created": "2024-01-01T00:00:00Z", "created_by": "ADD rootfs /"}]
    }"#;

    fn writer() -> ImageConfigWriter {
        let base = ImageConfig::parse(BASE.as_bytes()).unwrap();
        let when = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        ImageConfigWriter::at(base, "stowage", when)
    }

    #[test]
    fn env_is_replaced_not_duplicated() {
        let mut writer = writer();
        assert_eq!(writer.get_env("PATH"), Some("/usr/bin"));
        assert_eq!(writer.get_env("PAT"), None);

        writer.set_env("PATH", "/opt/bin:/usr/bin");
        let env = &writer.config().config.as_ref().unwrap().env;
        assert_eq!(env, &["HOME=/root", "PATH=/opt/bin:/usr/bin"]);
        assert_eq!(writer.get_env("PATH"), Some("/opt/bin:/usr/bin"));

        let last = writer.config().history.last().unwrap();
        assert_eq!(last.created_by.as_deref(), Some("ENV PATH=/opt/bin:/usr/bin"));
        assert!(last.empty_layer);
        assert_eq!(last.comment.as_deref(), Some("stowage"));
        assert_eq!(last.created, Some(writer.created()));
    }

    #[test]
    fn entrypoint_and_command_are_quoted_in_history() {
        let mut writer = writer();
        writer
            .set_entrypoint(vec!["/bin/app".into(), "--flag".into()])
            .set_command(vec![r#"say "hi""#.into()]);

        let execution = writer.config().config.clone().unwrap();
        assert_eq!(execution.entrypoint.unwrap(), ["/bin/app", "--flag"]);
        assert_eq!(execution.cmd.unwrap(), [r#"say "hi""#]);

        let steps: Vec<_> = writer
            .config()
            .history
            .iter()
            .filter_map(|h| h.created_by.as_deref())
            .collect();
        assert_eq!(
            steps,
            [
                "ADD rootfs /",
                r#"ENTRYPOINT ["/bin/app" "--flag"]"#,
                r#"CMD ["say \"hi\""]"#,
            ]
        );
    }

    #[test]
    fn diff_layers_extend_rootfs() {
        let mut writer = writer();
        let diff = Digest::of(b"layer tar");
        writer.record_diff_layer("COPY app /app", diff.clone());

        let config = writer.config();
        assert_eq!(config.rootfs.diff_ids.len(), 2);
        assert_eq!(config.rootfs.diff_ids[1], diff);
        let last = config.history.last().unwrap();
        assert!(!last.empty_layer);
        assert_eq!(last.created_by.as_deref(), Some("COPY app /app"));
    }

    #[test]
    fn writer_starts_a_config_when_base_has_none() {
        let mut writer = ImageConfigWriter::new(ImageConfig::new("linux", "arm64"), "init");
        assert_eq!(writer.get_env("HOME"), None);
        writer.set_env("HOME", "/home/app");
        assert_eq!(writer.get_env("HOME"), Some("/home/app"));
        assert_eq!(writer.config().history.len(), 1);
    }

    #[test]
    fn build_keeps_unknown_fields_and_is_stable() {
        let mut writer = writer();
        writer.set_env("MODE", "prod");
        let (descriptor, bytes) = writer.build().unwrap();
        assert_eq!(descriptor.media_type, media_types::CONFIG);
        descriptor.digest.verify(&bytes).unwrap();
        assert_eq!(writer.build().unwrap().1, bytes);

        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["docker_version"], "24.0.7");
        assert_eq!(json["config"]["ExposedPorts"]["80/tcp"], serde_json::json!({}));
        assert_eq!(json["created"], "2025-06-01T12:00:00Z");
        assert!(json["history"][0].get("empty_layer").is_none());
        assert_eq!(json["history"][1]["empty_layer"], true);

        let reparsed = ImageConfig::parse(&bytes).unwrap();
        assert_eq!(&reparsed, writer.config());
    }
}
