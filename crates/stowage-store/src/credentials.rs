//! Registry credentials from the Docker client configuration.
//!
//! Lookup order for a host: its `credHelpers` entry, then the global
//! `credsStore`, then an inline `auths` entry. Helpers are external
//! `docker-credential-<name>` programs speaking the Docker credential
//! helper protocol.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::Deserialize;
use stowage_common::{StowageError, StowageResult};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Host name Docker tools use for Docker Hub credentials.
pub const DOCKER_HUB_INDEX: &str = "index.docker.io";

/// Registry credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Registry host the credential belongs to.
    pub registry: String,
    /// Username.
    pub username: String,
    /// Password or token.
    pub secret: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("registry", &self.registry)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl Credential {
    /// Create a new credential.
    #[must_use]
    pub fn new(registry: &str, username: &str, secret: &str) -> Self {
        Self {
            registry: registry.to_string(),
            username: username.to_string(),
            secret: secret.to_string(),
        }
    }

    /// Encode as a base64 `user:secret` auth string (Docker format).
    #[must_use]
    pub fn to_docker_auth(&self) -> String {
        BASE64.encode(format!("{}:{}", self.username, self.secret))
    }

    /// Decode from a base64 `user:secret` auth string (Docker format).
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::Credential`] for invalid base64, non UTF-8
    /// content or a missing `:` separator.
    pub fn from_docker_auth(registry: &str, auth: &str) -> StowageResult<Self> {
        let decoded = BASE64.decode(auth).map_err(|e| StowageError::Credential {
            message: format!("Invalid base64 auth for {registry}: {e}"),
        })?;

        let auth_str = String::from_utf8(decoded).map_err(|e| StowageError::Credential {
            message: format!("Invalid auth string for {registry}: {e}"),
        })?;

        let (username, secret) = auth_str
            .split_once(':')
            .ok_or_else(|| StowageError::Credential {
                message: format!("Auth entry for {registry} is not in user:secret form"),
            })?;

        Ok(Self::new(registry, username, secret))
    }
}

/// Anything that can produce a credential for a registry host.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Look up the credential for `registry` (a host, optionally with port).
    async fn resolve(&self, registry: &str) -> StowageResult<Option<Credential>>;
}

/// Anonymous access everywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

#[async_trait]
impl CredentialSource for Anonymous {
    async fn resolve(&self, _registry: &str) -> StowageResult<Option<Credential>> {
        Ok(None)
    }
}

/// Fixed credentials keyed by registry host.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    entries: HashMap<String, Credential>,
}

impl StaticCredentials {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the credential for its registry.
    pub fn insert(&mut self, credential: Credential) {
        self.entries
            .insert(index_name(&credential.registry), credential);
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn resolve(&self, registry: &str) -> StowageResult<Option<Credential>> {
        Ok(self.entries.get(&index_name(registry)).cloned())
    }
}

/// Docker `config.json`, limited to the credential fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerConfig {
    /// Inline authentication entries keyed by server.
    #[serde(default)]
    pub auths: HashMap<String, DockerAuthEntry>,
    /// Default credential helper.
    #[serde(default, rename = "credsStore")]
    pub creds_store: Option<String>,
    /// Per-host credential helpers.
    #[serde(default, rename = "credHelpers")]
    pub cred_helpers: HashMap<String, String>,
}

/// Docker auth entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerAuthEntry {
    /// Base64-encoded `user:secret`.
    #[serde(default)]
    pub auth: Option<String>,
    /// Username.
    #[serde(default)]
    pub username: Option<String>,
    /// Password.
    #[serde(default)]
    pub password: Option<String>,
}

impl DockerConfig {
    /// `$DOCKER_CONFIG/config.json`, else `~/.docker/config.json`.
    #[must_use]
    pub fn default_path() -> PathBuf {
        std::env::var_os("DOCKER_CONFIG").map_or_else(
            || {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".docker")
                    .join("config.json")
            },
            |dir| PathBuf::from(dir).join("config.json"),
        )
    }

    /// Parse config JSON.
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::Configuration`] for malformed JSON.
    pub fn parse(content: &str) -> StowageResult<Self> {
        serde_json::from_str(content).map_err(|e| StowageError::Configuration {
            message: format!("Failed to parse Docker config: {e}"),
        })
    }

    /// Load from `path`; a missing file yields an empty config.
    ///
    /// # Errors
    ///
    /// Returns an I/O error for unreadable files, or a configuration error
    /// for malformed ones.
    pub async fn load(path: &Path) -> StowageResult<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No Docker config, using anonymous access");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn inline_credential(&self, host: &str) -> StowageResult<Option<Credential>> {
        for (server, entry) in &self.auths {
            if index_name(server_host(server)) != host {
                continue;
            }
            if let Some(auth) = &entry.auth {
                return Credential::from_docker_auth(host, auth).map(Some);
            }
            if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
                return Ok(Some(Credential::new(host, username, password)));
            }
        }
        Ok(None)
    }
}

/// Credentials resolved through a Docker client configuration.
#[derive(Debug, Clone, Default)]
pub struct DockerCredentials {
    config: DockerConfig,
}

impl DockerCredentials {
    /// Wrap an already loaded config.
    #[must_use]
    pub const fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    /// Load the config from [`DockerConfig::default_path`].
    ///
    /// # Errors
    ///
    /// See [`DockerConfig::load`].
    pub async fn load_default() -> StowageResult<Self> {
        Ok(Self::new(DockerConfig::load(&DockerConfig::default_path()).await?))
    }
}

#[async_trait]
impl CredentialSource for DockerCredentials {
    async fn resolve(&self, registry: &str) -> StowageResult<Option<Credential>> {
        let host = index_name(registry);

        if let Some(helper) = self.config.cred_helpers.get(&host) {
            return CredentialHelper::new(helper).get(&host).await;
        }
        if let Some(store) = &self.config.creds_store {
            return CredentialHelper::new(store).get(&host).await;
        }

        self.config.inline_credential(&host)
    }
}

/// An external `docker-credential-<name>` program.
#[derive(Debug, Clone)]
pub struct CredentialHelper {
    program: PathBuf,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HelperResponse {
    username: String,
    secret: String,
}

impl CredentialHelper {
    /// Helper `docker-credential-<name>` found on `PATH`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            program: PathBuf::from(format!("docker-credential-{name}")),
        }
    }

    /// Helper at an explicit path.
    #[must_use]
    pub fn at(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Run `<helper> get` with `server` on stdin.
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::Credential`] if the helper cannot be run,
    /// fails, or prints something other than a credential.
    pub async fn get(&self, server: &str) -> StowageResult<Option<Credential>> {
        let helper_error = |message: String| StowageError::Credential {
            message: format!("{}: {message}", self.program.display()),
        };

        tracing::debug!(helper = %self.program.display(), server, "Querying credential helper");

        let mut child = Command::new(&self.program)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| helper_error(format!("failed to start: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(server.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if stdout.contains("credentials not found") {
            return Ok(None);
        }
        if !output.status.success() {
            return Err(helper_error(format!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let response: HelperResponse = serde_json::from_str(stdout.trim())
            .map_err(|e| helper_error(format!("unexpected output: {e}")))?;
        if response.username.is_empty() || response.secret.is_empty() {
            return Err(helper_error("returned an empty credential".to_string()));
        }

        Ok(Some(Credential::new(
            server,
            &response.username,
            &response.secret,
        )))
    }
}

/// Map Docker Hub aliases to the name Docker tools store credentials under.
#[must_use]
pub fn index_name(registry: &str) -> String {
    match registry {
        "docker.io" | "registry-1.docker.io" | "registry.hub.docker.com" | "index.docker.io" => {
            DOCKER_HUB_INDEX.to_string()
        }
        other => other.to_string(),
    }
}

/// Host (and port) of an `auths` key, which may be a bare host or a URL.
fn server_host(server: &str) -> &str {
    let rest = server.split_once("://").map_or(server, |(_, rest)| rest);
    rest.split('/').next().unwrap_or(rest)
}
