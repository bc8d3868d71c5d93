//! Store backed by a remote OCI distribution registry.
//!
//! One store talks to one repository. Authentication follows the registry's
//! `WWW-Authenticate` challenge: basic credentials are sent up front when
//! configured, and a bearer token is fetched from the challenge realm on the
//! first `401`.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use parking_lot::RwLock;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use stowage_common::{StowageError, StowageResult};
use stowage_oci::{Descriptor, Digest, media_types};
use tracing::{debug, info, instrument, warn};

use crate::credentials::{Credential, CredentialSource};
use crate::reference::ImageReference;
use crate::store::{
    BlobStat, ByteStream, DescriptorTemplate, Flavor, OciStore, PushTarget, file_stream,
    stream_from_bytes,
};

const KIND: &str = "registry";
const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";
const DOCKER_HUB_API: &str = "https://registry-1.docker.io";

/// Capability requested from the registry when authenticating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Read manifests and blobs.
    Pull,
    /// Upload blobs and manifests.
    Push,
}

impl Scope {
    /// Action name used in token scopes.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "push",
        }
    }
}

/// Connection settings for one repository.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Scheme and authority, e.g. `https://ghcr.io`.
    pub base_url: String,
    /// Repository path.
    pub repository: String,
    /// Capabilities requested; fixed for the store's lifetime.
    pub scopes: Vec<Scope>,
    /// Credential sent to the registry and its token service.
    pub credential: Option<Credential>,
    /// `User-Agent` header value.
    pub user_agent: String,
}

impl RegistryConfig {
    /// Pull-only anonymous access to `repository` at `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            repository: repository.into(),
            scopes: vec![Scope::Pull],
            credential: None,
            user_agent: format!("stowage/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Settings for the registry and repository a reference points at.
    ///
    /// Docker Hub is reached through its API host; loopback registries are
    /// spoken to over plain HTTP.
    #[must_use]
    pub fn for_reference(reference: &ImageReference) -> Self {
        Self::new(api_base_url(&reference.registry), reference.repository.clone())
    }

    /// Replace the requested capabilities.
    #[must_use]
    pub fn with_scopes(mut self, scopes: &[Scope]) -> Self {
        self.scopes = scopes.to_vec();
        self
    }

    /// Set or clear the credential.
    #[must_use]
    pub fn with_credential(mut self, credential: Option<Credential>) -> Self {
        self.credential = credential;
        self
    }

    /// Token scope string, e.g. `repository:org/app:pull,push`.
    #[must_use]
    pub fn scope_string(&self) -> String {
        let actions: Vec<&str> = self.scopes.iter().map(|s| s.as_str()).collect();
        format!("repository:{}:{}", self.repository, actions.join(","))
    }
}

/// Base URL of the distribution API for a registry host.
#[must_use]
pub fn api_base_url(host: &str) -> String {
    match host {
        "docker.io" | "index.docker.io" | "registry-1.docker.io" => DOCKER_HUB_API.to_string(),
        h if h == "localhost"
            || h.starts_with("localhost:")
            || h == "127.0.0.1"
            || h.starts_with("127.0.0.1:") =>
        {
            format!("http://{h}")
        }
        h => format!("https://{h}"),
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    // Some registries use access_token
    access_token: Option<String>,
}

/// Remote registry repository as a store.
#[derive(Debug)]
pub struct RegistryStore {
    client: Client,
    config: RegistryConfig,
    token: RwLock<Option<String>>,
}

impl RegistryStore {
    /// Build a store from explicit settings.
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::Configuration`] if the HTTP client cannot be built.
    pub fn new(config: RegistryConfig) -> StowageResult<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| StowageError::Configuration {
                message: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            config,
            token: RwLock::new(None),
        })
    }

    /// Build a store for `reference`, resolving its credential first.
    ///
    /// # Errors
    ///
    /// Returns credential lookup errors, or see [`RegistryStore::new`].
    pub async fn connect(
        reference: &ImageReference,
        scopes: &[Scope],
        credentials: &dyn CredentialSource,
    ) -> StowageResult<Self> {
        let credential = credentials.resolve(&reference.registry).await?;
        info!(
            registry = %reference.registry,
            repository = %reference.repository,
            ?scopes,
            user = credential.as_ref().map_or("anonymous", |c| c.username.as_str()),
            "Creating registry client"
        );

        Self::new(
            RegistryConfig::for_reference(reference)
                .with_scopes(scopes)
                .with_credential(credential),
        )
    }

    /// Connection settings.
    #[must_use]
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn url(&self, kind: &str, reference: &str) -> String {
        format!(
            "{}/v2/{}/{kind}/{reference}",
            self.config.base_url, self.config.repository
        )
    }

    fn object_url(&self, flavor: Flavor, digest: &Digest) -> String {
        match flavor {
            Flavor::Blob => self.url("blobs", digest.as_str()),
            Flavor::Manifest => self.url("manifests", digest.as_str()),
        }
    }

    fn require(&self, scope: Scope, operation: &str) -> StowageResult<()> {
        if self.config.scopes.contains(&scope) {
            Ok(())
        } else {
            Err(StowageError::Configuration {
                message: format!(
                    "{operation} needs {} access, but the store for {} was created without it",
                    scope.as_str(),
                    self.config.repository
                ),
            })
        }
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let token = self.token.read().clone();
        match (token, &self.config.credential) {
            (Some(token), _) => builder.bearer_auth(token),
            (None, Some(credential)) => {
                builder.basic_auth(&credential.username, Some(&credential.secret))
            }
            (None, None) => builder,
        }
    }

    /// Send a replayable request, authenticating once on `401`.
    async fn send<F>(&self, what: &str, build: F) -> StowageResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let response = self
            .authorize(build(&self.client))
            .send()
            .await
            .map_err(|e| network(what, &e))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = header(&response, WWW_AUTHENTICATE.as_str())
            .map(str::to_string)
            .ok_or_else(|| StowageError::RegistryProtocol {
                status: Some(StatusCode::UNAUTHORIZED.as_u16()),
                message: format!("{what}: unauthorized without an authentication challenge"),
            })?;
        self.authenticate(&challenge).await?;

        let retry = self
            .authorize(build(&self.client))
            .send()
            .await
            .map_err(|e| network(what, &e))?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            return Err(StowageError::Credential {
                message: format!("{what}: still unauthorized after authenticating"),
            });
        }
        Ok(retry)
    }

    async fn authenticate(&self, challenge: &str) -> StowageResult<()> {
        let (scheme, params) = parse_challenge(challenge);
        debug!(%scheme, "Authenticating");

        if scheme.eq_ignore_ascii_case("basic") {
            let message = if self.config.credential.is_some() {
                format!("{} rejected the configured credential", self.config.base_url)
            } else {
                format!("{} requires credentials", self.config.base_url)
            };
            return Err(StowageError::Credential { message });
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(StowageError::RegistryProtocol {
                status: Some(StatusCode::UNAUTHORIZED.as_u16()),
                message: format!("Unsupported authentication scheme {scheme}"),
            });
        }

        let realm = params
            .get("realm")
            .ok_or_else(|| StowageError::RegistryProtocol {
                status: Some(StatusCode::UNAUTHORIZED.as_u16()),
                message: "Missing realm in WWW-Authenticate".to_string(),
            })?;

        let scope = self.config.scope_string();
        let mut request = self
            .client
            .get(realm.as_str())
            .query(&[("scope", scope.as_str())]);
        if let Some(service) = params.get("service") {
            request = request.query(&[("service", service.as_str())]);
        }
        if let Some(credential) = &self.config.credential {
            request = request.basic_auth(&credential.username, Some(&credential.secret));
        }

        debug!(%realm, %scope, "Requesting token");
        let response = request
            .send()
            .await
            .map_err(|e| network("token request", &e))?;
        if !response.status().is_success() {
            return Err(StowageError::Credential {
                message: format!("Token request to {realm} failed with {}", response.status()),
            });
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| StowageError::RegistryProtocol {
                status: None,
                message: format!("Failed to parse token response: {e}"),
            })?;
        let token = body
            .token
            .or(body.access_token)
            .ok_or_else(|| StowageError::RegistryProtocol {
                status: None,
                message: "No token in response".to_string(),
            })?;

        *self.token.write() = Some(token);
        Ok(())
    }

    async fn fetch(&self, flavor: Flavor, digest: &Digest) -> StowageResult<Response> {
        let url = self.object_url(flavor, digest);
        let response = self
            .send("fetch", |client| {
                let request = client.get(&url);
                match flavor {
                    Flavor::Manifest => request.header(ACCEPT, accepted_manifests()),
                    Flavor::Blob => request,
                }
            })
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(StowageError::not_found(KIND, format!("{flavor} {digest}")));
        }
        expect_success(response, "fetch").await
    }
}

#[async_trait]
impl OciStore for RegistryStore {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn put_from_bytes(
        &self,
        flavor: Flavor,
        template: DescriptorTemplate,
        data: Bytes,
    ) -> StowageResult<Descriptor> {
        let descriptor = template.complete(&data)?;
        match flavor {
            Flavor::Blob => {
                if !self.has_blob(&descriptor.digest).await? {
                    self.upload_blob(&descriptor, stream_from_bytes(data)).await?;
                }
            }
            Flavor::Manifest => {
                let stored = self
                    .put_manifest(descriptor.digest.as_str(), &descriptor.media_type, data)
                    .await?;
                if stored != descriptor.digest {
                    return Err(StowageError::RegistryDigestMismatch {
                        expected: descriptor.digest.to_string(),
                        actual: stored.to_string(),
                    });
                }
            }
        }
        Ok(descriptor)
    }

    async fn put_from_stream(
        &self,
        flavor: Flavor,
        descriptor: &Descriptor,
        stream: ByteStream,
    ) -> StowageResult<Descriptor> {
        if flavor == Flavor::Manifest {
            return Err(StowageError::unsupported(KIND, "put_from_stream for manifests"));
        }
        if !self.has_blob(&descriptor.digest).await? {
            self.upload_blob(descriptor, stream).await?;
        }
        Ok(descriptor.clone())
    }

    async fn put_from_file(
        &self,
        flavor: Flavor,
        descriptor: &Descriptor,
        path: &Path,
    ) -> StowageResult<Descriptor> {
        if flavor == Flavor::Manifest {
            return Err(StowageError::unsupported(KIND, "put_from_file for manifests"));
        }
        let stream = file_stream(path).await?;
        self.put_from_stream(flavor, descriptor, stream).await
    }

    async fn stat(&self, flavor: Flavor, digest: &Digest) -> StowageResult<Option<BlobStat>> {
        let url = self.object_url(flavor, digest);
        let response = self
            .send("stat", |client| {
                let request = client.head(&url);
                match flavor {
                    Flavor::Manifest => request.header(ACCEPT, accepted_manifests()),
                    Flavor::Blob => request,
                }
            })
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = expect_success(response, "stat").await?;
        let size = header(&response, CONTENT_LENGTH.as_str())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| StowageError::RegistryProtocol {
                status: Some(response.status().as_u16()),
                message: format!("No content length reported for {flavor} {digest}"),
            })?;
        Ok(Some(BlobStat { size }))
    }

    #[instrument(skip(self), fields(repository = %self.config.repository))]
    async fn describe_manifest(&self, reference: &str) -> StowageResult<Descriptor> {
        let url = self.url("manifests", reference);
        let response = self
            .send("describe manifest", |client| {
                client.head(&url).header(ACCEPT, accepted_manifests())
            })
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(StowageError::not_found(
                KIND,
                format!("manifest {}:{reference}", self.config.repository),
            ));
        }
        let response = expect_success(response, "describe manifest").await?;

        let media_type = header(&response, CONTENT_TYPE.as_str())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
        let size = header(&response, CONTENT_LENGTH.as_str()).and_then(|v| v.parse::<u64>().ok());
        let digest = header(&response, DOCKER_CONTENT_DIGEST);

        let (Some(media_type), Some(size), Some(digest)) = (media_type, size, digest) else {
            return Err(StowageError::RegistryProtocol {
                status: Some(response.status().as_u16()),
                message: format!("Registry didn't give type/length/digest headers for {reference}"),
            });
        };

        Ok(Descriptor::new(media_type, Digest::parse(digest)?, size))
    }

    async fn get_full(&self, flavor: Flavor, digest: &Digest) -> StowageResult<Bytes> {
        self.fetch(flavor, digest)
            .await?
            .bytes()
            .await
            .map_err(|e| network("read body", &e))
    }

    async fn get_stream(&self, flavor: Flavor, digest: &Digest) -> StowageResult<ByteStream> {
        let response = self.fetch(flavor, digest).await?;
        Ok(response
            .bytes_stream()
            .map_err(|e| network("read body", &e))
            .boxed())
    }
}

#[async_trait]
impl PushTarget for RegistryStore {
    async fn has_blob(&self, digest: &Digest) -> StowageResult<bool> {
        Ok(self.stat(Flavor::Blob, digest).await?.is_some())
    }

    #[instrument(
        skip(self, descriptor, stream),
        fields(digest = %descriptor.digest, size = descriptor.size)
    )]
    async fn upload_blob(&self, descriptor: &Descriptor, stream: ByteStream) -> StowageResult<()> {
        self.require(Scope::Push, "upload_blob")?;

        let start = format!(
            "{}/v2/{}/blobs/uploads/",
            self.config.base_url, self.config.repository
        );
        let response = self
            .send("start upload", |client| client.post(&start).header(CONTENT_LENGTH, 0))
            .await?;
        let response = expect_success(response, "start upload").await?;

        let location = header(&response, LOCATION.as_str()).ok_or_else(|| {
            StowageError::RegistryProtocol {
                status: Some(response.status().as_u16()),
                message: "Upload session has no Location".to_string(),
            }
        })?;
        let mut url = Url::parse(&self.config.base_url)
            .and_then(|base| base.join(location))
            .map_err(|e| StowageError::RegistryProtocol {
                status: None,
                message: format!("Bad upload location {location}: {e}"),
            })?;
        url.query_pairs_mut()
            .append_pair("digest", descriptor.digest.as_str());

        // The body is a one-shot stream, so this request cannot be replayed.
        let response = self
            .authorize(
                self.client
                    .put(url)
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .header(CONTENT_LENGTH, descriptor.size)
                    .body(Body::wrap_stream(stream)),
            )
            .send()
            .await
            .map_err(|e| network("upload blob", &e))?;
        expect_success(response, "upload blob").await?;

        debug!("Uploaded blob");
        Ok(())
    }

    async fn put_manifest(
        &self,
        reference: &str,
        media_type: &str,
        body: Bytes,
    ) -> StowageResult<Digest> {
        self.require(Scope::Push, "put_manifest")?;

        let url = self.url("manifests", reference);
        let response = self
            .send("put manifest", |client| {
                client
                    .put(&url)
                    .header(CONTENT_TYPE, media_type)
                    .body(body.clone())
            })
            .await?;
        let response = expect_success(response, "put manifest").await?;

        match header(&response, DOCKER_CONTENT_DIGEST) {
            Some(digest) => Digest::parse(digest),
            None => {
                let computed = Digest::of(&body);
                warn!(
                    reference,
                    %computed,
                    "Registry returned no Docker-Content-Digest, using local digest"
                );
                Ok(computed)
            }
        }
    }
}

fn accepted_manifests() -> String {
    media_types::ACCEPTED_MANIFESTS.join(", ")
}

fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

fn network(what: &str, error: &reqwest::Error) -> StowageError {
    StowageError::Network {
        message: format!("{what}: {error}"),
    }
}

async fn expect_success(response: Response, what: &str) -> StowageResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let mut body = response.text().await.unwrap_or_default();
    body.truncate(512);
    Err(StowageError::RegistryProtocol {
        status: Some(status.as_u16()),
        message: format!("{what} failed: {body}"),
    })
}

/// Split a `WWW-Authenticate` value into its scheme and parameters.
///
/// Quoted values may contain commas (`scope="repository:a:pull,push"`).
fn parse_challenge(challenge: &str) -> (String, HashMap<String, String>) {
    let challenge = challenge.trim();
    let (scheme, mut rest) = challenge.split_once(' ').unwrap_or((challenge, ""));

    let mut params = HashMap::new();
    while let Some((key, after)) = rest.split_once('=') {
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let after = after.trim_start();
        let (value, remainder) = if let Some(quoted) = after.strip_prefix('"') {
            quoted
                .split_once('"')
                .unwrap_or((quoted, ""))
        } else {
            after.split_at(after.find(',').unwrap_or(after.len()))
        };
        params.insert(key, value.to_string());
        rest = remainder.trim_start().trim_start_matches(',');
    }

    (scheme.to_string(), params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_parsing_keeps_quoted_commas() {
        let (scheme, params) = parse_challenge(concat!(
            r#"Bearer realm="https://auth.example.com/token","#,
            r#"service="registry.example.com",scope="repository:a/b:pull,push""#,
        ));
        assert_eq!(scheme, "Bearer");
        assert_eq!(params["realm"], "https://auth.example.com/token");
        assert_eq!(params["service"], "registry.example.com");
        assert_eq!(params["scope"], "repository:a/b:pull,push");
    }

    #[test]
    fn challenge_parsing_handles_bare_values() {
        let (scheme, params) = parse_challenge("Basic realm=registry, charset=UTF-8");
        assert_eq!(scheme, "Basic");
        assert_eq!(params["realm"], "registry");
        assert_eq!(params["charset"], "UTF-8");
    }

    #[test]
    fn api_hosts() {
        assert_eq!(api_base_url("docker.io"), "https://registry-1.docker.io");
        assert_eq!(api_base_url("localhost:5000"), "http://localhost:5000");
        assert_eq!(api_base_url("127.0.0.1"), "http://127.0.0.1");
        assert_eq!(api_base_url("ghcr.io"), "https://ghcr.io");
    }

    #[test]
    fn config_from_reference() {
        let reference = ImageReference::parse("alpine:3.20").unwrap();
        let config = RegistryConfig::for_reference(&reference)
            .with_scopes(&[Scope::Pull, Scope::Push]);
        assert_eq!(config.base_url, "https://registry-1.docker.io");
        assert_eq!(config.repository, "library/alpine");
        assert_eq!(config.scope_string(), "repository:library/alpine:pull,push");
    }
}
