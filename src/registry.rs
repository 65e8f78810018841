// Deployment registry manifest inspection.
//
// Status probes for the registry-push build modes ask one question: does a
// manifest exist for `repository:tag`? A 404 ("MANIFEST_UNKNOWN") answers
// "not built yet"; everything else unexpected is surfaced to the caller
// rather than swallowed as not-ready.

use crate::config::RegistryConfig;
use crate::error::{BuildError, Result};
use crate::identity::ImageIdentity;
use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tracing::debug;

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

pub struct RegistryClient {
    http: Client,
    timeout: Duration,
}

impl RegistryClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BuildError::Configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, timeout })
    }

    /// Whether a manifest exists for the identity's repository and tag.
    pub async fn manifest_exists(
        &self,
        registry: &RegistryConfig,
        identity: &ImageIdentity,
    ) -> Result<bool> {
        Ok(self.get_manifest(registry, identity).await?.is_some())
    }

    /// Content digest of the manifest, if it exists.
    pub async fn manifest_digest(
        &self,
        registry: &RegistryConfig,
        identity: &ImageIdentity,
    ) -> Result<Option<String>> {
        let response = match self.get_manifest(registry, identity).await? {
            Some(response) => response,
            None => return Ok(None),
        };
        let digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(digest)
    }

    /// Fetch the manifest, following one bearer-token challenge if the
    /// registry issues one. `None` means the manifest (or repository) does
    /// not exist.
    async fn get_manifest(
        &self,
        registry: &RegistryConfig,
        identity: &ImageIdentity,
    ) -> Result<Option<Response>> {
        let url = manifest_url(registry, identity);
        debug!("Checking registry manifest at {}", url);

        let mut response = self.send(registry, &url, None).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_bearer_challenge);
            if let Some(challenge) = challenge {
                let token = self.fetch_token(registry, identity, &challenge).await?;
                response = self.send(registry, &url, Some(&token)).await?;
            }
        }

        match response.status() {
            status if status.is_success() => Ok(Some(response)),
            StatusCode::NOT_FOUND => {
                debug!("No manifest for {}:{}", identity.remote_repository(), identity.tag);
                Ok(None)
            }
            status => Err(BuildError::Registry {
                host: registry.authority(),
                status: status.as_u16(),
                reference: identity.deployed_ref(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn send(
        &self,
        registry: &RegistryConfig,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<Response> {
        let mut request = self
            .http
            .get(url)
            .header(ACCEPT, HeaderValue::from_static(MANIFEST_ACCEPT));
        if let Some(token) = bearer {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                BuildError::Timeout {
                    operation: format!("registry request to {}", registry.authority()),
                    seconds: self.timeout.as_secs(),
                }
            } else {
                BuildError::RegistryUnreachable {
                    host: registry.authority(),
                    message: e.to_string(),
                }
            }
        })
    }

    /// Anonymous token fetch against the realm named in a bearer challenge.
    async fn fetch_token(
        &self,
        registry: &RegistryConfig,
        identity: &ImageIdentity,
        challenge: &BearerChallenge,
    ) -> Result<String> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", identity.remote_repository()));
        query.push(("scope", scope));

        let response = self
            .http
            .get(&challenge.realm)
            .query(&query)
            .send()
            .await
            .map_err(|e| BuildError::RegistryUnreachable {
                host: registry.authority(),
                message: format!("token endpoint: {}", e),
            })?;

        if !response.status().is_success() {
            return Err(BuildError::Registry {
                host: registry.authority(),
                status: response.status().as_u16(),
                reference: identity.deployed_ref(),
                message: "token endpoint rejected anonymous token request".to_string(),
            });
        }

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            #[serde(default)]
            token: Option<String>,
            #[serde(default)]
            access_token: Option<String>,
        }

        let body: TokenResponse =
            response
                .json()
                .await
                .map_err(|e| BuildError::RegistryUnreachable {
                    host: registry.authority(),
                    message: format!("invalid token response: {}", e),
                })?;

        body.token
            .or(body.access_token)
            .ok_or_else(|| BuildError::RegistryUnreachable {
                host: registry.authority(),
                message: "token response contained no token".to_string(),
            })
    }
}

/// Manifest endpoint URL for an image identity.
fn manifest_url(registry: &RegistryConfig, identity: &ImageIdentity) -> String {
    format!(
        "{}/v2/{}/manifests/{}",
        registry.base_url(),
        identity.remote_repository(),
        identity.tag
    )
}

#[derive(Debug, PartialEq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

/// Parse a `WWW-Authenticate: Bearer realm="...",service="..."` header.
fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let params = header.strip_prefix("Bearer ")?;

    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for param in params.split(',') {
        let (key, value) = param.trim().split_once('=')?;
        let value = value.trim_matches('"').to_string();
        match key {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }

    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}
