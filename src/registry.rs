//! Registry client for streaming blob downloads.
//!
//! Speaks the OCI distribution blob endpoint
//! (`/v2/<name>/blobs/<digest>`) with anonymous bearer-token auth. The
//! response is handed back unread so the fetcher can apply its status table
//! and stream the body without materialising it.
//!
//! ## Token scope accumulation
//!
//! Pull tokens are cached per repository. A long-lived client therefore
//! accumulates one scope entry per repository it has touched; registries
//! keep matching per-scope state server-side and eventually answer 401 once
//! the set grows too large. Fetcher workers bound this by discarding the
//! whole client (and its token cache) at a fixed delivery interval.
//!
//! ## Rate-limit headers
//!
//! `X-Ratelimit-Remaining` and `X-Ratelimit-Reset` are inspected on every
//! response. The remaining count may carry a window suffix
//! (`"42;w=21600"`); the reset time is RFC1123.

use crate::constants::{BLOB_DEADLINE, OCI_LAYER_MEDIA_TYPE_GZIP, RATE_LIMIT_FALLBACK};
use crate::error::{Error, Result};
use crate::records::LayerDescriptor;
use chrono::{DateTime, Utc};
use oci_distribution::Reference;
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::{Client, Response};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const DOCKER_REGISTRY_HOST: &str = "registry-1.docker.io";
const DOCKER_AUTH_BASE_URL: &str =
    "https://auth.docker.io/token?service=registry.docker.io&scope=repository:";

const RATELIMIT_REMAINING_HEADER: &str = "X-Ratelimit-Remaining";
const RATELIMIT_RESET_HEADER: &str = "X-Ratelimit-Reset";

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// HTTP client with a per-repository pull-token cache.
pub struct RegistryClient {
    http: Client,
    tokens: HashMap<String, String>,
}

impl RegistryClient {
    /// Builds a fresh client with an empty token cache.
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("layerharvest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::ClientBuild(e.to_string()))?;
        Ok(Self {
            http,
            tokens: HashMap::new(),
        })
    }

    /// Number of repository scopes this client has authorised.
    pub fn scope_count(&self) -> usize {
        self.tokens.len()
    }

    /// Issues a streaming GET for the layer blob. The returned response has
    /// an unread body; status inspection is the caller's job. The request
    /// deadline covers the body read.
    pub async fn blob_get(&mut self, descriptor: &LayerDescriptor) -> Result<Response> {
        let reference = descriptor
            .repo
            .parse::<Reference>()
            .map_err(|e| Error::InvalidReference {
                reference: descriptor.repo.clone(),
                reason: e.to_string(),
            })?;

        let token = self.token_for(&reference).await?;
        let url = blob_url(
            resolve_registry(reference.registry()),
            reference.repository(),
            &descriptor.digest,
        );
        debug!("GET {}", url);

        let mut request = self
            .http
            .get(&url)
            .header(ACCEPT, OCI_LAYER_MEDIA_TYPE_GZIP)
            .timeout(BLOB_DEADLINE);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        request.send().await.map_err(|e| Error::BlobFetchFailed {
            digest: descriptor.digest.clone(),
            reason: e.to_string(),
        })
    }

    /// Returns a cached pull token for the repository, fetching one from the
    /// Docker Hub token endpoint on first use. Other registries are
    /// attempted anonymously.
    async fn token_for(&mut self, reference: &Reference) -> Result<Option<String>> {
        if reference.registry() != "docker.io" {
            return Ok(None);
        }
        let repository = reference.repository();
        if let Some(token) = self.tokens.get(repository) {
            return Ok(Some(token.clone()));
        }

        let url = format!("{}{}:pull", DOCKER_AUTH_BASE_URL, repository);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::AuthFailed {
                scope: repository.to_string(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(Error::AuthFailed {
                scope: repository.to_string(),
                reason: format!("token endpoint returned {}", response.status()),
            });
        }
        let body: TokenResponse = response.json().await.map_err(|e| Error::AuthFailed {
            scope: repository.to_string(),
            reason: e.to_string(),
        })?;

        self.tokens
            .insert(repository.to_string(), body.token.clone());
        Ok(Some(body.token))
    }
}

/// Docker Hub references resolve to the registry-1 host; everything else is
/// contacted directly.
fn resolve_registry(registry: &str) -> &str {
    if registry == "docker.io" {
        DOCKER_REGISTRY_HOST
    } else {
        registry
    }
}

fn blob_url(host: &str, repository: &str, digest: &str) -> String {
    format!("https://{}/v2/{}/blobs/{}", host, repository, digest)
}

/// True when the response advertises zero remaining rate-limit budget.
pub fn remaining_is_zero(headers: &HeaderMap) -> bool {
    let Some(value) = headers.get(RATELIMIT_REMAINING_HEADER) else {
        return false;
    };
    let Ok(value) = value.to_str() else {
        return false;
    };
    matches!(parse_remaining(value), Some(0))
}

/// Time to sleep until the advertised rate-limit reset, when present and
/// parsable. A reset already in the past yields a zero delay.
pub fn reset_delay(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RATELIMIT_RESET_HEADER)?.to_str().ok()?;
    let reset = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = reset.signed_duration_since(Utc::now());
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// Backoff for a response that reported zero remaining budget.
pub fn exhausted_backoff(headers: &HeaderMap) -> Duration {
    reset_delay(headers).unwrap_or(RATE_LIMIT_FALLBACK)
}

/// The remaining count may carry a window suffix, e.g. `"42;w=21600"`.
fn parse_remaining(value: &str) -> Option<i64> {
    value.split(';').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_blob_url_shape() {
        let url = blob_url("registry-1.docker.io", "library/nginx", "sha256:abcd");
        assert_eq!(
            url,
            "https://registry-1.docker.io/v2/library/nginx/blobs/sha256:abcd"
        );
    }

    #[test]
    fn test_docker_hub_resolves_to_registry_1() {
        assert_eq!(resolve_registry("docker.io"), "registry-1.docker.io");
        assert_eq!(resolve_registry("ghcr.io"), "ghcr.io");
    }

    #[test]
    fn test_parse_remaining_with_window_suffix() {
        assert_eq!(parse_remaining("42;w=21600"), Some(42));
        assert_eq!(parse_remaining("0;w=21600"), Some(0));
        assert_eq!(parse_remaining("17"), Some(17));
        assert_eq!(parse_remaining("garbage"), None);
    }

    #[test]
    fn test_remaining_is_zero() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RATELIMIT_REMAINING_HEADER,
            HeaderValue::from_static("0;w=21600"),
        );
        assert!(remaining_is_zero(&headers));

        headers.insert(RATELIMIT_REMAINING_HEADER, HeaderValue::from_static("5"));
        assert!(!remaining_is_zero(&headers));

        assert!(!remaining_is_zero(&HeaderMap::new()));
    }

    #[test]
    fn test_reset_delay_parses_rfc1123() {
        let reset = Utc::now() + chrono::Duration::seconds(90);
        let mut headers = HeaderMap::new();
        headers.insert(
            RATELIMIT_RESET_HEADER,
            HeaderValue::from_str(&reset.to_rfc2822()).unwrap(),
        );
        let delay = reset_delay(&headers).unwrap();
        assert!(delay > Duration::from_secs(60) && delay < Duration::from_secs(120));
    }

    #[test]
    fn test_reset_delay_in_past_is_zero() {
        let reset = Utc::now() - chrono::Duration::seconds(90);
        let mut headers = HeaderMap::new();
        headers.insert(
            RATELIMIT_RESET_HEADER,
            HeaderValue::from_str(&reset.to_rfc2822()).unwrap(),
        );
        assert_eq!(reset_delay(&headers), Some(Duration::ZERO));
    }

    #[test]
    fn test_unparsable_reset_falls_back() {
        let mut headers = HeaderMap::new();
        headers.insert(RATELIMIT_RESET_HEADER, HeaderValue::from_static("soon"));
        assert_eq!(exhausted_backoff(&headers), RATE_LIMIT_FALLBACK);
    }
}
