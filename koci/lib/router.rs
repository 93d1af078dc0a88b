//! Registry endpoint URL construction.

use getset::Getters;
use reqwest::Url;

use crate::{Digest, KociError, KociResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Builds the v2 endpoint URLs for one registry host and resolves the
/// `Location` headers returned by upload sessions.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
pub struct Router {
    /// The registry host, with an optional port.
    #[getset(get = "pub")]
    registry: String,

    /// The scheme+host prefix every endpoint is rooted at.
    base: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Router {
    /// Creates a router for `registry`, using HTTPS unless `plain_http` is set.
    pub fn new(registry: impl Into<String>, plain_http: bool) -> KociResult<Self> {
        let registry = registry.into();
        let scheme = if plain_http { "http" } else { "https" };
        let base = format!("{}://{}", scheme, registry);
        Url::parse(&base).map_err(|_| KociError::InvalidRegistry(registry.clone()))?;
        Ok(Self { registry, base })
    }

    /// The API version check endpoint.
    pub fn base_url(&self) -> String {
        format!("{}/v2/", self.base)
    }

    /// The repository catalog endpoint, with optional pagination parameters.
    pub fn catalog_url(&self, n: Option<usize>, last: Option<&str>) -> String {
        let mut url = format!("{}/v2/_catalog", self.base);
        let mut separator = '?';
        if let Some(n) = n {
            url.push_str(&format!("{}n={}", separator, n));
            separator = '&';
        }
        if let Some(last) = last {
            url.push_str(&format!("{}last={}", separator, last));
        }
        url
    }

    /// The tag listing endpoint for a repository.
    pub fn tags_url(&self, repository: &str) -> String {
        format!("{}/v2/{}/tags/list", self.base, repository)
    }

    /// The manifest endpoint for a tag or digest.
    pub fn manifest_url(&self, repository: &str, reference: &str) -> String {
        format!("{}/v2/{}/manifests/{}", self.base, repository, reference)
    }

    /// The blob endpoint for a digest.
    pub fn blob_url(&self, repository: &str, digest: &Digest) -> String {
        format!("{}/v2/{}/blobs/{}", self.base, repository, digest)
    }

    /// The upload session creation endpoint.
    pub fn uploads_url(&self, repository: &str) -> String {
        format!("{}/v2/{}/blobs/uploads/", self.base, repository)
    }

    /// The cross-repository mount endpoint.
    pub fn mount_url(&self, repository: &str, digest: &Digest, from: &str) -> String {
        format!(
            "{}/v2/{}/blobs/uploads/?mount={}&from={}",
            self.base, repository, digest, from
        )
    }

    /// Resolves a `Location` header value: absolute URLs are used as-is,
    /// relative ones are joined against the registry base, keeping the encoded
    /// path and query.
    pub fn parse_upload_location(&self, location: &str) -> KociResult<String> {
        if let Ok(url) = Url::parse(location) {
            return Ok(url.to_string());
        }
        let base = Url::parse(&self.base).map_err(|_| {
            KociError::InvalidRegistry(self.registry.clone())
        })?;
        let joined = base.join(location).map_err(|e| KociError::HttpError {
            status: 0,
            message: format!("unresolvable upload location '{}': {}", location, e),
        })?;
        Ok(joined.to_string())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
