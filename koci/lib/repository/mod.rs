//! The per-repository protocol engine: existence checks, manifest and index
//! retrieval, recursive pulls, chunked uploads, cross-repository mounts and
//! tagging.

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
};

use futures::StreamExt;
use getset::Getters;
use reqwest::{header, Method};
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::{
    auth::RequestScopes,
    descriptor::PlatformFilter,
    error::error_from_response,
    manifest::media_types,
    scope,
    transfer::TransferCoordinator,
    Descriptor, Digest, Index, KociError, KociResult, Manifest, Router, TagList,
};

mod pull;
mod push;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The `Accept` value used when a reference may name a manifest or an index.
const ACCEPT_MANIFEST_OR_INDEX: &str =
    "application/vnd.oci.image.manifest.v1+json, application/vnd.oci.image.index.v1+json";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A client for one repository within a registry.
///
/// Cloning is cheap; clones share the HTTP client, the upload-session map and
/// the range-support probe result.
#[derive(Debug, Clone)]
pub struct Repository {
    client: ClientWithMiddleware,
    router: Router,
    name: String,
    coordinator: TransferCoordinator,
    uploads: Arc<Mutex<HashMap<Digest, UploadStatus>>>,
    range_support: Arc<OnceLock<bool>>,
}

/// The in-memory state of one blob upload session.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct UploadStatus {
    /// Where the next chunk goes.
    location: String,

    /// How many bytes the server has confirmed.
    offset: u64,

    /// The smallest chunk the server accepts.
    min_chunk_size: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Repository {
    pub(crate) fn new(
        client: ClientWithMiddleware,
        router: Router,
        name: impl Into<String>,
        coordinator: TransferCoordinator,
    ) -> Self {
        Self {
            client,
            router,
            name: name.into(),
            coordinator,
            uploads: Arc::new(Mutex::new(HashMap::new())),
            range_support: Arc::new(OnceLock::new()),
        }
    }

    /// The repository name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Asks the registry whether it holds the described content, using the
    /// manifest endpoint for manifests and indexes and the blob endpoint for
    /// everything else.
    pub async fn exists(&self, descriptor: &Descriptor) -> KociResult<bool> {
        let media_type = descriptor.media_type().as_str();
        let url = if media_type == media_types::MANIFEST || media_type == media_types::INDEX {
            self.router
                .manifest_url(&self.name, &descriptor.digest().to_string())
        } else {
            self.router.blob_url(&self.name, descriptor.digest())
        };

        let response = self
            .request(Method::HEAD, &url, &[scope::pull(&self.name)])
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    /// Resolves a tag to a descriptor.
    ///
    /// Dispatches on the `Content-Type` the registry reports. An index without
    /// a platform filter resolves to a descriptor freshly computed over the
    /// index body; with a filter it resolves to the first child whose platform
    /// satisfies it. A manifest resolves to a descriptor computed over the
    /// manifest body.
    pub async fn resolve(
        &self,
        tag: &str,
        platform_filter: Option<&PlatformFilter>,
    ) -> KociResult<Descriptor> {
        let url = self.router.manifest_url(&self.name, tag);
        let response = self
            .request(Method::HEAD, &url, &[scope::pull(&self.name)])
            .header(header::ACCEPT, ACCEPT_MANIFEST_OR_INDEX)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
            .unwrap_or_default();

        match content_type.as_str() {
            media_types::INDEX => match platform_filter {
                None => {
                    let body = self.fetch_body(&url, media_types::INDEX).await?;
                    Descriptor::from_byte_stream(media_types::INDEX, body).await
                }
                Some(filter) => {
                    let index: Index = self.fetch_json(&url, media_types::INDEX).await?;
                    index
                        .manifests()
                        .iter()
                        .find(|entry| {
                            entry
                                .platform()
                                .as_ref()
                                .map(|platform| filter(platform))
                                .unwrap_or(false)
                        })
                        .cloned()
                        .ok_or_else(|| {
                            KociError::PlatformNotFound(format!(
                                "{}/{}:{}",
                                self.router.registry(),
                                self.name,
                                tag
                            ))
                        })
                }
            },
            media_types::MANIFEST => {
                let body = self.fetch_body(&url, media_types::MANIFEST).await?;
                Descriptor::from_byte_stream(media_types::MANIFEST, body).await
            }
            other => Err(KociError::UnsupportedManifest {
                media_type: other.to_string(),
                context: format!("resolve {}/{}:{}", self.router.registry(), self.name, tag),
            }),
        }
    }

    /// Fetches and decodes a manifest. The descriptor must describe one.
    pub async fn manifest(&self, descriptor: &Descriptor) -> KociResult<Manifest> {
        if descriptor.media_type() != media_types::MANIFEST {
            return Err(KociError::UnsupportedManifest {
                media_type: descriptor.media_type().clone(),
                context: "manifest fetch".to_string(),
            });
        }
        let url = self
            .router
            .manifest_url(&self.name, &descriptor.digest().to_string());
        self.fetch_json(&url, media_types::MANIFEST).await
    }

    /// Fetches and decodes an index. The descriptor must describe one.
    pub async fn index(&self, descriptor: &Descriptor) -> KociResult<Index> {
        if descriptor.media_type() != media_types::INDEX {
            return Err(KociError::UnsupportedManifest {
                media_type: descriptor.media_type().clone(),
                context: "index fetch".to_string(),
            });
        }
        let url = self
            .router
            .manifest_url(&self.name, &descriptor.digest().to_string());
        self.fetch_json(&url, media_types::INDEX).await
    }

    /// Lists the repository's tags.
    pub async fn tags(&self) -> KociResult<TagList> {
        let url = self.router.tags_url(&self.name);
        self.fetch_json(&url, "application/json").await
    }

    /// Whether the registry serves byte ranges for blobs, probed once via
    /// `HEAD` and the `Accept-Ranges` header, then cached for this instance.
    pub(crate) async fn supports_range(&self, digest: &Digest) -> bool {
        if let Some(supported) = self.range_support.get() {
            return *supported;
        }

        let url = self.router.blob_url(&self.name, digest);
        let probe = self
            .request(Method::HEAD, &url, &[scope::pull(&self.name)])
            .send()
            .await;
        let supported = match probe {
            Ok(response) => response
                .headers()
                .get(header::ACCEPT_RANGES)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.eq_ignore_ascii_case("bytes"))
                .unwrap_or(false),
            // Leave the tri-state unknown on transport errors.
            Err(_) => return false,
        };

        let _ = self.range_support.set(supported);
        supported
    }

    /// Builds a request carrying the scopes the auth middleware should
    /// acquire a token for.
    pub(crate) fn request(&self, method: Method, url: &str, scopes: &[String]) -> RequestBuilder {
        self.client
            .request(method, url)
            .with_extension(RequestScopes::new(scopes.iter().cloned()))
    }

    /// Fetches a JSON document with the given `Accept` header and pull scope.
    async fn fetch_json<T: DeserializeOwned>(&self, url: &str, accept: &str) -> KociResult<T> {
        let response = self
            .request(Method::GET, url, &[scope::pull(&self.name)])
            .header(header::ACCEPT, accept)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response.json().await?)
    }

    /// Fetches a body as a byte stream with the given `Accept` header.
    async fn fetch_body(
        &self,
        url: &str,
        accept: &str,
    ) -> KociResult<crate::progress::ByteStream> {
        let response = self
            .request(Method::GET, url, &[scope::pull(&self.name)])
            .header(header::ACCEPT, accept)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(KociError::from))
            .boxed())
    }
}

impl UploadStatus {
    pub(crate) fn new(location: String, offset: u64, min_chunk_size: u64) -> Self {
        Self {
            location,
            offset,
            min_chunk_size,
        }
    }
}
