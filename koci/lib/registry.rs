//! The registry facade: connection bootstrap, ping, catalog traversal and
//! repository handles.

use std::time::Duration;

use async_stream::try_stream;
use futures::stream::BoxStream;
use reqwest::{
    header::{HeaderMap, HeaderValue, LINK},
    Client, Method, Url,
};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::{
    auth::{AuthMiddleware, RegistryAuth, RequestScopes},
    error::error_from_response,
    reference::validate_repository,
    scope,
    transfer::TransferCoordinator,
    KociResult, Repository, Router, TagList,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The API version header set on every request.
const API_VERSION_HEADER: &str = "Docker-Distribution-API-Version";
const API_VERSION: &str = "registry/2.0";

/// The request timeout applied when the configuration does not override it.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// The page size [`Registry::list`] uses.
const DEFAULT_LIST_PAGE_SIZE: usize = 1000;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How to reach and authenticate against one registry.
#[derive(Debug, Clone, TypedBuilder)]
pub struct RegistryConfig {
    /// The registry host, with an optional port.
    #[builder(setter(into))]
    registry: String,

    /// Credentials for the registry and its token service.
    #[builder(default)]
    auth: RegistryAuth,

    /// Use plain HTTP instead of HTTPS, for local registries.
    #[builder(default)]
    plain_http: bool,

    /// The per-request timeout.
    #[builder(default = DEFAULT_TIMEOUT)]
    timeout: Duration,
}

/// A client for one registry: version check, catalog traversal and repository
/// handles.
#[derive(Debug, Clone)]
pub struct Registry {
    client: ClientWithMiddleware,
    router: Router,
    coordinator: TransferCoordinator,
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    repositories: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Registry {
    /// Builds a registry client: a reqwest client with the API version header
    /// and timeout, wrapped in transient-error retry and the 401-answering
    /// auth middleware.
    pub fn connect(config: RegistryConfig) -> KociResult<Self> {
        let router = Router::new(config.registry, config.plain_http)?;

        let mut headers = HeaderMap::new();
        headers.insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .with(AuthMiddleware::new(config.auth))
            .build();

        Ok(Self {
            client,
            router,
            coordinator: TransferCoordinator::new(),
        })
    }

    /// The router for this registry's endpoints.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Checks that the registry speaks the v2 API (and that credentials are
    /// accepted, when it requires them).
    pub async fn ping(&self) -> KociResult<()> {
        let response = self
            .request(Method::GET, &self.router.base_url(), &[])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(())
    }

    /// Fetches the full repository catalog in one request.
    pub async fn catalog(&self) -> KociResult<Vec<String>> {
        let url = self.router.catalog_url(None, None);
        let response = self
            .request(Method::GET, &url, &[scope::CATALOG.to_string()])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let page: CatalogResponse = response.json().await?;
        Ok(page.repositories)
    }

    /// Walks the catalog lazily, one page per item, following the registry's
    /// `Link: <…>; rel="next"` pagination.
    pub fn catalog_paged(
        &self,
        page_size: usize,
        last: Option<&str>,
    ) -> BoxStream<'static, KociResult<Vec<String>>> {
        let this = self.clone();
        let mut last = last.map(String::from);
        Box::pin(try_stream! {
            let mut page_size = page_size;
            loop {
                let url = this.router.catalog_url(Some(page_size), last.as_deref());
                let response = this
                    .request(Method::GET, &url, &[scope::CATALOG.to_string()])
                    .send()
                    .await?;
                if !response.status().is_success() {
                    let failed: KociResult<()> = Err(error_from_response(response).await);
                    failed?;
                    unreachable!();
                }

                let next = response
                    .headers()
                    .get(LINK)
                    .and_then(|value| value.to_str().ok())
                    .and_then(parse_next_link);
                let page: CatalogResponse = response.json().await?;
                yield page.repositories;

                match next {
                    Some((next_n, next_last)) => {
                        if let Some(n) = next_n {
                            page_size = n;
                        }
                        last = next_last;
                    }
                    None => break,
                }
            }
        })
    }

    /// Lists every repository's tags: the catalog crossed with `tags/list`,
    /// as a lazy stream of one [`TagList`] per repository.
    pub fn list(&self, page_size: Option<usize>) -> BoxStream<'static, KociResult<TagList>> {
        use futures::StreamExt;

        let this = self.clone();
        let page_size = page_size.unwrap_or(DEFAULT_LIST_PAGE_SIZE);
        Box::pin(try_stream! {
            let mut pages = this.catalog_paged(page_size, None);
            while let Some(page) = pages.next().await {
                for repository in page? {
                    let tags = this.repo(&repository)?.tags().await?;
                    yield tags;
                }
            }
        })
    }

    /// Returns a handle for one repository, sharing this registry's client,
    /// auth state and upload coordinator.
    pub fn repo(&self, name: &str) -> KociResult<Repository> {
        validate_repository(name)?;
        Ok(Repository::new(
            self.client.clone(),
            self.router.clone(),
            name,
            self.coordinator.clone(),
        ))
    }

    fn request(&self, method: Method, url: &str, scopes: &[String]) -> RequestBuilder {
        self.client
            .request(method, url)
            .with_extension(RequestScopes::new(scopes.iter().cloned()))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Extracts the `n` and `last` parameters from a `Link: <url>; rel="next"`
/// header.
fn parse_next_link(value: &str) -> Option<(Option<usize>, Option<String>)> {
    let value = value.trim();
    if !value.contains("rel=\"next\"") {
        return None;
    }
    let start = value.find('<')? + 1;
    let end = value.find('>')?;
    let target = &value[start..end];

    // Relative pagination URLs are common; any base makes them parseable.
    let parsed = Url::parse(target)
        .or_else(|_| Url::parse("scheme://host")?.join(target))
        .ok()?;

    let mut n = None;
    let mut last = None;
    for (key, value) in parsed.query_pairs() {
        match key.as_ref() {
            "n" => n = value.parse::<usize>().ok(),
            "last" => last = Some(value.into_owned()),
            _ => {}
        }
    }
    Some((n, last))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
