use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use http::Extensions;
use reqwest::{
    header::{HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE},
    Request, Response, StatusCode, Url,
};
use reqwest_middleware::{Middleware, Next};

use crate::{scope::clean_scopes, KociError};

use super::{fetch_token, Challenge, RegistryAuth};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The scopes a request wants a token for, carried in the request extensions
/// so the middleware can merge them with challenge scopes.
#[derive(Debug, Clone, Default)]
pub struct RequestScopes(pub Vec<String>);

/// A process-wide bearer-token cache keyed by registry host and normalized
/// scope set.
#[derive(Debug, Clone, Default)]
pub struct TokenCache {
    inner: Arc<RwLock<HashMap<String, HashMap<String, String>>>>,
}

/// A request interceptor that answers `401 Unauthorized` challenges.
///
/// Cached tokens are attached proactively; on a 401 the `WWW-Authenticate`
/// challenge is parsed, a token is looked up or acquired for the merged scope
/// set, and the request is retried once. Requests whose body cannot be cloned
/// (streaming uploads) pass the 401 through untouched; callers sequence a
/// cloneable request first so the token is already cached.
#[derive(Debug, Clone)]
pub struct AuthMiddleware {
    auth: RegistryAuth,
    token_client: reqwest::Client,
    cache: TokenCache,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RequestScopes {
    /// Creates a scope set from anything string-like.
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(scopes.into_iter().map(Into::into).collect())
    }
}

impl TokenCache {
    /// Looks up a cached token.
    pub fn get(&self, host: &str, scope_key: &str) -> Option<String> {
        self.inner
            .read()
            .ok()?
            .get(host)
            .and_then(|tokens| tokens.get(scope_key))
            .cloned()
    }

    /// Stores a token for later requests with the same host and scope set.
    pub fn insert(&self, host: &str, scope_key: &str, token: String) {
        if let Ok(mut inner) = self.inner.write() {
            inner
                .entry(host.to_string())
                .or_default()
                .insert(scope_key.to_string(), token);
        }
    }
}

impl AuthMiddleware {
    /// Creates a middleware using `auth` and a fresh token cache.
    pub fn new(auth: RegistryAuth) -> Self {
        Self {
            auth,
            token_client: reqwest::Client::new(),
            cache: TokenCache::default(),
        }
    }

    /// Returns a handle to the token cache.
    pub fn cache(&self) -> TokenCache {
        self.cache.clone()
    }

    async fn answer_bearer(
        &self,
        host: &str,
        realm: &str,
        service: Option<&str>,
        scopes: &[String],
        retry: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let scope_key = scopes.join(" ");

        if let Some(token) = self.cache.get(host, &scope_key) {
            if let Some(mut cached_retry) = retry.try_clone() {
                set_bearer(&mut cached_retry, &token)?;
                let response = next.clone().run(cached_retry, extensions).await?;
                if response.status().is_success() {
                    return Ok(response);
                }
                tracing::debug!(host, "cached token rejected, acquiring a new one");
            }
        }

        let token = fetch_token(&self.token_client, realm, service, scopes, &self.auth)
            .await
            .map_err(to_middleware_error)?;

        let mut retry = retry;
        set_bearer(&mut retry, &token)?;
        let response = next.run(retry, extensions).await?;
        if response.status().is_success() {
            self.cache.insert(host, &scope_key, token);
        }
        Ok(response)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait::async_trait]
impl Middleware for AuthMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let request_scopes = extensions
            .get::<RequestScopes>()
            .cloned()
            .unwrap_or_default()
            .0;
        let host = host_key(req.url());

        if req.headers().get(AUTHORIZATION).is_none() {
            let scope_key = clean_scopes(&request_scopes).join(" ");
            if let Some(token) = self.cache.get(&host, &scope_key) {
                set_bearer(&mut req, &token)?;
            }
        }

        let retry_basis = req.try_clone();
        let response = next.clone().run(req, extensions).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(Challenge::parse);
        let (Some(challenge), Some(retry)) = (challenge, retry_basis) else {
            return Ok(response);
        };

        match challenge {
            Challenge::Basic { .. } => {
                let Some((username, password)) = self.auth.basic_pair() else {
                    return Ok(response);
                };
                let mut retry = retry;
                set_basic(&mut retry, username, password)?;
                next.run(retry, extensions).await
            }
            Challenge::Bearer {
                realm,
                service,
                scope,
            } => {
                let mut scopes = request_scopes;
                if let Some(scope) = scope {
                    scopes.extend(scope.split_whitespace().map(String::from));
                }
                let scopes = clean_scopes(&scopes);
                self.answer_bearer(
                    &host,
                    &realm,
                    service.as_deref(),
                    &scopes,
                    retry,
                    extensions,
                    next,
                )
                .await
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Computes the token cache key for a request URL: the host, plus the port
/// when one is spelled out.
fn host_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

fn set_bearer(request: &mut Request, token: &str) -> reqwest_middleware::Result<()> {
    let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| to_middleware_error(KociError::custom(e)))?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(())
}

fn set_basic(request: &mut Request, username: &str, password: &str) -> reqwest_middleware::Result<()> {
    let encoded = BASE64.encode(format!("{}:{}", username, password));
    let value = HeaderValue::from_str(&format!("Basic {}", encoded))
        .map_err(|e| to_middleware_error(KociError::custom(e)))?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(())
}

fn to_middleware_error(error: KociError) -> reqwest_middleware::Error {
    reqwest_middleware::Error::Middleware(anyhow::Error::new(error))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
