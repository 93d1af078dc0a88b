use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{error::error_from_response, KociError, KociResult};

use super::RegistryAuth;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The client identifier presented to OAuth2 token endpoints.
pub const DEFAULT_CLIENT_ID: &str = "koci";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The JSON body returned by a token endpoint.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    /// The legacy token field.
    #[serde(default)]
    token: String,

    /// The OAuth2-style token field, preferred when present.
    #[serde(default)]
    access_token: String,

    /// Seconds until the token expires.
    #[serde(default)]
    #[allow(dead_code)]
    expires_in: Option<u32>,

    /// When the token was issued.
    #[serde(default)]
    #[allow(dead_code)]
    issued_at: Option<DateTime<Utc>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TokenResponse {
    /// Returns `access_token` when present, falling back to `token`.
    pub fn preferred_token(self) -> KociResult<String> {
        if !self.access_token.is_empty() {
            return Ok(self.access_token);
        }
        if !self.token.is_empty() {
            return Ok(self.token);
        }
        Err(KociError::EmptyTokenReturned)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Acquires a bearer token for `scopes`, dispatching between the distribution
/// token endpoint and the OAuth2 endpoint based on the configured credentials.
pub async fn fetch_token(
    client: &reqwest::Client,
    realm: &str,
    service: Option<&str>,
    scopes: &[String],
    auth: &RegistryAuth,
) -> KociResult<String> {
    if auth.prefers_oauth2() {
        fetch_oauth2_token(client, realm, service, scopes, auth).await
    } else {
        fetch_distribution_token(client, realm, service, scopes, auth).await
    }
}

/// Acquires a token via `GET realm?service=…&scope=…&scope=…`, with Basic
/// credentials attached when configured.
pub async fn fetch_distribution_token(
    client: &reqwest::Client,
    realm: &str,
    service: Option<&str>,
    scopes: &[String],
    auth: &RegistryAuth,
) -> KociResult<String> {
    let mut request = client.get(realm);
    if let Some(service) = service {
        request = request.query(&[("service", service)]);
    }
    for scope in scopes {
        request = request.query(&[("scope", scope)]);
    }
    if let Some((username, password)) = auth.basic_pair() {
        request = request.basic_auth(username, Some(password));
    }

    tracing::debug!(realm, ?scopes, "requesting distribution token");
    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    response.json::<TokenResponse>().await?.preferred_token()
}

/// Acquires a token via `POST realm` with a form-encoded OAuth2 grant:
/// `refresh_token` when one is configured, `password` otherwise.
pub async fn fetch_oauth2_token(
    client: &reqwest::Client,
    realm: &str,
    service: Option<&str>,
    scopes: &[String],
    auth: &RegistryAuth,
) -> KociResult<String> {
    let scope = scopes.join(" ");
    let mut form: Vec<(&str, &str)> = vec![("client_id", DEFAULT_CLIENT_ID)];
    if let Some(service) = service {
        form.push(("service", service));
    }
    if !scope.is_empty() {
        form.push(("scope", &scope));
    }
    match auth.refresh_token() {
        Some(refresh_token) => {
            form.push(("grant_type", "refresh_token"));
            form.push(("refresh_token", refresh_token.as_str()));
        }
        None => {
            let (username, password) = auth.basic_pair().ok_or_else(|| KociError::HttpError {
                status: 401,
                message: "oauth2 password grant requires a username and password".to_string(),
            })?;
            form.push(("grant_type", "password"));
            form.push(("username", username));
            form.push(("password", password));
        }
    }

    tracing::debug!(realm, ?scopes, "requesting oauth2 token");
    let response = client.post(realm).form(&form).send().await?;
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    response.json::<TokenResponse>().await?.preferred_token()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
