//! OAuth client for the platform identity service.
//!
//! Two grants are used:
//!
//! - **client credentials**: an app token for public lookups, minted on
//!   every start and never persisted
//! - **authorization code**: a user token acting on behalf of the viewer,
//!   obtained interactively (see [`crate::login`]) and persisted
//!
//! Both grants POST a form to `<id_url>/oauth2/token`.

use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::token_store::Credential;

/// Path of the token endpoint under the identity base URL.
const TOKEN_PATH: &str = "/oauth2/token";

/// Path of the authorization page under the identity base URL.
const AUTHORIZE_PATH: &str = "/oauth2/authorize";

/// Errors that can occur while obtaining or using a token.
#[derive(Error, Debug)]
pub enum AuthError {
    /// The token request could not be sent or its body read.
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The identity service answered with a non-success status.
    #[error("token endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The identity service answered 2xx with an unexpected body.
    #[error("malformed token response: {0}")]
    MalformedResponse(String),

    /// The user declined (or the provider refused) the authorization.
    #[error("authorization denied: {0}")]
    Denied(String),

    /// The local callback listener could not be started.
    #[error("callback listener failed: {0}")]
    Listener(#[source] std::io::Error),

    /// A token was rejected by the platform API.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The stored user credential is past its lifetime.
    #[error("user credential expired; run `twaybar login` to re-authorize")]
    Expired,

    /// The identity base URL could not be parsed.
    #[error("invalid identity URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Token endpoint response body.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    token_type: Option<String>,
}

/// Client for the identity service token and authorize endpoints.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: Client,
    id_url: String,
}

impl OAuthClient {
    /// Creates a client for the identity service at `id_url`.
    pub fn new(http: Client, id_url: impl Into<String>) -> Self {
        let id_url = id_url.into().trim_end_matches('/').to_string();
        Self { http, id_url }
    }

    /// Base URL of the identity service.
    #[must_use]
    pub fn id_url(&self) -> &str {
        &self.id_url
    }

    /// Mints an app token with the client-credentials grant.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Request`] on network failure,
    /// [`AuthError::Rejected`] on a non-2xx answer and
    /// [`AuthError::MalformedResponse`] if the body is not a token response.
    pub async fn app_token(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> Result<Credential, AuthError> {
        let params = [
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("grant_type", "client_credentials"),
        ];

        let credential = self.request_token(&params).await?;
        debug!(expires_in = credential.expires_in, "Minted app token");
        Ok(credential)
    }

    /// Exchanges an authorization code for a user token.
    ///
    /// `redirect_uri` must match the one used to build the authorize URL.
    ///
    /// # Errors
    ///
    /// Same as [`OAuthClient::app_token`].
    pub async fn exchange_code(
        &self,
        client_id: &str,
        client_secret: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<Credential, AuthError> {
        let params = [
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
        ];

        let credential = self.request_token(&params).await?;
        debug!(expires_in = credential.expires_in, "Exchanged authorization code");
        Ok(credential)
    }

    /// Builds the URL the user opens to grant `scopes`.
    ///
    /// Scopes are space-joined, which form encoding renders as `+`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidUrl`] if the identity base URL is invalid.
    pub fn authorize_url(
        &self,
        client_id: &str,
        redirect_uri: &str,
        scopes: &[&str],
    ) -> Result<String, AuthError> {
        let mut url = Url::parse(&format!("{}{AUTHORIZE_PATH}", self.id_url))?;
        url.query_pairs_mut()
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &scopes.join(" "));
        Ok(url.into())
    }

    async fn request_token(&self, params: &[(&str, &str)]) -> Result<Credential, AuthError> {
        let response = self
            .http
            .post(format!("{}{TOKEN_PATH}", self.id_url))
            .form(params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| AuthError::MalformedResponse(e.to_string()))?;

        if token.access_token.is_empty() {
            return Err(AuthError::MalformedResponse(
                "empty access_token".to_string(),
            ));
        }
        if let Some(token_type) = token.token_type.as_deref() {
            if !token_type.eq_ignore_ascii_case("bearer") {
                debug!(token_type, "Unexpected token type");
            }
        }

        Ok(Credential::new(token.access_token, token.expires_in, Utc::now()))
    }
}
