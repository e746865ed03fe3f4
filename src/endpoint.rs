/// Refresh endpoint contract and its HTTP implementation
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Validated outcome of a successful refresh call
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Lifetime of `access_token` in seconds
    pub expires_in: u64,
    /// Present when the server rotated the refresh token
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("expires_in", &self.expires_in)
            .field("rotated", &self.refresh_token.is_some())
            .finish()
    }
}

/// Raw body of a refresh response; every field may be missing on the wire.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
}

impl TokenResponse {
    fn into_grant(self) -> Result<TokenGrant> {
        let access_token = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::MissingField("access_token".into()))?;
        let expires_in = self
            .expires_in
            .ok_or_else(|| Error::MissingField("expires_in".into()))?;

        Ok(TokenGrant {
            access_token,
            expires_in,
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
        })
    }
}

/// Parse and validate a token response body
pub(crate) fn parse_grant(body: &[u8]) -> Result<TokenGrant> {
    let parsed: TokenResponse = serde_json::from_slice(body)?;
    parsed.into_grant()
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Exchanges a refresh token for a new access token
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;
}

/// Refresh endpoint reached over HTTP
///
/// Posts `{"refresh_token": "..."}` as JSON to `<base_url><refresh_path>`.
/// Non-success statuses become [`Error::RefreshRejected`] carrying the body
/// text so the failure classifier can inspect it.
#[derive(Debug, Clone)]
pub struct HttpTokenEndpoint {
    http: reqwest::Client,
    url: String,
}

impl HttpTokenEndpoint {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }

    /// Endpoint at `config.refresh_path`, sharing the given client
    pub fn from_config(http: reqwest::Client, config: &ClientConfig) -> Self {
        Self::new(http, config.url_for(&config.refresh_path))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        let response = self
            .http
            .post(&self.url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(Error::RefreshRejected {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        parse_grant(&body)
    }
}
