/// Authenticated HTTP client with token refresh interceptors
use crate::config::ClientConfig;
use crate::endpoint::{parse_grant, HttpTokenEndpoint};
use crate::error::{Error, Result};
use crate::refresh::RefreshCoordinator;
use crate::store::{CredentialKey, CredentialStore, Credentials};
use crate::token::{access_token_expired, now_ms};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Method, Request, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// HTTP client that keeps its bearer token fresh
///
/// Requests to authentication endpoints go out untouched. Every other request
/// passes [`authorize`](Self::authorize) before sending and, on a 401,
/// [`execute`](Self::execute) refreshes and replays it once.
pub struct ApiClient<S: CredentialStore> {
    http: reqwest::Client,
    config: ClientConfig,
    coordinator: Arc<RefreshCoordinator<S>>,
}

impl<S: CredentialStore> Clone for ApiClient<S> {
    fn clone(&self) -> Self {
        Self {
            http: self.http.clone(),
            config: self.config.clone(),
            coordinator: self.coordinator.clone(),
        }
    }
}

impl<S: CredentialStore> ApiClient<S> {
    /// Create a client refreshing through `config.refresh_path`
    pub fn new(config: ClientConfig, store: Arc<S>) -> Result<Self> {
        let http = build_http(&config)?;
        let endpoint = Arc::new(HttpTokenEndpoint::from_config(http.clone(), &config));
        let coordinator = RefreshCoordinator::new(store, endpoint)
            .with_cooldown(config.refresh_cooldown)
            .with_expiry_buffer(config.expiry_buffer);

        Ok(Self {
            http,
            config,
            coordinator: Arc::new(coordinator),
        })
    }

    /// Create a client around an existing coordinator
    ///
    /// Clients for different APIs backed by the same credentials must share
    /// one coordinator so their refreshes are coordinated too.
    pub fn with_coordinator(
        config: ClientConfig,
        coordinator: Arc<RefreshCoordinator<S>>,
    ) -> Result<Self> {
        Ok(Self {
            http: build_http(&config)?,
            config,
            coordinator,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator<S>> {
        &self.coordinator
    }

    /// Start a request to a path relative to the base URL
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, self.config.url_for(path))
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: &str) -> RequestBuilder {
        self.request(Method::PUT, path)
    }

    pub fn delete(&self, path: &str) -> RequestBuilder {
        self.request(Method::DELETE, path)
    }

    /// Build and execute a request started with [`request`](Self::request)
    pub async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        self.execute(builder.build()?).await
    }

    /// Attach a valid bearer token to an outbound request.
    ///
    /// Never fails: without a usable token the request goes out unchanged and
    /// the server's 401 is left to [`execute`](Self::execute).
    pub async fn authorize(&self, mut request: Request) -> Request {
        if self.config.is_auth_path(request.url().path()) {
            return request;
        }

        let store = self.coordinator.store();
        let token = match store.get(CredentialKey::AccessToken) {
            Ok(Some(token)) => token,
            Ok(None) => return request,
            Err(e) => {
                warn!(error = %e, "could not read access token, sending unauthenticated");
                return request;
            }
        };

        let expires_at = store.get(CredentialKey::ExpiresAt).ok().flatten();
        let token = if access_token_expired(
            &token,
            expires_at.as_deref(),
            self.config.expiry_buffer,
            now_ms(),
        ) {
            debug!(url = %request.url(), "access token expiring, refreshing first");
            match self.coordinator.ensure_fresh_token().await {
                Some(token) => token,
                None => return request,
            }
        } else {
            token
        };

        set_bearer(&mut request, &token);
        request
    }

    /// Execute a request, refreshing and replaying it once after a 401.
    ///
    /// An unresolved 401 is returned as the original response; callers should
    /// treat it as "the user must log in again".
    pub async fn execute(&self, request: Request) -> Result<Response> {
        if self.config.is_auth_path(request.url().path()) {
            return Ok(self.http.execute(request).await?);
        }

        let request = self.authorize(request).await;
        let replay = request.try_clone();
        let response = self.http.execute(request).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(mut replay) = replay else {
            debug!(url = %response.url(), "401 on a request that cannot be replayed");
            return Ok(response);
        };

        if self.coordinator.has_permanently_failed() {
            debug!(url = %response.url(), "401 after permanent refresh failure");
            return Ok(response);
        }

        let Some(token) = self.coordinator.ensure_fresh_token().await else {
            return Ok(response);
        };

        set_bearer(&mut replay, &token);
        info!(url = %replay.url(), "replaying request with refreshed token");
        Ok(self.http.execute(replay).await?)
    }

    /// Authenticate against a login endpoint and adopt the returned tokens.
    ///
    /// The response must carry `access_token`, `refresh_token` and
    /// `expires_in`. Any earlier permanent refresh failure is cleared.
    pub async fn login<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let response = self.post(path).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(Error::LoginRejected {
                status: status.as_u16(),
                body,
            });
        }

        let grant = parse_grant(&response.bytes().await?)?;
        let refresh_token = grant
            .refresh_token
            .ok_or_else(|| Error::MissingField("refresh_token".into()))?;

        self.coordinator.adopt(&Credentials {
            access_token: grant.access_token,
            refresh_token,
            expires_at_ms: now_ms().saturating_add(grant.expires_in.saturating_mul(1000)),
        })
    }

    /// Forget the stored credentials and reset the refresh state.
    pub fn logout(&self) -> Result<()> {
        self.coordinator.purge()
    }
}

fn build_http(config: &ClientConfig) -> Result<reqwest::Client> {
    reqwest::Url::parse(&config.base_url)
        .map_err(|e| Error::InvalidUrl(format!("{}: {}", config.base_url, e)))?;

    let mut headers = HeaderMap::new();
    for (name, value) in &config.default_headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::InvalidHeader(format!("{}: {}", name, e)))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| Error::InvalidHeader(format!("{}: {}", name, e)))?;
        headers.insert(header_name, header_value);
    }

    Ok(reqwest::Client::builder()
        .timeout(config.timeout)
        .user_agent(config.user_agent.as_str())
        .default_headers(headers)
        .build()?)
}

fn set_bearer(request: &mut Request, token: &str) {
    match HeaderValue::from_str(&format!("Bearer {}", token)) {
        Ok(mut value) => {
            value.set_sensitive(true);
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Err(_) => warn!("access token is not a valid header value, sending unauthenticated"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::token::fake_jwt;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn valid_store(access_token: &str) -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_credentials(&Credentials {
            access_token: access_token.to_string(),
            refresh_token: "R1".to_string(),
            expires_at_ms: now_ms() + 3_600_000,
        }))
    }

    fn expired_store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_credentials(&Credentials {
            access_token: "A1".to_string(),
            refresh_token: "R1".to_string(),
            expires_at_ms: now_ms() - 1_000,
        }))
    }

    fn client_for(server: &MockServer, store: Arc<MemoryStore>) -> ApiClient<MemoryStore> {
        ApiClient::new(ClientConfig::new(server.uri()), store).unwrap()
    }

    async fn mount_refresh(server: &MockServer, access_token: &str, calls: u64) {
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": access_token,
                "expires_in": 3600
            })))
            .expect(calls)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_attaches_stored_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/alerts"))
            .and(header("authorization", "Bearer A1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        mount_refresh(&server, "unused", 0).await;

        let client = client_for(&server, valid_store("A1"));
        let response = client.send(client.get("/alerts")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_default_headers_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("x-store-id", "42"))
            .and(header("accept", "application/json"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let config = ClientConfig::new(server.uri()).with_header("x-store-id", "42");
        let client = ApiClient::new(config, valid_store("A1")).unwrap();
        let response = client.send(client.get("/statistics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_auth_endpoints_carry_no_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        mount_refresh(&server, "unused", 0).await;

        // Even an expired token must not trigger a refresh here
        let client = client_for(&server, expired_store());
        let response = client.send(client.post("/auth/login")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_refreshes_expired_token_before_sending() {
        let server = MockServer::start().await;
        mount_refresh(&server, "A2", 1).await;
        Mock::given(method("GET"))
            .and(path("/documents"))
            .and(header("authorization", "Bearer A2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = expired_store();
        let client = client_for(&server, store.clone());
        let response = client.send(client.get("/documents")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            store.get(CredentialKey::AccessToken).unwrap().as_deref(),
            Some("A2")
        );
    }

    #[tokio::test]
    async fn test_refreshes_token_with_expired_claim() {
        let server = MockServer::start().await;
        mount_refresh(&server, "A2", 1).await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer A2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        // Stored expiry looks fine but the token's own claim has passed
        let stale = fake_jwt(now_ms() / 1000 - 30);
        let client = client_for(&server, valid_store(&stale));
        let response = client.send(client.get("/cash-register")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_replays_once_after_unauthorized() {
        let server = MockServer::start().await;
        mount_refresh(&server, "A2", 1).await;
        Mock::given(method("GET"))
            .and(path("/alerts"))
            .and(header("authorization", "Bearer A1"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/alerts"))
            .and(header("authorization", "Bearer A2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, valid_store("A1"));
        let response = client.send(client.get("/alerts")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "[]");
    }

    #[tokio::test]
    async fn test_replay_keeps_method_and_body() {
        let server = MockServer::start().await;
        mount_refresh(&server, "A2", 1).await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer A1"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/documents"))
            .and(header("authorization", "Bearer A2"))
            .and(wiremock::matchers::body_json(
                serde_json::json!({"title": "Z report"}),
            ))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, valid_store("A1"));
        let response = client
            .send(
                client
                    .post("/documents")
                    .json(&serde_json::json!({"title": "Z report"})),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_replays_at_most_once() {
        let server = MockServer::start().await;
        mount_refresh(&server, "A2", 1).await;
        Mock::given(method("GET"))
            .and(path("/alerts"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let client = client_for(&server, valid_store("A1"));
        let response = client.send(client.get("/alerts")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_permanent_refresh_failure_surfaces_original_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(401).set_body_string(
                r#"{"error":"invalid_grant","error_description":"Token is not active"}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/alerts"))
            .respond_with(ResponseTemplate::new(401).set_body_string("session ended"))
            .expect(2)
            .mount(&server)
            .await;

        let store = valid_store("A1");
        let client = client_for(&server, store.clone());

        let response = client.send(client.get("/alerts")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.text().await.unwrap(), "session ended");
        assert!(client.coordinator().has_permanently_failed());
        for key in CredentialKey::ALL {
            assert_eq!(store.get(key).unwrap(), None);
        }

        // No second refresh attempt
        let response = client.send(client.get("/alerts")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({
                        "access_token": "A2",
                        "refresh_token": "R2",
                        "expires_in": 600
                    }))
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer A2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(5)
            .mount(&server)
            .await;

        let store = expired_store();
        let client = client_for(&server, store.clone());
        let responses = futures::future::join_all(
            ["/alerts", "/documents", "/statistics", "/cash-register", "/alerts/3"]
                .into_iter()
                .map(|p| client.send(client.get(p))),
        )
        .await;

        for response in responses {
            assert_eq!(response.unwrap().status(), StatusCode::OK);
        }
        assert_eq!(
            store.get(CredentialKey::RefreshToken).unwrap().as_deref(),
            Some("R2")
        );
    }

    #[tokio::test]
    async fn test_unreadable_store_sends_unauthenticated() {
        struct LockedStore;

        impl CredentialStore for LockedStore {
            fn get(&self, _: CredentialKey) -> std::result::Result<Option<String>, String> {
                Err("keychain locked".into())
            }
            fn set(&self, _: CredentialKey, _: &str) -> std::result::Result<(), String> {
                Err("keychain locked".into())
            }
            fn delete(&self, _: CredentialKey) -> std::result::Result<(), String> {
                Err("keychain locked".into())
            }
        }

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(ClientConfig::new(server.uri()), Arc::new(LockedStore)).unwrap();
        let response = client.send(client.get("/alerts")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_login_adopts_tokens_and_clears_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "A5",
                "refresh_token": "R5",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer A5"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let client = client_for(&server, store.clone());

        // Nothing stored yet: the first refresh attempt fails permanently
        assert_eq!(client.coordinator().ensure_fresh_token().await, None);
        assert!(client.coordinator().has_permanently_failed());

        client
            .login(
                "/auth/login",
                &serde_json::json!({"email": "manager@store.example", "password": "pw"}),
            )
            .await
            .unwrap();

        assert!(!client.coordinator().has_permanently_failed());
        assert_eq!(
            store.get(CredentialKey::RefreshToken).unwrap().as_deref(),
            Some("R5")
        );
        let response = client.send(client.get("/alerts")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_login_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(403).set_body_string("locked out"))
            .mount(&server)
            .await;

        let client = client_for(&server, Arc::new(MemoryStore::new()));
        let err = client
            .login("/auth/login", &serde_json::json!({"email": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LoginRejected { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_logout_purges_credentials() {
        let server = MockServer::start().await;
        let store = valid_store("A1");
        let client = client_for(&server, store.clone());

        client.logout().unwrap();
        for key in CredentialKey::ALL {
            assert_eq!(store.get(key).unwrap(), None);
        }
        assert!(!client.coordinator().has_permanently_failed());
    }

    #[test]
    fn test_invalid_configuration_rejected() {
        let err = ApiClient::new(ClientConfig::new("not a url"), Arc::new(MemoryStore::new()));
        assert!(matches!(err, Err(Error::InvalidUrl(_))));

        let config = ClientConfig::new("https://api.example.com").with_header("bad header", "x");
        let err = ApiClient::new(config, Arc::new(MemoryStore::new()));
        assert!(matches!(err, Err(Error::InvalidHeader(_))));
    }
}
