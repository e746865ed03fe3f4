/// Client configuration
use std::time::Duration;

/// Default request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Access tokens are treated as expired this long before their stored expiry
pub const DEFAULT_EXPIRY_BUFFER: Duration = Duration::from_secs(60);

/// Minimum spacing between two refresh network calls
pub const DEFAULT_REFRESH_COOLDOWN: Duration = Duration::from_secs(1);

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Prefix for every request path, e.g. `https://api.example.com/v1`
    pub base_url: String,
    pub timeout: Duration,
    /// Headers sent with every request
    pub default_headers: Vec<(String, String)>,
    pub user_agent: String,
    /// Path of the refresh endpoint, relative to `base_url`
    pub refresh_path: String,
    /// Paths that never carry a bearer token and are never retried
    pub auth_paths: Vec<String>,
    pub expiry_buffer: Duration,
    pub refresh_cooldown: Duration,
}

impl ClientConfig {
    /// Create a configuration with defaults for everything but the base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: DEFAULT_TIMEOUT,
            default_headers: vec![("accept".to_string(), "application/json".to_string())],
            user_agent: format!("keygate/{}", env!("CARGO_PKG_VERSION")),
            refresh_path: "/auth/refresh".to_string(),
            auth_paths: vec![
                "/auth/login".to_string(),
                "/auth/register".to_string(),
                "/auth/refresh".to_string(),
            ],
            expiry_buffer: DEFAULT_EXPIRY_BUFFER,
            refresh_cooldown: DEFAULT_REFRESH_COOLDOWN,
        }
    }

    /// Build from `KEYGATE_*` environment variables on top of `base_url`.
    ///
    /// - `KEYGATE_BASE_URL` overrides `base_url`
    /// - `KEYGATE_TIMEOUT_SECS` overrides the request timeout
    /// - `KEYGATE_REFRESH_PATH` overrides the refresh path
    pub fn from_env(base_url: impl Into<String>) -> Self {
        let mut config = Self::new(base_url);

        if let Ok(url) = std::env::var("KEYGATE_BASE_URL") {
            config.base_url = url;
        }
        if let Some(secs) = std::env::var("KEYGATE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            config.timeout = Duration::from_secs(secs);
        }
        if let Ok(path) = std::env::var("KEYGATE_REFRESH_PATH") {
            config.auth_paths.retain(|p| p != &config.refresh_path);
            config.auth_paths.push(path.clone());
            config.refresh_path = path;
        }

        config
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    /// Change the refresh endpoint; it stays an authentication path
    pub fn with_refresh_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.auth_paths.retain(|p| p != &self.refresh_path);
        self.auth_paths.push(path.clone());
        self.refresh_path = path;
        self
    }

    pub fn with_auth_path(mut self, path: impl Into<String>) -> Self {
        self.auth_paths.push(path.into());
        self
    }

    pub fn with_expiry_buffer(mut self, buffer: Duration) -> Self {
        self.expiry_buffer = buffer;
        self
    }

    pub fn with_refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.refresh_cooldown = cooldown;
        self
    }

    /// Absolute URL for a path relative to `base_url`
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Whether a URL path belongs to the login/register/refresh family
    pub fn is_auth_path(&self, path: &str) -> bool {
        let path = path.trim_end_matches('/');
        self.auth_paths
            .iter()
            .any(|auth| path.ends_with(auth.trim_end_matches('/')))
    }
}
