//! Keygate - authenticated HTTP client with single-flight token refresh
//!
//! This library keeps a bearer access token valid for every request an
//! application makes against its backend API.
//!
//! # Features
//!
//! - Proactive refresh when the stored expiry (minus a safety buffer) or the
//!   token's own JWT `exp` claim has passed
//! - Reactive refresh and a single replay after a 401
//! - At most one refresh in flight; concurrent callers share its outcome
//! - Refresh token rotation, persisted before the new access token
//! - Permanent vs transient refresh failure classification; credentials are
//!   purged only when the refresh token itself is unusable
//! - Pluggable credential storage (memory, file, OS keychain)
//! - Optional cross-process refresh lock
//!
//! # Example
//!
//! ```no_run
//! use keygate::prelude::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> keygate::error::Result<()> {
//! let store = Arc::new(SecureStore::new("store-ops"));
//! let client = ApiClient::new(ClientConfig::new("https://api.example.com/v1"), store)?;
//!
//! client
//!     .login("/auth/login", &serde_json::json!({"email": "a@b.c", "password": "pw"}))
//!     .await?;
//!
//! let alerts = client.send(client.get("/alerts")).await?;
//! if alerts.status() == reqwest::StatusCode::UNAUTHORIZED {
//!     // Refresh token is gone: show the login screen
//! }
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod lock;
pub mod refresh;
pub mod store;
pub mod token;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::classify::{classify_refresh_error, FailureKind};
    pub use crate::client::ApiClient;
    pub use crate::config::ClientConfig;
    pub use crate::endpoint::{HttpTokenEndpoint, TokenEndpoint, TokenGrant};
    pub use crate::error::{Error, Result};
    pub use crate::lock::RefreshLockManager;
    pub use crate::refresh::RefreshCoordinator;
    pub use crate::store::{
        CredentialKey, CredentialStore, Credentials, FileStore, MemoryStore, SecureStore,
    };
}
