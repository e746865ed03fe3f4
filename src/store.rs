/// Credential storage with pluggable backends
use keyring::Entry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Keys of the persisted credential record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKey {
    AccessToken,
    RefreshToken,
    ExpiresAt,
}

impl CredentialKey {
    /// Every key, in the order a successful refresh writes them.
    pub const ALL: [CredentialKey; 3] = [
        CredentialKey::RefreshToken,
        CredentialKey::AccessToken,
        CredentialKey::ExpiresAt,
    ];

    /// Name under which the value is persisted
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKey::AccessToken => "access_token",
            CredentialKey::RefreshToken => "refresh_token",
            CredentialKey::ExpiresAt => "token_expires_at",
        }
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A complete credential record, as handed over by a login
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute expiry of the access token in epoch milliseconds
    pub expires_at_ms: u64,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("expires_at_ms", &self.expires_at_ms)
            .finish_non_exhaustive()
    }
}

/// Storage interface for the credential record
///
/// Implementations must be durable across restarts (except [`MemoryStore`])
/// and private to the current user.
pub trait CredentialStore: Send + Sync {
    /// Get a value by key
    fn get(&self, key: CredentialKey) -> Result<Option<String>, String>;

    /// Save a value
    fn set(&self, key: CredentialKey, value: &str) -> Result<(), String>;

    /// Delete a value; deleting an absent key succeeds
    fn delete(&self, key: CredentialKey) -> Result<(), String>;

    /// Identifier used to name cross-process refresh locks
    fn lock_key(&self) -> String {
        "credentials".to_string()
    }
}

/// Delete every credential key, attempting all of them even if one fails.
pub fn purge_store<S: CredentialStore + ?Sized>(store: &S) -> Result<(), String> {
    let mut failures = Vec::new();
    for key in CredentialKey::ALL {
        if let Err(e) = store.delete(key) {
            failures.push(format!("{}: {}", key, e));
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; "))
    }
}

/// In-memory storage implementation
///
/// Thread-safe and ephemeral. Suitable for testing and short-lived tools.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: Arc<RwLock<HashMap<CredentialKey, String>>>,
}

impl MemoryStore {
    /// Create a new memory store instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a memory store pre-populated with a credential record
    pub fn with_credentials(credentials: &Credentials) -> Self {
        let store = Self::new();
        {
            let mut values = store.values.write();
            values.insert(
                CredentialKey::RefreshToken,
                credentials.refresh_token.clone(),
            );
            values.insert(CredentialKey::AccessToken, credentials.access_token.clone());
            values.insert(
                CredentialKey::ExpiresAt,
                credentials.expires_at_ms.to_string(),
            );
        }
        store
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, key: CredentialKey) -> Result<Option<String>, String> {
        Ok(self.values.read().get(&key).cloned())
    }

    fn set(&self, key: CredentialKey, value: &str) -> Result<(), String> {
        self.values.write().insert(key, value.to_string());
        Ok(())
    }

    fn delete(&self, key: CredentialKey) -> Result<(), String> {
        self.values.write().remove(&key);
        Ok(())
    }
}

/// File-based storage implementation using XDG conventions
///
/// The whole record lives in a single `credentials.json` file, readable by
/// the owning user only on Unix.
#[derive(Debug)]
pub struct FileStore {
    base_path: PathBuf,
    // Serialises read-modify-write cycles within this process
    write_lock: parking_lot::Mutex<()>,
}

impl FileStore {
    /// Create a new file store for an application
    ///
    /// Respects XDG Base Directory Specification on Unix systems:
    /// - Checks $XDG_DATA_HOME environment variable first
    /// - Falls back to the platform data directory
    ///
    /// Stores credentials in <data_dir>/<app_name>/credentials.json
    ///
    /// # Example
    ///
    /// ```no_run
    /// use keygate::store::FileStore;
    ///
    /// let store = FileStore::new("my-store-app").unwrap();
    /// ```
    pub fn new(app_name: &str) -> Result<Self, String> {
        let base_dir = if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
            PathBuf::from(xdg_data)
        } else {
            dirs::data_dir().ok_or_else(|| "Could not determine data directory".to_string())?
        };

        Self::with_path(base_dir.join(app_name))
    }

    /// Create a file store rooted at a custom directory
    pub fn with_path(path: PathBuf) -> Result<Self, String> {
        fs::create_dir_all(&path)
            .map_err(|e| format!("Failed to create storage directory: {}", e))?;

        Ok(Self {
            base_path: path,
            write_lock: parking_lot::Mutex::new(()),
        })
    }

    /// Directory holding the credentials file
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn credentials_path(&self) -> PathBuf {
        self.base_path.join("credentials.json")
    }

    fn load(&self) -> Result<HashMap<String, String>, String> {
        let path = self.credentials_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read credentials file: {}", e))?;

        serde_json::from_str(&content).map_err(|e| format!("Failed to parse credentials: {}", e))
    }

    fn save(&self, values: &HashMap<String, String>) -> Result<(), String> {
        let content = serde_json::to_string_pretty(values)
            .map_err(|e| format!("Failed to serialize credentials: {}", e))?;

        let staging = self.staging_path();
        let result = write_private(&staging, content.as_bytes()).and_then(|()| {
            fs::rename(&staging, self.credentials_path())
                .map_err(|e| format!("Failed to replace credentials file: {}", e))
        });
        if result.is_err() {
            let _ = fs::remove_file(&staging);
        }
        result
    }

    /// Staging file unique to this process and write
    fn staging_path(&self) -> PathBuf {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        self.base_path
            .join(format!("credentials.json.{}.{}.tmp", std::process::id(), n))
    }
}

/// Write a new file that is never readable by other users, not even briefly
fn write_private(path: &Path, bytes: &[u8]) -> Result<(), String> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .map_err(|e| format!("Failed to create credentials file: {}", e))?;
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .map_err(|e| format!("Failed to write credentials file: {}", e))
}

impl CredentialStore for FileStore {
    fn get(&self, key: CredentialKey) -> Result<Option<String>, String> {
        Ok(self.load()?.remove(key.as_str()))
    }

    fn set(&self, key: CredentialKey, value: &str) -> Result<(), String> {
        let _guard = self.write_lock.lock();
        let mut values = self.load()?;
        values.insert(key.as_str().to_string(), value.to_string());
        self.save(&values)
    }

    fn delete(&self, key: CredentialKey) -> Result<(), String> {
        let _guard = self.write_lock.lock();
        let mut values = self.load()?;
        if values.remove(key.as_str()).is_some() {
            self.save(&values)?;
        }
        Ok(())
    }

    fn lock_key(&self) -> String {
        self.base_path.to_string_lossy().into_owned()
    }
}

/// Secure storage using the OS credential manager
///
/// - macOS: Keychain
/// - Windows: Credential Manager
/// - Linux: Secret Service API (libsecret)
///
/// Each credential key is a separate keyring entry under the service
/// `keygate-<app_name>`.
#[derive(Debug, Clone)]
pub struct SecureStore {
    app_name: String,
}

impl SecureStore {
    /// Create a new secure store instance
    ///
    /// # Example
    ///
    /// ```
    /// use keygate::store::SecureStore;
    ///
    /// let store = SecureStore::new("my-store-app");
    /// // Tokens stored in OS keychain/credential manager
    /// ```
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
        }
    }

    fn service(&self) -> String {
        format!("keygate-{}", self.app_name)
    }

    fn entry(&self, key: CredentialKey) -> Result<Entry, String> {
        Entry::new(&self.service(), key.as_str())
            .map_err(|e| format!("Failed to create keyring entry: {}", e))
    }
}

impl CredentialStore for SecureStore {
    fn get(&self, key: CredentialKey) -> Result<Option<String>, String> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(format!("Failed to retrieve {} from keyring: {}", key, e)),
        }
    }

    fn set(&self, key: CredentialKey, value: &str) -> Result<(), String> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| format!("Failed to save {} to keyring: {}", key, e))
    }

    fn delete(&self, key: CredentialKey) -> Result<(), String> {
        match self.entry(key)?.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()), // Already deleted
            Err(e) => Err(format!("Failed to delete {} from keyring: {}", key, e)),
        }
    }

    fn lock_key(&self) -> String {
        self.service()
    }
}
