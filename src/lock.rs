/// Cross-process locking for refresh coordination
use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Serialises refreshes between processes sharing one credential store.
///
/// Single-use refresh tokens make two processes refreshing at once fatal:
/// whichever call lands second presents a consumed token. Holding this lock
/// around the refresh lets the second process observe the first one's result
/// instead.
#[derive(Debug, Clone)]
pub struct RefreshLockManager {
    lock_dir: PathBuf,
}

impl RefreshLockManager {
    /// Create a lock manager with a custom lock directory
    pub fn new(lock_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&lock_dir)?;
        Ok(Self { lock_dir })
    }

    /// Create a lock manager for a specific application
    ///
    /// Uses `$XDG_RUNTIME_DIR/keygate-locks/<app>` when available, the temp
    /// directory otherwise.
    pub fn for_app(app_name: &str) -> Result<Self> {
        let mut lock_dir = match std::env::var("XDG_RUNTIME_DIR") {
            Ok(runtime_dir) => PathBuf::from(runtime_dir).join("keygate-locks"),
            Err(_) => std::env::temp_dir().join("keygate-locks"),
        };
        lock_dir.push(app_name);
        Self::new(lock_dir)
    }

    /// Acquire the exclusive lock for `key`, waiting for other holders.
    ///
    /// The blocking `flock` runs on tokio's blocking pool so the calling task
    /// only suspends. The lock is released when the returned guard drops.
    pub async fn acquire(&self, key: &str) -> Result<RefreshLock> {
        let path = self.lock_path(key);
        tokio::task::spawn_blocking(move || RefreshLock::acquire_blocking(path))
            .await
            .map_err(|e| Error::IoError(std::io::Error::other(e)))?
    }

    /// Try to acquire the lock without waiting
    ///
    /// Returns `None` if another process holds it.
    pub fn try_acquire(&self, key: &str) -> Result<Option<RefreshLock>> {
        let path = self.lock_path(key);
        let file = open_lock_file(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(RefreshLock {
                file: Some(file),
                path,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        let safe_key = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        self.lock_dir.join(format!("{}.lock", safe_key))
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

/// RAII guard for a refresh lock
pub struct RefreshLock {
    file: Option<File>,
    path: PathBuf,
}

impl RefreshLock {
    fn acquire_blocking(path: PathBuf) -> Result<Self> {
        let file = open_lock_file(&path)?;
        file.lock_exclusive()?;
        tracing::debug!(path = %path.display(), "acquired refresh lock");
        Ok(Self {
            file: Some(file),
            path,
        })
    }

    /// Get the path to the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RefreshLock {
    fn drop(&mut self) {
        // The file itself stays: removing it would let a waiter lock an
        // unlinked inode while a newcomer locks a fresh one.
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("keygate_locks_{}", rand::random::<u32>()))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = temp_dir();
        let manager = RefreshLockManager::new(dir.clone()).unwrap();

        let lock = manager.acquire("store").await.unwrap();
        assert!(lock.path().exists());
        drop(lock);

        let again = manager.acquire("store").await.unwrap();
        drop(again);

        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_try_acquire_while_held() {
        let dir = temp_dir();
        let manager = RefreshLockManager::new(dir.clone()).unwrap();

        let held = manager.try_acquire("store").unwrap();
        assert!(held.is_some());
        assert!(manager.try_acquire("store").unwrap().is_none());

        drop(held);
        assert!(manager.try_acquire("store").unwrap().is_some());

        fs::remove_dir_all(dir).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_acquire_waits_for_holder() {
        let dir = temp_dir();
        let manager = Arc::new(RefreshLockManager::new(dir.clone()).unwrap());
        let released = Arc::new(AtomicBool::new(false));

        let held = manager.acquire("store").await.unwrap();

        let waiter = {
            let manager = manager.clone();
            let released = released.clone();
            tokio::spawn(async move {
                let _lock = manager.acquire("store").await.unwrap();
                released.load(Ordering::SeqCst)
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        released.store(true, Ordering::SeqCst);
        drop(held);

        assert!(waiter.await.unwrap(), "waiter ran before the holder released");

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_key_sanitization() {
        let dir = temp_dir();
        let manager = RefreshLockManager::new(dir.clone()).unwrap();

        let lock = manager
            .try_acquire("/home/me/.local/share/app")
            .unwrap()
            .unwrap();
        assert!(lock
            .path()
            .to_str()
            .unwrap()
            .ends_with("_home_me_.local_share_app.lock"));

        fs::remove_dir_all(dir).ok();
    }
}
