/// Single-flight access token refresh
use crate::classify::{classify_refresh_error, FailureKind};
use crate::config::{DEFAULT_EXPIRY_BUFFER, DEFAULT_REFRESH_COOLDOWN};
use crate::endpoint::{TokenEndpoint, TokenGrant};
use crate::error::{Error, Result};
use crate::lock::RefreshLockManager;
use crate::store::{purge_store, CredentialKey, CredentialStore, Credentials};
use crate::token::{access_token_expired, now_ms};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    /// Callers parked on the in-flight refresh, in arrival order
    waiters: Vec<oneshot::Sender<Option<String>>>,
    permanently_failed: bool,
    last_attempt_at: Option<Instant>,
    last_attempt_succeeded: bool,
    /// Bumped by every reset so a refresh started before it cannot touch
    /// the state that follows it.
    generation: u64,
}

enum Role {
    Leader(u64),
    Waiter(oneshot::Receiver<Option<String>>),
    Cooldown { last_succeeded: bool },
}

/// Coordinates access token refreshes for one credential store
///
/// At most one refresh network call is outstanding per coordinator. Callers
/// arriving while it runs are queued and all receive its outcome. Once the
/// refresh token is known to be unusable, further refreshes are skipped until
/// [`reset`](Self::reset), [`purge`](Self::purge) or [`adopt`](Self::adopt).
pub struct RefreshCoordinator<S: CredentialStore> {
    store: Arc<S>,
    endpoint: Arc<dyn TokenEndpoint>,
    cooldown: Duration,
    expiry_buffer: Duration,
    locks: Option<RefreshLockManager>,
    state: Mutex<RefreshState>,
}

impl<S: CredentialStore> RefreshCoordinator<S> {
    /// Create a coordinator with the default cooldown and expiry buffer
    pub fn new(store: Arc<S>, endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self {
            store,
            endpoint,
            cooldown: DEFAULT_REFRESH_COOLDOWN,
            expiry_buffer: DEFAULT_EXPIRY_BUFFER,
            locks: None,
            state: Mutex::new(RefreshState::default()),
        }
    }

    /// Minimum spacing between refresh network calls
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_expiry_buffer(mut self, buffer: Duration) -> Self {
        self.expiry_buffer = buffer;
        self
    }

    /// Also serialise refreshes with other processes using the same store
    pub fn with_process_lock(mut self, locks: RefreshLockManager) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Whether the refresh token is known to be unusable
    pub fn has_permanently_failed(&self) -> bool {
        self.state.lock().permanently_failed
    }

    pub fn is_refreshing(&self) -> bool {
        self.state.lock().in_flight
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Obtain a freshly refreshed access token.
    ///
    /// Returns `None` when no token could be obtained; the reason has already
    /// been logged and reflected in the coordinator's state.
    pub async fn ensure_fresh_token(&self) -> Option<String> {
        let role = {
            let mut state = self.state.lock();
            if state.permanently_failed {
                debug!("refresh skipped: refresh token permanently failed");
                return None;
            }

            if state.in_flight {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(tx);
                debug!(waiters = state.waiters.len(), "joining in-flight refresh");
                Role::Waiter(rx)
            } else if state
                .last_attempt_at
                .is_some_and(|at| at.elapsed() < self.cooldown)
            {
                Role::Cooldown {
                    last_succeeded: state.last_attempt_succeeded,
                }
            } else {
                state.in_flight = true;
                state.last_attempt_at = Some(Instant::now());
                Role::Leader(state.generation)
            }
        };

        match role {
            // A dropped sender means the round was abandoned
            Role::Waiter(rx) => rx.await.unwrap_or(None),
            Role::Cooldown {
                last_succeeded: true,
            } => {
                debug!("refresh skipped: within cooldown of a successful refresh");
                self.store.get(CredentialKey::AccessToken).ok().flatten()
            }
            Role::Cooldown {
                last_succeeded: false,
            } => {
                debug!("refresh skipped: within cooldown of a failed refresh");
                None
            }
            Role::Leader(generation) => {
                let round = Round {
                    coordinator: self,
                    generation,
                    settled: false,
                };
                let outcome = self.refresh(generation).await;
                round.settle(outcome)
            }
        }
    }

    /// Return the refresh state to its initial values.
    ///
    /// Queued callers resolve to `None`. The store is left untouched.
    pub fn reset(&self) {
        let waiters = {
            let mut state = self.state.lock();
            let generation = state.generation.wrapping_add(1);
            let waiters = std::mem::take(&mut state.waiters);
            *state = RefreshState {
                generation,
                ..RefreshState::default()
            };
            waiters
        };

        debug!(released = waiters.len(), "refresh state reset");
        for waiter in waiters {
            let _ = waiter.send(None);
        }
    }

    /// Log out: delete the stored credentials and reset the refresh state.
    pub fn purge(&self) -> Result<()> {
        self.reset();
        purge_store(self.store.as_ref()).map_err(Error::StorageError)?;
        info!("credentials purged");
        Ok(())
    }

    /// Log in: store a fresh credential record and reset the refresh state.
    pub fn adopt(&self, credentials: &Credentials) -> Result<()> {
        self.reset();
        self.store
            .set(CredentialKey::RefreshToken, &credentials.refresh_token)
            .map_err(Error::StorageError)?;
        self.store
            .set(CredentialKey::AccessToken, &credentials.access_token)
            .map_err(Error::StorageError)?;
        self.store
            .set(
                CredentialKey::ExpiresAt,
                &credentials.expires_at_ms.to_string(),
            )
            .map_err(Error::StorageError)?;
        info!("credentials adopted");
        Ok(())
    }

    async fn refresh(&self, generation: u64) -> std::result::Result<String, FailureKind> {
        let _process_lock = match &self.locks {
            Some(locks) => {
                let before = self.store.get(CredentialKey::AccessToken).ok().flatten();
                match locks.acquire(&self.store.lock_key()).await {
                    Ok(lock) => {
                        if let Some(token) = self.refreshed_elsewhere(before.as_deref()) {
                            info!("access token was refreshed by another process");
                            return Ok(token);
                        }
                        Some(lock)
                    }
                    Err(e) => {
                        warn!(error = %e, "refresh lock unavailable, refreshing without it");
                        None
                    }
                }
            }
            None => None,
        };

        let refresh_token = match self.store.get(CredentialKey::RefreshToken) {
            Ok(Some(token)) if !token.is_empty() => token,
            Ok(_) => return Err(self.fail(Error::NoRefreshToken, generation)),
            Err(e) => return Err(self.fail(Error::StorageError(e), generation)),
        };

        info!("refreshing access token");
        match self.endpoint.refresh(&refresh_token).await {
            Ok(grant) => self
                .persist(grant, generation)
                .map_err(|e| self.fail(e, generation)),
            Err(e) => Err(self.fail(e, generation)),
        }
    }

    /// A token written by another process while we waited for the lock
    fn refreshed_elsewhere(&self, before: Option<&str>) -> Option<String> {
        let current = self.store.get(CredentialKey::AccessToken).ok().flatten()?;
        if before == Some(current.as_str()) {
            return None;
        }

        let expires_at = self.store.get(CredentialKey::ExpiresAt).ok().flatten();
        if access_token_expired(&current, expires_at.as_deref(), self.expiry_buffer, now_ms()) {
            return None;
        }

        Some(current)
    }

    fn persist(&self, grant: TokenGrant, generation: u64) -> Result<String> {
        // Held through the writes so a concurrent reset cannot slip in
        // between the generation check and the store.
        let state = self.state.lock();
        if state.generation != generation {
            return Err(Error::StorageError(
                "credentials were reset during the refresh".into(),
            ));
        }

        let expires_at = now_ms().saturating_add(grant.expires_in.saturating_mul(1000));

        // A rotated refresh token invalidates the old one server-side, so it
        // must be durable before anything else can pick up the new access
        // token.
        if let Some(rotated) = &grant.refresh_token {
            self.store
                .set(CredentialKey::RefreshToken, rotated)
                .map_err(Error::StorageError)?;
            debug!("refresh token rotated");
        }
        self.store
            .set(CredentialKey::AccessToken, &grant.access_token)
            .map_err(Error::StorageError)?;
        self.store
            .set(CredentialKey::ExpiresAt, &expires_at.to_string())
            .map_err(Error::StorageError)?;
        drop(state);

        info!(expires_in = grant.expires_in, "access token refreshed");
        Ok(grant.access_token)
    }

    fn fail(&self, error: Error, generation: u64) -> FailureKind {
        let kind = classify_refresh_error(&error);
        let state = self.state.lock();
        if state.generation != generation {
            // Credentials stored after the reset belong to a new session
            debug!(error = %error, "stale refresh failed after reset");
            return kind;
        }

        match kind {
            FailureKind::Permanent => {
                warn!(error = %error, "refresh token rejected, purging credentials");
                if let Err(e) = purge_store(self.store.as_ref()) {
                    warn!(error = %e, "failed to purge credentials");
                }
            }
            FailureKind::Transient => {
                warn!(error = %error, "refresh failed, credentials kept for retry");
            }
        }
        drop(state);
        kind
    }
}

/// One leader's refresh round; releases its waiters even if the leader's
/// future is dropped mid-flight.
struct Round<'a, S: CredentialStore> {
    coordinator: &'a RefreshCoordinator<S>,
    generation: u64,
    settled: bool,
}

impl<S: CredentialStore> Round<'_, S> {
    fn settle(mut self, outcome: std::result::Result<String, FailureKind>) -> Option<String> {
        self.settled = true;
        let token = outcome.as_ref().ok().cloned();
        self.finish(Some(outcome));
        token
    }

    fn finish(&self, outcome: Option<std::result::Result<String, FailureKind>>) {
        let (waiters, token) = {
            let mut state = self.coordinator.state.lock();
            if state.generation != self.generation {
                // A reset already released this round's waiters
                return;
            }

            state.in_flight = false;
            if outcome.is_some() {
                // Cooldown counts from completion, not from the start
                state.last_attempt_at = Some(Instant::now());
            }
            match &outcome {
                Some(Ok(_)) => {
                    state.permanently_failed = false;
                    state.last_attempt_succeeded = true;
                }
                Some(Err(FailureKind::Permanent)) => {
                    state.permanently_failed = true;
                    state.last_attempt_succeeded = false;
                }
                Some(Err(FailureKind::Transient)) | None => {
                    state.last_attempt_succeeded = false;
                }
            }

            let token = outcome.and_then(|o| o.ok());
            (std::mem::take(&mut state.waiters), token)
        };

        for waiter in waiters {
            let _ = waiter.send(token.clone());
        }
    }
}

impl<S: CredentialStore> Drop for Round<'_, S> {
    fn drop(&mut self) {
        if !self.settled {
            debug!("refresh abandoned, releasing waiters");
            self.finish(None);
        }
    }
}
