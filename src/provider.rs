//! Session ownership and change notification.
//!
//! DESIGN
//! ======
//! `SessionProvider` is the only writer of session state. It publishes each
//! change on a `tokio::sync::watch` channel, so subscribers see every
//! transition and a read always returns the latest value. `guarded_fetch`
//! reads the channel at the moment of dispatch; once a sign-out has been
//! published, no auth-required query can observe the old session.
//!
//! ERROR HANDLING
//! ==============
//! A failed refresh resolves to anonymous before the error is returned, so
//! the session never stays pending and never keeps a user it could not
//! confirm.

#[cfg(test)]
#[path = "provider_test.rs"]
mod provider_test;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::ApiError;
use crate::policy::{self, AuthGuard};
use crate::query::{QueryExecutor, QueryRequest, QueryResult};
use crate::session::{SessionSnapshot, SessionState, UserRef};

/// Resolves the current principal from wherever sessions live.
#[async_trait::async_trait]
pub trait SessionSource: Send + Sync {
    /// `Ok(None)` means no signed-in user; errors are transport or protocol
    /// failures.
    async fn fetch_session(&self) -> Result<Option<UserRef>, ApiError>;
}

#[derive(Clone)]
pub struct SessionProvider {
    tx: Arc<watch::Sender<SessionSnapshot>>,
}

impl SessionProvider {
    /// New provider in the pending state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionSnapshot::pending());
        Self { tx: Arc::new(tx) }
    }

    /// Latest session as the policy sees it.
    #[must_use]
    pub fn snapshot(&self) -> SessionState {
        self.tx.borrow().state()
    }

    #[must_use]
    pub fn guard(&self) -> AuthGuard {
        policy::auth_guard(&self.snapshot())
    }

    /// Receiver notified on every session change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.tx.subscribe()
    }

    /// Mark the session as being re-resolved. Any current user stays attached.
    ///
    /// Returns the generation the refresh started from; pass it to
    /// [`SessionProvider::resolve_if_current`] so a result that lost a race
    /// with `sign_out` or another resolution is dropped.
    pub fn begin_refresh(&self) -> u64 {
        let mut generation = 0;
        self.tx.send_modify(|snapshot| {
            snapshot.is_pending = true;
            generation = snapshot.generation;
        });
        generation
    }

    /// Finish resolution with `user` (or anonymous when `None`).
    pub fn resolve(&self, user: Option<UserRef>) {
        log_resolution(user.as_ref());
        let state = resolved_state(user);
        self.tx.send_modify(|snapshot| {
            snapshot.data = Some(state);
            snapshot.is_pending = false;
            snapshot.generation += 1;
        });
    }

    /// Apply `user` only if no resolution or sign-out happened since
    /// `generation`. Returns whether the result was applied.
    pub fn resolve_if_current(&self, generation: u64, user: Option<UserRef>) -> bool {
        self.tx.send_if_modified(move |snapshot| {
            if snapshot.generation != generation {
                debug!(
                    started = generation,
                    current = snapshot.generation,
                    "dropping stale session resolution"
                );
                return false;
            }
            log_resolution(user.as_ref());
            snapshot.data = Some(resolved_state(user));
            snapshot.is_pending = false;
            snapshot.generation += 1;
            true
        })
    }

    pub fn sign_out(&self) {
        info!("session signed out");
        self.tx.send_modify(|snapshot| {
            snapshot.data = None;
            snapshot.is_pending = false;
            snapshot.generation += 1;
        });
    }

    /// Re-resolve the session from `source`.
    ///
    /// A sign-out (or any other resolution) that lands while the source is
    /// being awaited wins; the late result is discarded.
    ///
    /// # Errors
    ///
    /// Returns the source error after the session has been resolved anonymous.
    pub async fn refresh<S>(&self, source: &S) -> Result<AuthGuard, ApiError>
    where
        S: SessionSource + ?Sized,
    {
        let generation = self.begin_refresh();
        match source.fetch_session().await {
            Ok(user) => {
                self.resolve_if_current(generation, user);
                Ok(self.guard())
            }
            Err(err) => {
                warn!(error = %err, "session refresh failed; resolving anonymous");
                self.resolve_if_current(generation, None);
                Err(err)
            }
        }
    }

    /// Dispatch `request` gated on the session as it stands right now.
    ///
    /// The executor can re-check enablement against the live session between
    /// retries, so a sign-out during backoff stops further attempts.
    pub async fn guarded_fetch<T, E>(&self, request: QueryRequest<T>, executor: &E) -> QueryResult<T>
    where
        T: Clone + Send + Sync + 'static,
        E: QueryExecutor,
    {
        let session = self.snapshot();
        let tx = Arc::clone(&self.tx);
        let (require_auth, enabled) = (request.require_auth, request.enabled);
        let request = request.with_recheck(move || {
            policy::enabled_for(&tx.borrow().state(), require_auth, enabled)
        });
        policy::guarded_fetch(&session, request, executor).await
    }
}

fn resolved_state(user: Option<UserRef>) -> SessionState {
    user.map_or_else(SessionState::anonymous, SessionState::authenticated)
}

fn log_resolution(user: Option<&UserRef>) {
    match user {
        Some(user) => info!(user_id = %user.id, "session resolved"),
        None => info!("session resolved anonymous"),
    }
}

impl Default for SessionProvider {
    fn default() -> Self {
        Self::new()
    }
}
