//! Auth-gated query enablement.
//!
//! SYSTEM CONTEXT
//! ==============
//! Every data fetch asks the same question before it runs: is it allowed to
//! go out right now? The answer depends only on the current `SessionState`
//! and the caller's flags, so everything here is a pure function evaluated
//! fresh at each dispatch.
//!
//! FAIL-CLOSED
//! ===========
//! A request that requires auth is refused while the session is loading,
//! even if a user from a previous resolution is still attached. Loading and
//! anonymous collapse into the same `false`; UI that needs to tell them apart
//! reads `AuthGuard::phase` instead.

#[cfg(test)]
#[path = "policy_test.rs"]
mod policy_test;

use serde::Serialize;
use tracing::debug;

use crate::query::{QueryExecutor, QueryRequest, QueryResult};
use crate::session::SessionState;

/// True iff the session carries a user.
#[must_use]
pub fn is_authenticated(session: &SessionState) -> bool {
    session.user.is_some()
}

/// Read-only view of auth readiness for gating UI affordances.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AuthGuard {
    pub can_make_request: bool,
    pub is_auth_ready: bool,
    pub is_authenticated: bool,
}

/// Three-way auth status for rendering (spinner vs. login prompt vs. content).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPhase {
    Pending,
    Anonymous,
    Authenticated,
}

impl AuthGuard {
    /// Pending wins over everything else, so a refresh in progress never
    /// reads as signed in.
    #[must_use]
    pub fn phase(&self) -> AuthPhase {
        if !self.is_auth_ready {
            AuthPhase::Pending
        } else if self.is_authenticated {
            AuthPhase::Authenticated
        } else {
            AuthPhase::Anonymous
        }
    }
}

#[must_use]
pub fn auth_guard(session: &SessionState) -> AuthGuard {
    let is_authenticated = is_authenticated(session);
    let is_auth_ready = !session.is_loading;
    AuthGuard { can_make_request: is_authenticated && is_auth_ready, is_auth_ready, is_authenticated }
}

/// Whether `request` may be dispatched against `session`.
///
/// Public requests (`require_auth == false`) depend only on the caller's
/// `enabled` flag.
#[must_use]
pub fn compute_enabled<T>(session: &SessionState, request: &QueryRequest<T>) -> bool {
    enabled_for(session, request.require_auth, request.enabled)
}

/// `compute_enabled` over the bare caller flags.
#[must_use]
pub fn enabled_for(session: &SessionState, require_auth: bool, enabled: bool) -> bool {
    if require_auth { auth_guard(session).can_make_request && enabled } else { enabled }
}

/// Hand `request` to `executor` with its enablement computed against
/// `session`. No I/O happens here; a gated-off request reaches the executor
/// as disabled and comes back `Idle`.
///
/// The options are tagged with the session's user id so a caching executor
/// never serves one principal's data to another.
pub async fn guarded_fetch<T, E>(session: &SessionState, request: QueryRequest<T>, executor: &E) -> QueryResult<T>
where
    T: Clone + Send + Sync + 'static,
    E: QueryExecutor,
{
    let enabled = compute_enabled(session, &request);
    if !enabled {
        debug!(
            key = %request.key,
            require_auth = request.require_auth,
            caller_enabled = request.enabled,
            session_loading = session.is_loading,
            "query gated off"
        );
    }
    let principal = session.user.as_ref().map(|user| user.id.clone());
    executor.execute(request.into_options(enabled).for_principal(principal)).await
}
