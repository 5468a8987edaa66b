//! Session state for the current client instance.
//!
//! DESIGN
//! ======
//! `SessionState` is handed to the policy functions as a plain value instead
//! of being read from ambient context. `SessionSnapshot` is the provider-side
//! view (`data` plus a pending flag); absent data folds into an anonymous
//! session, never into an error.

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;

use serde::{Deserialize, Serialize};

/// The authenticated principal, as returned in the `user` object of the
/// session endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    /// Server-assigned user identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Avatar image URL, if set.
    #[serde(default)]
    pub image: Option<String>,
}

/// Auth state consumed by the enablement policy.
///
/// `user` present means an authenticated principal. `is_loading` true means
/// the session has not been determined yet.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionState {
    pub user: Option<UserRef>,
    pub is_loading: bool,
}

impl SessionState {
    /// Session resolution has not completed.
    #[must_use]
    pub fn pending() -> Self {
        Self { user: None, is_loading: true }
    }

    /// Resolved with no principal.
    #[must_use]
    pub fn anonymous() -> Self {
        Self { user: None, is_loading: false }
    }

    /// Resolved with `user` signed in.
    #[must_use]
    pub fn authenticated(user: UserRef) -> Self {
        Self { user: Some(user), is_loading: false }
    }
}

/// Raw session view published by the provider.
///
/// `generation` increases on every resolution or sign-out. A refresh only
/// applies its result if the generation it started from is still current.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub data: Option<SessionState>,
    pub is_pending: bool,
    pub generation: u64,
}

impl SessionSnapshot {
    /// Initial snapshot before the first resolution.
    #[must_use]
    pub fn pending() -> Self {
        Self { data: None, is_pending: true, generation: 0 }
    }

    /// Fold the snapshot into the state the policy evaluates.
    ///
    /// Missing data reads as anonymous. The session counts as loading when
    /// either the provider is pending or the data itself is still loading.
    #[must_use]
    pub fn state(&self) -> SessionState {
        let data = self.data.clone().unwrap_or_default();
        SessionState { user: data.user, is_loading: self.is_pending || data.is_loading }
    }
}
