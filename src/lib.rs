//! Auth-gated data fetching for the quest client.
//!
//! SYSTEM CONTEXT
//! ==============
//! Every network read in the client goes through the same gate: a query that
//! needs a signed-in user must not fire until the session has resolved and
//! carries one. `policy` holds that rule as pure functions, `provider` owns
//! the session and publishes changes, `query` is the cached executor the
//! gate hands its decision to, and `api` talks to the HTTP backend.

pub mod api;
pub mod config;
pub mod policy;
pub mod provider;
pub mod query;
pub mod session;

pub use config::ClientConfig;
pub use policy::{AuthGuard, AuthPhase, auth_guard, compute_enabled, guarded_fetch, is_authenticated};
pub use provider::{SessionProvider, SessionSource};
pub use query::{QueryClient, QueryExecutor, QueryKey, QueryRequest, QueryResult, QueryStatus};
pub use session::{SessionSnapshot, SessionState, UserRef};
