//! Remote authorization.
//!
//! - `decision` - Actions, decisions and the authorization error type
//! - `client` - HTTP permission client
//! - `cache` - Per-session topic decision cache
//! - `session` - Connection identities and the session store
//! - `bridge` - Hook entry points used by the broker engine

pub mod bridge;
pub mod cache;
pub mod client;
pub mod decision;
pub mod session;

pub use bridge::AuthorizationBridge;
pub use cache::{RecordOutcome, TopicAccessCache};
pub use client::{HttpPermissionClient, PermissionService, IDENTITY_RESOURCE, KEY_HEADER, TOKEN_HEADER};
pub use decision::{AccessDecision, Action, AuthzError, CachedDecision};
pub use session::{ClientSession, ConnectionId, Credentials, Identity, SessionStore, SharedSession};
