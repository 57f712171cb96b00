//! Shared state every session works against.
//!
//! There are no process-wide singletons: the link and the authentication
//! state live here and are passed explicitly to each component.

use crate::link::PhysicalLink;

/// Authentication state supplied by an external provider.
///
/// The core never decides whether a user is authenticated; it only reacts
/// to this flag and stamps the token onto resource traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthState {
    authenticated: bool,
    token: String,
}

impl AuthState {
    /// Authenticated with `token`.
    pub fn authenticated(token: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            token: token.into(),
        }
    }

    /// Whether resource sessions may attach.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Token stamped onto every resource message. Empty when unauthenticated.
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// The link plus the authentication state.
#[derive(Debug, Default)]
pub struct Context {
    /// The physical link all channels share.
    pub link: PhysicalLink,
    /// Current authentication state.
    pub auth: AuthState,
}

impl Context {
    /// Fresh context: disconnected link, unauthenticated.
    pub fn new() -> Self {
        Self::default()
    }
}
