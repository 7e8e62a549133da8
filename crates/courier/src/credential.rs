//! Credential type and the session store boundary.
//!
//! The session store is the only owner of the current [`Credential`]. Every
//! component that needs the token re-reads it through [`SessionStore`] at the
//! moment of use instead of keeping its own copy.

use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Access/refresh token pair plus its type.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
}

impl Credential {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        token_type: impl Into<String>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            token_type: token_type.into(),
        }
    }

    /// `Authorization` value for ordinary calls: `<token_type> <access_token>`.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    /// `Authorization` value for the refresh call: `<token_type> <refresh_token>`.
    pub fn refresh_authorization(&self) -> String {
        format!("{} {}", self.token_type, self.refresh_token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Process-wide session state as seen by the request layer.
pub trait SessionStore: Send + Sync {
    fn current_credential(&self) -> Option<Credential>;

    fn set_credential(&self, credential: Credential);

    /// Forget the credential (logout or failed refresh).
    fn clear(&self);

    fn is_authenticated(&self) -> bool {
        self.current_credential().is_some()
    }
}

/// In-memory session store.
#[derive(Default)]
pub struct MemorySessionStore {
    credential: RwLock<Option<Credential>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            credential: RwLock::new(Some(credential)),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn current_credential(&self) -> Option<Credential> {
        self.credential.read().clone()
    }

    fn set_credential(&self, credential: Credential) {
        *self.credential.write() = Some(credential);
    }

    fn clear(&self) {
        self.credential.write().take();
    }

    fn is_authenticated(&self) -> bool {
        self.credential.read().is_some()
    }
}
