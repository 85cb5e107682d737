//! Authentication Types

use std::collections::HashMap;

use crate::protocol::AuthMethod;

/// Result of a successful authentication, carried for the rest of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub method: AuthMethod,
    pub payload: HashMap<String, String>,
}

impl AuthContext {
    /// Payload key holding the authenticated identity
    pub const USERNAME: &'static str = "Username";

    pub fn new(method: AuthMethod) -> Self {
        Self {
            method,
            payload: HashMap::new(),
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.payload.insert(Self::USERNAME.to_string(), username.into());
        self
    }

    /// Authenticated user, if the method establishes one
    pub fn username(&self) -> Option<&str> {
        self.payload.get(Self::USERNAME).map(String::as_str)
    }
}
