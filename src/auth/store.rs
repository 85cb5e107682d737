//! Credential stores

use std::collections::HashMap;

use async_trait::async_trait;
use subtle::{Choice, ConstantTimeEq};

use crate::config::UserConfig;

/// Longest password RFC 1929 can carry
const MAX_PASSWORD_LEN: usize = 255;

/// Compare two passwords without leaking their lengths or the position of
/// the first difference. Both sides are padded to the RFC 1929 maximum;
/// anything longer never matches.
fn password_eq(stored: &[u8], given: &[u8]) -> Choice {
    let mut lhs = [0u8; MAX_PASSWORD_LEN];
    let mut rhs = [0u8; MAX_PASSWORD_LEN];
    let stored_len = stored.len().min(MAX_PASSWORD_LEN);
    let given_len = given.len().min(MAX_PASSWORD_LEN);
    lhs[..stored_len].copy_from_slice(&stored[..stored_len]);
    rhs[..given_len].copy_from_slice(&given[..given_len]);

    let fits = Choice::from(
        (stored.len() <= MAX_PASSWORD_LEN && given.len() <= MAX_PASSWORD_LEN) as u8,
    );
    let same_len = (stored.len() as u64).ct_eq(&(given.len() as u64));
    lhs[..].ct_eq(&rhs[..]) & same_len & fits
}

/// Verifies a username/password pair.
///
/// Implementations must answer a missing user and a wrong password the same
/// way, and should not leak which one happened through timing.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn verify(&self, username: &str, password: &[u8]) -> bool;
}

/// In-memory credentials loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    users: HashMap<String, Vec<u8>>,
}

impl StaticCredentials {
    /// Compared against when the username is unknown
    const DECOY: &'static [u8] = b"socksproxy-decoy-password-of-reasonable-length";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, username: impl Into<String>, password: impl AsRef<[u8]>) -> Self {
        self.add_user(username, password);
        self
    }

    pub fn add_user(&mut self, username: impl Into<String>, password: impl AsRef<[u8]>) {
        self.users
            .insert(username.into(), password.as_ref().to_vec());
    }

    /// Load users from configuration, skipping disabled entries
    pub fn from_config(users: &[UserConfig]) -> Self {
        let mut store = Self::new();
        for user in users.iter().filter(|u| u.enabled) {
            store.add_user(user.username.clone(), &user.password);
        }
        store
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl CredentialStore for StaticCredentials {
    async fn verify(&self, username: &str, password: &[u8]) -> bool {
        match self.users.get(username) {
            Some(stored) => password_eq(stored, password).into(),
            None => {
                let _ = password_eq(Self::DECOY, password);
                false
            }
        }
    }
}
