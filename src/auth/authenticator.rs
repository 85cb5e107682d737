//! Authentication method implementations

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::{AuthContext, CredentialStore};
use crate::protocol::constants::*;
use crate::protocol::{AuthMethod, Result, SocksError, SocksStream};

/// One authentication method's sub-negotiation.
///
/// `negotiate` runs right after the server has announced `method()` to the
/// client and owns the stream until it returns.
#[async_trait]
pub trait Authenticator: Send + Sync {
    fn method(&self) -> AuthMethod;

    async fn negotiate(&self, stream: &mut dyn SocksStream) -> Result<AuthContext>;
}

/// Method 0x00. The method selection reply is the whole exchange.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuthAuthenticator;

#[async_trait]
impl Authenticator for NoAuthAuthenticator {
    fn method(&self) -> AuthMethod {
        AuthMethod::NO_AUTH
    }

    async fn negotiate(&self, _stream: &mut dyn SocksStream) -> Result<AuthContext> {
        Ok(AuthContext::new(AuthMethod::NO_AUTH))
    }
}

/// Method 0x02, RFC 1929.
///
/// ```text
/// +----+------+----------+------+----------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +----+------+----------+------+----------+
/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
/// +----+------+----------+------+----------+
/// ```
pub struct UserPassAuthenticator {
    store: Arc<dyn CredentialStore>,
}

impl UserPassAuthenticator {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    async fn send_status(stream: &mut dyn SocksStream, success: bool) -> Result<()> {
        let status = if success {
            SOCKS5_USERPASS_SUCCESS
        } else {
            SOCKS5_USERPASS_FAILURE
        };
        stream.write_all(&[SOCKS5_USERPASS_VERSION, status]).await?;
        stream.flush().await?;
        Ok(())
    }
}

async fn read_field(stream: &mut dyn SocksStream) -> Result<Vec<u8>> {
    let len = stream.read_u8().await? as usize;
    let mut field = vec![0u8; len];
    stream.read_exact(&mut field).await?;
    Ok(field)
}

#[async_trait]
impl Authenticator for UserPassAuthenticator {
    fn method(&self) -> AuthMethod {
        AuthMethod::USER_PASS
    }

    async fn negotiate(&self, stream: &mut dyn SocksStream) -> Result<AuthContext> {
        let version = stream.read_u8().await?;
        if version != SOCKS5_USERPASS_VERSION {
            Self::send_status(stream, false).await?;
            return Err(SocksError::BadAuthVersion(version));
        }

        let username = read_field(stream).await?;
        let password = read_field(stream).await?;

        // A non UTF-8 name cannot match any stored user.
        let username = String::from_utf8(username).unwrap_or_default();
        if username.is_empty() || !self.store.verify(&username, &password).await {
            Self::send_status(stream, false).await?;
            return Err(SocksError::AuthFailed);
        }

        Self::send_status(stream, true).await?;
        debug!("User '{}' authenticated", username);
        Ok(AuthContext::new(AuthMethod::USER_PASS).with_username(username))
    }
}

/// Registered authenticators in server preference order.
#[derive(Clone, Default)]
pub struct Authenticators {
    order: Vec<AuthMethod>,
    by_method: HashMap<AuthMethod, Arc<dyn Authenticator>>,
}

impl Authenticators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.register(Arc::new(authenticator));
        self
    }

    /// Add an authenticator at the lowest preference. Re-registering a method
    /// replaces its implementation but keeps its position.
    pub fn register(&mut self, authenticator: Arc<dyn Authenticator>) {
        let method = authenticator.method();
        if self.by_method.insert(method, authenticator).is_none() {
            self.order.push(method);
        }
    }

    /// First method in server preference order the client also offered
    pub fn select(&self, offered: &[AuthMethod]) -> Option<Arc<dyn Authenticator>> {
        self.order
            .iter()
            .find(|method| offered.contains(method))
            .and_then(|method| self.by_method.get(method))
            .cloned()
    }

    pub fn methods(&self) -> &[AuthMethod] {
        &self.order
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl fmt::Debug for Authenticators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticators")
            .field("order", &self.order)
            .finish()
    }
}
