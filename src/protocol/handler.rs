//! SOCKS5 Protocol Handler

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::codec;
use super::constants::*;
use super::error::{Result, SocksError};
use super::types::{AuthMethod, Socks5Request, Socks5Response};
use super::SocksStream;
use crate::auth::{AuthContext, Authenticator, Authenticators};

/// Where a connection is in the handshake.
///
/// Phases only move forward; `Rejected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingGreeting,
    MethodSelected(AuthMethod),
    Authenticating(AuthMethod),
    Authenticated(AuthMethod),
    /// A request frame was consumed and a reply is owed.
    Requested,
    Replied,
    Rejected,
}

/// SOCKS5 protocol handler for one client connection
pub struct Socks5Handler<S> {
    stream: S,
    state: HandshakeState,
}

impl<S: SocksStream> Socks5Handler<S> {
    /// Create a new SOCKS5 handler for the given stream
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            state: HandshakeState::AwaitingGreeting,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Run method negotiation and the selected authenticator's sub-negotiation.
    ///
    /// May be called once per connection.
    pub async fn authenticate(&mut self, authenticators: &Authenticators) -> Result<AuthContext> {
        let authenticator = self.negotiate_method(authenticators).await?;
        let method = authenticator.method();
        self.state = HandshakeState::Authenticating(method);

        match authenticator.negotiate(&mut self.stream).await {
            Ok(ctx) => {
                debug!("Authenticated with {}", method);
                self.state = HandshakeState::Authenticated(method);
                Ok(ctx)
            }
            Err(e) => {
                self.state = HandshakeState::Rejected;
                Err(e)
            }
        }
    }

    /// Read the greeting and answer with the server's preferred common method.
    async fn negotiate_method(
        &mut self,
        authenticators: &Authenticators,
    ) -> Result<Arc<dyn Authenticator>> {
        if self.state != HandshakeState::AwaitingGreeting {
            return Err(SocksError::OutOfOrder("greeting already processed"));
        }
        // Anything but a selected method leaves the connection unusable.
        self.state = HandshakeState::Rejected;

        let offered = self.read_greeting().await?;
        debug!("Client offered methods {:?}", offered);

        match authenticators.select(&offered) {
            Some(authenticator) => {
                let method = authenticator.method();
                self.write_frame(&[SOCKS5_VERSION, method.code()]).await?;
                self.state = HandshakeState::MethodSelected(method);
                Ok(authenticator)
            }
            None => {
                self.write_frame(&[SOCKS5_VERSION, AuthMethod::NO_ACCEPTABLE.code()])
                    .await?;
                Err(SocksError::NoSupportedAuth)
            }
        }
    }

    /// Read the client greeting message
    async fn read_greeting(&mut self) -> Result<Vec<AuthMethod>> {
        let mut header = [0u8; 2];
        self.stream.read_exact(&mut header).await?;

        let [version, n_methods] = header;
        if version != SOCKS5_VERSION {
            return Err(SocksError::BadVersion(version));
        }
        if n_methods == 0 {
            return Err(SocksError::NoMethodsOffered);
        }

        let mut methods = vec![0u8; n_methods as usize];
        self.stream.read_exact(&mut methods).await?;

        Ok(methods.into_iter().map(AuthMethod::from_code).collect())
    }

    /// Read the request frame. Only valid once authentication has succeeded.
    ///
    /// Whatever the outcome, a reply is owed afterwards unless the error is a
    /// transport failure.
    pub async fn read_request(&mut self) -> Result<Socks5Request> {
        if !matches!(self.state, HandshakeState::Authenticated(_)) {
            return Err(SocksError::OutOfOrder("request before authentication"));
        }
        self.state = HandshakeState::Requested;

        let request = codec::read_request(&mut self.stream).await?;
        debug!("Request {} {}:{}", request.command, request.addr, request.port);
        Ok(request)
    }

    /// Send a reply frame. BIND sends two, everything else one.
    pub async fn send_reply(&mut self, response: &Socks5Response) -> Result<()> {
        if !matches!(
            self.state,
            HandshakeState::Requested | HandshakeState::Replied
        ) {
            return Err(SocksError::OutOfOrder("reply without a request"));
        }

        let frame = codec::encode_reply(response)?;
        self.write_frame(&frame).await?;
        self.state = HandshakeState::Replied;
        Ok(())
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.stream.write_all(frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Get the underlying stream for the relay phase
    pub fn into_stream(self) -> S {
        self.stream
    }
}
