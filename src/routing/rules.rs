//! Rule sets deciding whether a request may proceed

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;

use super::ResolvedRequest;
use crate::auth::AuthContext;
use crate::protocol::Command;

/// Decides whether an authenticated client may run a request.
///
/// Consulted once per request, after the destination has been resolved and
/// before anything is dialed or bound.
#[async_trait]
pub trait RuleSet: Send + Sync {
    async fn allow(&self, ctx: &AuthContext, request: &ResolvedRequest) -> bool;
}

/// Permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermitAll;

#[async_trait]
impl RuleSet for PermitAll {
    async fn allow(&self, _ctx: &AuthContext, _request: &ResolvedRequest) -> bool {
        true
    }
}

/// Permits commands individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermitCommand {
    pub connect: bool,
    pub bind: bool,
    pub udp_associate: bool,
}

impl PermitCommand {
    pub fn all() -> Self {
        Self {
            connect: true,
            bind: true,
            udp_associate: true,
        }
    }

    pub fn none() -> Self {
        Self {
            connect: false,
            bind: false,
            udp_associate: false,
        }
    }

    /// Build from names as written in configuration
    pub fn from_names(names: &[String]) -> crate::Result<Self> {
        let mut permit = Self::none();
        for name in names {
            match name.to_lowercase().as_str() {
                "connect" => permit.connect = true,
                "bind" => permit.bind = true,
                "udp_associate" | "udp" => permit.udp_associate = true,
                other => bail!(
                    "unknown command '{}', expected connect, bind or udp_associate",
                    other
                ),
            }
        }
        Ok(permit)
    }

    pub fn permits(&self, command: Command) -> bool {
        match command {
            Command::Connect => self.connect,
            Command::Bind => self.bind,
            Command::UdpAssociate => self.udp_associate,
        }
    }
}

#[async_trait]
impl RuleSet for PermitCommand {
    async fn allow(&self, _ctx: &AuthContext, request: &ResolvedRequest) -> bool {
        self.permits(request.request.command)
    }
}

/// Permits a request only when every member does.
#[derive(Clone, Default)]
pub struct AllOf {
    rules: Vec<Arc<dyn RuleSet>>,
}

impl AllOf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, rules: impl RuleSet + 'static) -> Self {
        self.rules.push(Arc::new(rules));
        self
    }
}

#[async_trait]
impl RuleSet for AllOf {
    async fn allow(&self, ctx: &AuthContext, request: &ResolvedRequest) -> bool {
        for rules in &self.rules {
            if !rules.allow(ctx, request).await {
                return false;
            }
        }
        true
    }
}
