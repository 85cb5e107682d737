//! Shared per-server services

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use tracing::debug;

use super::{ConnectionObserver, TracingObserver};
use crate::auth::{Authenticators, NoAuthAuthenticator, StaticCredentials, UserPassAuthenticator};
use crate::config::{Config, AUTH_METHOD_NONE, AUTH_METHOD_USERPASS};
use crate::relay::Dispatcher;
use crate::routing::{AclRuleSet, AllOf, DnsResolver, PermitAll, PermitCommand, Router, RuleSet};
use crate::Result;

/// Everything a connection task needs, shared read-only across connections.
#[derive(Clone)]
pub struct ProxyContext {
    pub authenticators: Authenticators,
    pub router: Router,
    pub dispatcher: Dispatcher,
    pub observer: Arc<dyn ConnectionObserver>,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub buffer_size: usize,
}

impl ProxyContext {
    /// No authentication, permit everything, system DNS.
    pub fn new() -> Self {
        Self {
            authenticators: Authenticators::new().with(NoAuthAuthenticator),
            router: Router::default(),
            dispatcher: Dispatcher::default(),
            observer: Arc::new(TracingObserver),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            buffer_size: 8192,
        }
    }

    /// Build the services described by a validated configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let server = &config.server;

        let mut authenticators = Authenticators::new();
        for method in config.auth.effective_methods() {
            match method.as_str() {
                AUTH_METHOD_NONE => authenticators.register(Arc::new(NoAuthAuthenticator)),
                AUTH_METHOD_USERPASS => {
                    let store = StaticCredentials::from_config(&config.auth.users);
                    debug!("Loaded {} credential(s)", store.len());
                    authenticators.register(Arc::new(UserPassAuthenticator::new(Arc::new(store))));
                }
                other => bail!("Unknown authentication method: {}", other),
            }
        }

        let rules: Arc<dyn RuleSet> = if config.access_control.enabled {
            let commands = PermitCommand::from_names(&config.access_control.commands)
                .context("Invalid access_control.commands")?;
            let acl = AclRuleSet::from_config(&config.access_control)
                .context("Invalid access_control rules")?;
            Arc::new(AllOf::new().with(commands).with(acl))
        } else {
            Arc::new(PermitAll)
        };

        let resolver = Arc::new(DnsResolver::new(server.resolve_timeout));

        Ok(Self {
            authenticators,
            router: Router::new(resolver, rules),
            dispatcher: Dispatcher::from_config(server),
            observer: Arc::new(TracingObserver),
            handshake_timeout: server.handshake_timeout,
            idle_timeout: server.idle_timeout,
            buffer_size: server.buffer_size,
        })
    }

    pub fn with_authenticators(mut self, authenticators: Authenticators) -> Self {
        self.authenticators = authenticators;
        self
    }

    pub fn with_router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

impl Default for ProxyContext {
    fn default() -> Self {
        Self::new()
    }
}
