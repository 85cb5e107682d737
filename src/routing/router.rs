//! Connection Router

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use super::{DnsResolver, PermitAll, ResolvedRequest, Resolver, RuleSet};
use crate::auth::AuthContext;
use crate::protocol::{Result, Socks5Request, SocksError, TargetAddr};

/// Resolves a request's destination and checks it against the rule set.
#[derive(Clone)]
pub struct Router {
    resolver: Arc<dyn Resolver>,
    rules: Arc<dyn RuleSet>,
}

impl Router {
    pub fn new(resolver: Arc<dyn Resolver>, rules: Arc<dyn RuleSet>) -> Self {
        Self { resolver, rules }
    }

    /// Make a routing decision for the given request
    ///
    /// Resolution failures become `Resolve` (host unreachable), denials
    /// become `NotAllowed`.
    pub async fn route(
        &self,
        ctx: &AuthContext,
        request: Socks5Request,
        client_addr: SocketAddr,
    ) -> Result<ResolvedRequest> {
        let dest = self.resolve(&request.addr, request.port).await?;
        let resolved = ResolvedRequest {
            request,
            client_addr,
            dest,
        };

        if !self.rules.allow(ctx, &resolved).await {
            return Err(SocksError::NotAllowed(resolved.to_string()));
        }

        debug!("Routing {}", resolved);
        Ok(resolved)
    }

    async fn resolve(&self, addr: &TargetAddr, port: u16) -> Result<SocketAddr> {
        match addr {
            TargetAddr::Ipv4(ip) => Ok(SocketAddr::new((*ip).into(), port)),
            TargetAddr::Ipv6(ip) => Ok(SocketAddr::new((*ip).into(), port)),
            TargetAddr::Domain(host) => {
                self.resolver
                    .resolve(host, port)
                    .await
                    .map_err(|source| SocksError::Resolve {
                        host: host.clone(),
                        source,
                    })
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(Arc::new(DnsResolver::default()), Arc::new(PermitAll))
    }
}
