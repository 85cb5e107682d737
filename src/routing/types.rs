//! Routing Types

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::protocol::Socks5Request;

/// A request whose destination has been resolved to a socket address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRequest {
    /// The request as the client sent it, domain names included
    pub request: Socks5Request,
    pub client_addr: SocketAddr,
    pub dest: SocketAddr,
}

impl fmt::Display for ResolvedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let request = &self.request;
        if request.addr.ip().is_some() {
            write!(f, "{} {}", request.command, self.dest)
        } else {
            write!(
                f,
                "{} {}:{} ({})",
                request.command, request.addr, request.port, self.dest
            )
        }
    }
}

/// Access control policy, also used as a rule's action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Allow,
    Block,
}

impl FromStr for Policy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "allow" => Ok(Policy::Allow),
            "block" => Ok(Policy::Block),
            other => anyhow::bail!("policy must be 'allow' or 'block', got '{}'", other),
        }
    }
}
