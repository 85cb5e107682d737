//! Access Control List Implementation

use std::net::IpAddr;

use anyhow::Context;
use async_trait::async_trait;
use ipnet::IpNet;
use tracing::debug;

use super::rules::RuleSet;
use super::types::{Policy, ResolvedRequest};
use crate::auth::AuthContext;
use crate::config::{AccessControlConfig, AccessRule};

/// What a rule's `pattern` matches against the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Any,
    Ip(IpAddr),
    Net(IpNet),
    /// Exact domain, compared case-insensitively
    Domain(String),
    /// `*.example.com`: the domain itself and every subdomain
    Wildcard(String),
    /// `.example.com`: subdomains only
    Suffix(String),
}

impl Pattern {
    pub fn parse(pattern: &str) -> crate::Result<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            anyhow::bail!("empty pattern");
        }
        if pattern == "*" {
            return Ok(Pattern::Any);
        }
        if let Ok(ip) = pattern.parse::<IpAddr>() {
            return Ok(Pattern::Ip(ip));
        }
        if pattern.contains('/') {
            let net = pattern
                .parse::<IpNet>()
                .with_context(|| format!("invalid CIDR pattern '{}'", pattern))?;
            return Ok(Pattern::Net(net.trunc()));
        }

        let domain = pattern.to_ascii_lowercase();
        Ok(if let Some(base) = domain.strip_prefix("*.") {
            Pattern::Wildcard(base.to_string())
        } else if domain.starts_with('.') {
            Pattern::Suffix(domain)
        } else {
            Pattern::Domain(domain)
        })
    }

    /// `domain` is the name the client asked for, if any; `ip` is where it resolved.
    pub fn matches(&self, domain: Option<&str>, ip: IpAddr) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Ip(pattern_ip) => *pattern_ip == ip,
            Pattern::Net(net) => net.contains(&ip),
            Pattern::Domain(pattern) => domain.map_or(false, |d| d.eq_ignore_ascii_case(pattern)),
            Pattern::Wildcard(base) => domain.map_or(false, |d| {
                let d = d.to_ascii_lowercase();
                d == *base
                    || d.strip_suffix(base.as_str())
                        .map_or(false, |prefix| prefix.ends_with('.'))
            }),
            Pattern::Suffix(suffix) => {
                domain.map_or(false, |d| d.to_ascii_lowercase().ends_with(suffix.as_str()))
            }
        }
    }
}

/// Access control rule for pattern matching
#[derive(Debug, Clone)]
pub struct AccessControlRule {
    pub pattern: Pattern,
    pub action: Policy,
    pub ports: Option<Vec<u16>>,
    pub sources: Vec<IpNet>,
    pub users: Vec<String>,
}

impl AccessControlRule {
    pub fn from_config(rule: &AccessRule) -> crate::Result<Self> {
        let sources = rule
            .sources
            .iter()
            .map(|source| parse_source(source))
            .collect::<crate::Result<Vec<_>>>()?;

        Ok(Self {
            pattern: Pattern::parse(&rule.pattern)?,
            action: rule.action.parse()?,
            ports: rule.ports.clone(),
            sources,
            users: rule.users.clone(),
        })
    }

    /// Check if the rule applies to the given request
    pub fn matches(&self, ctx: &AuthContext, request: &ResolvedRequest) -> bool {
        if let Some(ports) = &self.ports {
            if !ports.contains(&request.dest.port()) {
                return false;
            }
        }

        if !self.sources.is_empty()
            && !self
                .sources
                .iter()
                .any(|net| net.contains(&request.client_addr.ip()))
        {
            return false;
        }

        if !self.users.is_empty() {
            match ctx.username() {
                Some(user) if self.users.iter().any(|u| u == user) => {}
                _ => return false,
            }
        }

        self.pattern
            .matches(request.request.addr.domain(), request.dest.ip())
    }
}

/// A bare address is a single-host network.
fn parse_source(source: &str) -> crate::Result<IpNet> {
    if let Ok(ip) = source.parse::<IpAddr>() {
        return Ok(IpNet::from(ip));
    }
    source
        .parse::<IpNet>()
        .with_context(|| format!("invalid source network '{}'", source))
}

/// Ordered first-match rule list with a fallback policy.
#[derive(Debug, Clone)]
pub struct AclRuleSet {
    pub default_policy: Policy,
    pub rules: Vec<AccessControlRule>,
}

impl AclRuleSet {
    /// Create a new ACL with default policy
    pub fn new(default_policy: Policy) -> Self {
        Self {
            default_policy,
            rules: Vec::new(),
        }
    }

    pub fn from_config(config: &AccessControlConfig) -> crate::Result<Self> {
        let mut acl = Self::new(config.default_policy.parse()?);
        for (i, rule) in config.rules.iter().enumerate() {
            let rule = AccessControlRule::from_config(rule)
                .with_context(|| format!("access rule {}", i))?;
            acl.add_rule(rule);
        }
        Ok(acl)
    }

    /// Add a rule to the ACL
    pub fn add_rule(&mut self, rule: AccessControlRule) {
        self.rules.push(rule);
    }

    /// Evaluate access for a request
    pub fn evaluate(&self, ctx: &AuthContext, request: &ResolvedRequest) -> Policy {
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.matches(ctx, request) {
                debug!("{} matched access rule {} ({:?})", request, i, rule.action);
                return rule.action;
            }
        }
        self.default_policy
    }
}

#[async_trait]
impl RuleSet for AclRuleSet {
    async fn allow(&self, ctx: &AuthContext, request: &ResolvedRequest) -> bool {
        self.evaluate(ctx, request) == Policy::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AuthMethod, Command, Socks5Request, TargetAddr};

    fn rule(pattern: &str, action: &str) -> AccessRule {
        AccessRule {
            pattern: pattern.to_string(),
            action: action.to_string(),
            ports: None,
            sources: vec![],
            users: vec![],
        }
    }

    fn acl(default_policy: &str, rules: Vec<AccessRule>) -> AclRuleSet {
        AclRuleSet::from_config(&AccessControlConfig {
            enabled: true,
            default_policy: default_policy.to_string(),
            commands: vec![],
            rules,
        })
        .unwrap()
    }

    fn to_domain(domain: &str, dest: &str) -> ResolvedRequest {
        let dest: std::net::SocketAddr = dest.parse().unwrap();
        ResolvedRequest {
            request: Socks5Request::new(
                Command::Connect,
                TargetAddr::Domain(domain.to_string()),
                dest.port(),
            ),
            client_addr: "10.0.0.1:40000".parse().unwrap(),
            dest,
        }
    }

    fn to_ip(dest: &str) -> ResolvedRequest {
        let dest: std::net::SocketAddr = dest.parse().unwrap();
        ResolvedRequest {
            request: Socks5Request::new(Command::Connect, TargetAddr::from_ip(dest.ip()), dest.port()),
            client_addr: "10.0.0.1:40000".parse().unwrap(),
            dest,
        }
    }

    fn anonymous() -> AuthContext {
        AuthContext::new(AuthMethod::NO_AUTH)
    }

    #[test]
    fn test_cidr_block() {
        let acl = acl("allow", vec![rule("192.168.1.0/24", "block")]);
        let ctx = anonymous();

        assert_eq!(acl.evaluate(&ctx, &to_ip("192.168.1.100:80")), Policy::Block);
        assert_eq!(acl.evaluate(&ctx, &to_ip("192.168.2.1:80")), Policy::Allow);
        // Resolved address is checked for domain requests too.
        assert_eq!(
            acl.evaluate(&ctx, &to_domain("intranet.local", "192.168.1.7:443")),
            Policy::Block
        );
    }

    #[test]
    fn test_port_restrictions() {
        let mut blocked_ports = rule("*", "block");
        blocked_ports.ports = Some(vec![22, 23]);
        let acl = acl("allow", vec![blocked_ports]);
        let ctx = anonymous();

        assert_eq!(acl.evaluate(&ctx, &to_domain("example.com", "93.184.216.34:22")), Policy::Block);
        assert_eq!(acl.evaluate(&ctx, &to_domain("example.com", "93.184.216.34:80")), Policy::Allow);
    }

    #[test]
    fn test_domain_patterns() {
        let acl = acl(
            "allow",
            vec![rule("*.malicious.com", "block"), rule(".tracker.net", "block")],
        );
        let ctx = anonymous();
        let ip = "1.2.3.4:80";

        assert_eq!(acl.evaluate(&ctx, &to_domain("sub.malicious.com", ip)), Policy::Block);
        assert_eq!(acl.evaluate(&ctx, &to_domain("MALICIOUS.com", ip)), Policy::Block);
        assert_eq!(acl.evaluate(&ctx, &to_domain("notmalicious.com", ip)), Policy::Allow);
        assert_eq!(acl.evaluate(&ctx, &to_domain("ads.tracker.net", ip)), Policy::Block);
        assert_eq!(acl.evaluate(&ctx, &to_domain("tracker.net", ip)), Policy::Allow);
        assert_eq!(acl.evaluate(&ctx, &to_domain("example.com", ip)), Policy::Allow);
    }

    #[test]
    fn test_first_match_wins() {
        let acl = acl(
            "block",
            vec![rule("internal.example.com", "allow"), rule("*.example.com", "block")],
        );
        let ctx = anonymous();
        let ip = "10.1.1.1:443";

        assert_eq!(acl.evaluate(&ctx, &to_domain("internal.example.com", ip)), Policy::Allow);
        assert_eq!(acl.evaluate(&ctx, &to_domain("www.example.com", ip)), Policy::Block);
        assert_eq!(acl.evaluate(&ctx, &to_domain("other.org", ip)), Policy::Block);
    }

    #[test]
    fn test_source_and_user_scoping() {
        let mut admin_only = rule("10.0.0.0/8", "allow");
        admin_only.users = vec!["admin".to_string()];
        admin_only.sources = vec!["10.0.0.1".to_string()];
        let acl = acl("block", vec![admin_only]);

        let admin = AuthContext::new(AuthMethod::USER_PASS).with_username("admin");
        let guest = AuthContext::new(AuthMethod::USER_PASS).with_username("guest");
        let request = to_ip("10.2.3.4:80");

        assert_eq!(acl.evaluate(&admin, &request), Policy::Allow);
        assert_eq!(acl.evaluate(&guest, &request), Policy::Block);
        assert_eq!(acl.evaluate(&anonymous(), &request), Policy::Block);

        let mut elsewhere = request.clone();
        elsewhere.client_addr = "10.0.0.2:40000".parse().unwrap();
        assert_eq!(acl.evaluate(&admin, &elsewhere), Policy::Block);
    }

    #[test]
    fn test_invalid_rules_rejected() {
        let config = AccessControlConfig {
            enabled: true,
            default_policy: "allow".to_string(),
            commands: vec![],
            rules: vec![rule("10.0.0.0/40", "block")],
        };
        assert!(AclRuleSet::from_config(&config).is_err());

        let config = AccessControlConfig {
            rules: vec![rule("*", "redirect")],
            ..config
        };
        assert!(AclRuleSet::from_config(&config).is_err());
    }
}
