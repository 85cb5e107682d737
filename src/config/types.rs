//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub access_control: AccessControlConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
    /// Bounds greeting, authentication and request parsing together
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub resolve_timeout: Duration,
    /// Relay closes after this long with no data in either direction
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// How long BIND waits for the peer to connect
    #[serde(with = "humantime_serde")]
    pub bind_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    pub buffer_size: usize,
    /// Local address for BIND listeners and UDP relay sockets
    pub bind_ip: Option<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 1080)),
            max_connections: 1024,
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            resolve_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            bind_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(30),
            buffer_size: 8192,
            bind_ip: None,
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Method names in server preference order: "none", "userpass"
    pub methods: Vec<String>,
    pub users: Vec<UserConfig>,
}

impl AuthConfig {
    /// Configured methods, or the default when none are listed
    pub fn effective_methods(&self) -> Vec<String> {
        if !self.methods.is_empty() {
            self.methods.clone()
        } else if self.users.is_empty() {
            vec![AUTH_METHOD_NONE.to_string()]
        } else {
            vec![AUTH_METHOD_USERPASS.to_string()]
        }
    }
}

pub const AUTH_METHOD_NONE: &str = "none";
pub const AUTH_METHOD_USERPASS: &str = "userpass";

/// User configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Access control configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AccessControlConfig {
    pub enabled: bool,
    pub default_policy: String,
    /// Commands clients may issue: "connect", "bind", "udp_associate"
    pub commands: Vec<String>,
    pub rules: Vec<AccessRule>,
}

impl Default for AccessControlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_policy: "allow".to_string(),
            commands: vec![
                "connect".to_string(),
                "bind".to_string(),
                "udp_associate".to_string(),
            ],
            rules: vec![],
        }
    }
}

/// Access control rule
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccessRule {
    /// Destination: IP, CIDR, domain, `*.domain`, `.suffix` or `*`
    pub pattern: String,
    pub action: String,
    pub ports: Option<Vec<u16>>,
    /// Client networks the rule applies to; empty means any
    #[serde(default)]
    pub sources: Vec<String>,
    /// Authenticated users the rule applies to; empty means any
    #[serde(default)]
    pub users: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
