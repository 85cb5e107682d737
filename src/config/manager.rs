//! Configuration Manager

use super::types::{AUTH_METHOD_NONE, AUTH_METHOD_USERPASS};
use super::Config;
use crate::routing::acl::AclRuleSet;
use crate::routing::rules::PermitCommand;
use crate::Result;
use anyhow::{bail, Context};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }
}

fn parse_duration_var(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("Invalid {}: {}", key, value))
}

impl Config {
    /// Override fields from `SOCKS5_*` variables returned by `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind_addr) = lookup("SOCKS5_BIND_ADDR") {
            self.server.bind_addr = bind_addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid SOCKS5_BIND_ADDR: {}", bind_addr))?;
        }

        if let Some(max_conn) = lookup("SOCKS5_MAX_CONNECTIONS") {
            self.server.max_connections = max_conn
                .parse::<usize>()
                .with_context(|| format!("Invalid SOCKS5_MAX_CONNECTIONS: {}", max_conn))?;
        }

        if let Some(timeout) = lookup("SOCKS5_HANDSHAKE_TIMEOUT") {
            self.server.handshake_timeout = parse_duration_var("SOCKS5_HANDSHAKE_TIMEOUT", &timeout)?;
        }

        if let Some(timeout) = lookup("SOCKS5_CONNECT_TIMEOUT") {
            self.server.connect_timeout = parse_duration_var("SOCKS5_CONNECT_TIMEOUT", &timeout)?;
        }

        if let Some(timeout) = lookup("SOCKS5_IDLE_TIMEOUT") {
            self.server.idle_timeout = parse_duration_var("SOCKS5_IDLE_TIMEOUT", &timeout)?;
        }

        if let Some(methods) = lookup("SOCKS5_AUTH_METHODS") {
            self.auth.methods = methods
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(log_level) = lookup("SOCKS5_LOG_LEVEL") {
            self.logging.level = log_level;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_auth_config()
            .with_context(|| "Authentication configuration validation failed")?;

        self.validate_access_control_config()
            .with_context(|| "Access control configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        let server = &self.server;

        if server.max_connections == 0 {
            bail!("max_connections must be greater than 0");
        }

        let timeouts = [
            ("handshake_timeout", server.handshake_timeout),
            ("connect_timeout", server.connect_timeout),
            ("resolve_timeout", server.resolve_timeout),
            ("idle_timeout", server.idle_timeout),
            ("bind_timeout", server.bind_timeout),
            ("shutdown_timeout", server.shutdown_timeout),
        ];
        for (name, timeout) in timeouts {
            if timeout.is_zero() {
                bail!("{} must be greater than 0", name);
            }
        }

        if server.buffer_size < 1024 {
            bail!("buffer_size must be at least 1024 bytes");
        }

        if server.buffer_size > 1048576 {
            bail!("buffer_size cannot exceed 1MB");
        }

        Ok(())
    }

    fn validate_auth_config(&self) -> Result<()> {
        let methods = self.auth.effective_methods();
        let mut seen = HashSet::new();
        for method in &methods {
            if ![AUTH_METHOD_NONE, AUTH_METHOD_USERPASS].contains(&method.as_str()) {
                bail!("auth.methods entries must be 'none' or 'userpass', got '{}'", method);
            }
            if !seen.insert(method.as_str()) {
                bail!("auth.methods lists '{}' more than once", method);
            }
        }

        if seen.contains(AUTH_METHOD_USERPASS) && !self.auth.users.iter().any(|u| u.enabled) {
            bail!("userpass authentication requires at least one enabled user");
        }

        for (i, user) in self.auth.users.iter().enumerate() {
            if user.username.is_empty() {
                bail!("User {} has empty username", i);
            }

            if user.username.len() > 255 {
                bail!("User {} username exceeds 255 bytes", i);
            }

            if user.password.is_empty() {
                bail!("User {} has empty password", i);
            }

            if user.password.len() > 255 {
                bail!("User {} password exceeds 255 bytes", i);
            }
        }

        Ok(())
    }

    fn validate_access_control_config(&self) -> Result<()> {
        // Building the rule sets performs the same parsing the server will.
        AclRuleSet::from_config(&self.access_control)?;
        PermitCommand::from_names(&self.access_control.commands)?;

        for (i, rule) in self.access_control.rules.iter().enumerate() {
            if let Some(ports) = &rule.ports {
                if ports.contains(&0) {
                    bail!("Access rule {} contains invalid port 0", i);
                }
            }
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        bind: Option<&str>,
        port: Option<u16>,
        max_connections: Option<usize>,
        no_auth: bool,
        connect_timeout: Option<Duration>,
        buffer_size: Option<usize>,
    ) -> Result<()> {
        if let Some(bind_str) = bind {
            self.server.bind_addr = bind_str
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid bind address: {}", bind_str))?;
            tracing::info!("CLI override: bind address set to {}", self.server.bind_addr);
        }

        if let Some(port) = port {
            self.server.bind_addr.set_port(port);
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(max_conn) = max_connections {
            self.server.max_connections = max_conn;
            tracing::info!("CLI override: max connections set to {}", max_conn);
        }

        if no_auth {
            self.auth.methods = vec![AUTH_METHOD_NONE.to_string()];
            tracing::info!("CLI override: authentication disabled");
        }

        if let Some(timeout) = connect_timeout {
            self.server.connect_timeout = timeout;
            tracing::info!(
                "CLI override: connect timeout set to {}",
                humantime::format_duration(timeout)
            );
        }

        if let Some(buffer_size) = buffer_size {
            self.server.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }

        Ok(())
    }
}
