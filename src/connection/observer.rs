//! Connection lifecycle hooks

use std::net::SocketAddr;

use tracing::{info, warn};

use crate::protocol::SocksError;
use crate::relay::ConnectionStats;
use crate::routing::ResolvedRequest;

/// Notified of connection events worth auditing.
///
/// Every method has an empty default so implementations pick what they need.
/// Calls happen on the connection's own task and must not block.
pub trait ConnectionObserver: Send + Sync {
    fn on_auth_failure(&self, _client_addr: SocketAddr, _error: &SocksError) {}

    fn on_rule_denied(&self, _client_addr: SocketAddr, _error: &SocksError) {}

    fn on_dispatch_failure(&self, _request: &ResolvedRequest, _error: &SocksError) {}

    fn on_connection_closed(&self, _stats: &ConnectionStats, _user: Option<&str>) {}
}

/// Emits every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ConnectionObserver for TracingObserver {
    fn on_auth_failure(&self, client_addr: SocketAddr, error: &SocksError) {
        warn!(client_addr = %client_addr, error = %error, "Authentication failed");
    }

    fn on_rule_denied(&self, client_addr: SocketAddr, error: &SocksError) {
        warn!(client_addr = %client_addr, error = %error, "Request denied by rule set");
    }

    fn on_dispatch_failure(&self, request: &ResolvedRequest, error: &SocksError) {
        warn!(
            client_addr = %request.client_addr,
            command = %request.request.command,
            dest = %request.dest,
            error = %error,
            "Dispatch failed"
        );
    }

    fn on_connection_closed(&self, stats: &ConnectionStats, user: Option<&str>) {
        info!(
            session_id = %stats.session_id,
            client_addr = %stats.client_addr,
            target_addr = %stats.target_addr,
            duration_ms = stats.duration.as_millis() as u64,
            bytes_up = stats.bytes_up,
            bytes_down = stats.bytes_down,
            total_bytes = stats.bytes_up + stats.bytes_down,
            user_id = user,
            "Relay session completed"
        );
    }
}
