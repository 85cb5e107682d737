//! socksproxy
//!
//! A SOCKS5 proxy server (RFC 1928) with username/password authentication
//! (RFC 1929), pluggable access control and CONNECT, BIND and UDP ASSOCIATE.

pub mod auth;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod relay;
pub mod resource;
pub mod routing;
pub mod shutdown;

pub use config::Config;
pub use connection::{ConnectionManager, ProxyContext};
pub use resource::ResourceManager;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the proxy server
pub type Result<T> = anyhow::Result<T>;
