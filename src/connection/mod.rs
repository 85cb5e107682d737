//! Connection Management Module
//!
//! Handles TCP connection acceptance, per-connection orchestration and lifecycle.

pub mod context;
pub mod handler;
pub mod manager;
pub mod observer;

pub use context::ProxyContext;
pub use handler::ConnectionHandler;
pub use manager::{ConnectionInfo, ConnectionManager};
pub use observer::{ConnectionObserver, TracingObserver};
