//! Data Relay Module
//!
//! Executes routed requests and moves bytes between client and destination.

pub mod dialer;
pub mod engine;
pub mod session;
pub mod udp;

pub use dialer::{Dialer, TcpDialer};
pub use engine::Dispatcher;
pub use session::{ConnectionStats, RelaySession};
pub use udp::UdpRelay;
