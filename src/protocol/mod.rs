//! SOCKS5 Protocol Implementation
//!
//! Wire types, framing and the per-connection handshake state machine.

pub mod codec;
pub mod constants;
pub mod error;
pub mod handler;
pub mod types;

use tokio::io::{AsyncRead, AsyncWrite};

pub use constants::*;
pub use error::{Result, SocksError};
pub use handler::{HandshakeState, Socks5Handler};
pub use types::*;

/// Byte stream a SOCKS5 conversation can run over.
pub trait SocksStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> SocksStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}
