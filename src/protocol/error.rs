//! SOCKS5 error taxonomy

use std::io;

use thiserror::Error;

use super::types::ReplyCode;

/// Everything that can end a SOCKS5 connection early.
#[derive(Error, Debug)]
pub enum SocksError {
    /// The underlying stream failed; no reply is written afterwards.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported SOCKS version {0:#04x}")]
    BadVersion(u8),

    #[error("client offered no authentication methods")]
    NoMethodsOffered,

    #[error("no supported authentication method")]
    NoSupportedAuth,

    #[error("user authentication failed")]
    AuthFailed,

    #[error("unsupported username/password sub-negotiation version {0:#04x}")]
    BadAuthVersion(u8),

    #[error("reserved byte must be 0x00, got {0:#04x}")]
    BadReserved(u8),

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("invalid domain name in request")]
    InvalidDomain,

    #[error("malformed datagram: {0}")]
    Malformed(&'static str),

    #[error("{0} denied by rule set")]
    NotAllowed(String),

    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("destination error ({reply}): {source}")]
    Destination {
        reply: ReplyCode,
        #[source]
        source: io::Error,
    },

    #[error("timed out {0}")]
    Timeout(&'static str),

    #[error("protocol phase out of order: {0}")]
    OutOfOrder(&'static str),
}

impl SocksError {
    /// Reply code owed to the client once a request is being processed.
    ///
    /// `None` means no request reply applies: transport failures, and errors
    /// raised during method negotiation or authentication, which have their
    /// own framing.
    pub fn reply_code(&self) -> Option<ReplyCode> {
        match self {
            SocksError::Io(_) => None,
            SocksError::NoMethodsOffered
            | SocksError::NoSupportedAuth
            | SocksError::AuthFailed
            | SocksError::BadAuthVersion(_)
            | SocksError::OutOfOrder(_) => None,
            SocksError::BadVersion(_)
            | SocksError::BadReserved(_)
            | SocksError::InvalidDomain
            | SocksError::Malformed(_) => Some(ReplyCode::GeneralFailure),
            SocksError::UnsupportedCommand(_) => Some(ReplyCode::CommandNotSupported),
            SocksError::UnsupportedAddressType(_) => Some(ReplyCode::AddressTypeNotSupported),
            SocksError::NotAllowed(_) => Some(ReplyCode::ConnectionNotAllowed),
            SocksError::Resolve { .. } => Some(ReplyCode::HostUnreachable),
            SocksError::Destination { reply, .. } => Some(*reply),
            SocksError::Timeout(_) => Some(ReplyCode::TtlExpired),
        }
    }

    /// True when the connection is presumed broken and nothing more may be written.
    pub fn is_transport(&self) -> bool {
        matches!(self, SocksError::Io(_))
    }

    /// Map an outbound dial/bind failure onto the closest reply code.
    pub fn from_dial(source: io::Error) -> Self {
        let reply = match source.kind() {
            io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
            io::ErrorKind::HostUnreachable => ReplyCode::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
            io::ErrorKind::PermissionDenied => ReplyCode::ConnectionNotAllowed,
            io::ErrorKind::TimedOut => ReplyCode::TtlExpired,
            _ => ReplyCode::GeneralFailure,
        };
        SocksError::Destination { reply, source }
    }
}

pub type Result<T> = std::result::Result<T, SocksError>;
