//! SOCKS5 Protocol Types

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::protocol::constants::*;

/// One-byte authentication method code.
///
/// The set is open-ended (IANA assigns 0x03-0x7F, 0x80-0xFE are private), so
/// this is a newtype rather than an enum. `NO_ACCEPTABLE` is only ever sent
/// by the server and is never negotiable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AuthMethod(u8);

impl AuthMethod {
    pub const NO_AUTH: AuthMethod = AuthMethod(SOCKS5_AUTH_NONE);
    pub const GSSAPI: AuthMethod = AuthMethod(SOCKS5_AUTH_GSSAPI);
    pub const USER_PASS: AuthMethod = AuthMethod(SOCKS5_AUTH_USERPASS);
    pub const NO_ACCEPTABLE: AuthMethod = AuthMethod(SOCKS5_AUTH_UNSUPPORTED);

    /// Create from method code
    pub const fn from_code(code: u8) -> Self {
        AuthMethod(code)
    }

    /// Convert to method code
    pub const fn code(self) -> u8 {
        self.0
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            AuthMethod::NO_AUTH => f.write_str("no-auth"),
            AuthMethod::GSSAPI => f.write_str("gssapi"),
            AuthMethod::USER_PASS => f.write_str("username/password"),
            AuthMethod::NO_ACCEPTABLE => f.write_str("no-acceptable"),
            AuthMethod(other) => write!(f, "method({:#04x})", other),
        }
    }
}

/// SOCKS5 Commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl Command {
    /// Get the command code for this command
    pub fn code(self) -> u8 {
        match self {
            Command::Connect => SOCKS5_CMD_CONNECT,
            Command::Bind => SOCKS5_CMD_BIND,
            Command::UdpAssociate => SOCKS5_CMD_UDP_ASSOCIATE,
        }
    }

    /// Create from command code, `None` for unassigned codes
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            SOCKS5_CMD_CONNECT => Some(Command::Connect),
            SOCKS5_CMD_BIND => Some(Command::Bind),
            SOCKS5_CMD_UDP_ASSOCIATE => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Command::Connect => "CONNECT",
            Command::Bind => "BIND",
            Command::UdpAssociate => "UDP ASSOCIATE",
        })
    }
}

/// Wire encoding of an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Ipv4,
    DomainName,
    Ipv6,
}

impl AddressType {
    pub fn code(self) -> u8 {
        match self {
            AddressType::Ipv4 => SOCKS5_ADDR_IPV4,
            AddressType::DomainName => SOCKS5_ADDR_DOMAIN,
            AddressType::Ipv6 => SOCKS5_ADDR_IPV6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            SOCKS5_ADDR_IPV4 => Some(AddressType::Ipv4),
            SOCKS5_ADDR_DOMAIN => Some(AddressType::DomainName),
            SOCKS5_ADDR_IPV6 => Some(AddressType::Ipv6),
            _ => None,
        }
    }
}

/// Target address types supported by SOCKS5
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl TargetAddr {
    /// Get the address type for this address
    pub fn address_type(&self) -> AddressType {
        match self {
            TargetAddr::Ipv4(_) => AddressType::Ipv4,
            TargetAddr::Ipv6(_) => AddressType::Ipv6,
            TargetAddr::Domain(_) => AddressType::DomainName,
        }
    }

    /// The literal IP, if this is not a domain name
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            TargetAddr::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            TargetAddr::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            TargetAddr::Domain(_) => None,
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match self {
            TargetAddr::Domain(domain) => Some(domain),
            _ => None,
        }
    }

    /// Create from IP address
    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => TargetAddr::Ipv4(v4),
            IpAddr::V6(v6) => TargetAddr::Ipv6(v6),
        }
    }

    /// The all-zero IPv4 address used in failure replies
    pub fn unspecified() -> Self {
        TargetAddr::Ipv4(Ipv4Addr::UNSPECIFIED)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip) => write!(f, "{}", ip),
            TargetAddr::Ipv6(ip) => write!(f, "{}", ip),
            TargetAddr::Domain(domain) => f.write_str(domain),
        }
    }
}

/// Reply codes from RFC 1928 section 6
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded,
    GeneralFailure,
    ConnectionNotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
}

impl ReplyCode {
    pub fn code(self) -> u8 {
        match self {
            ReplyCode::Succeeded => SOCKS5_REPLY_SUCCESS,
            ReplyCode::GeneralFailure => SOCKS5_REPLY_GENERAL_FAILURE,
            ReplyCode::ConnectionNotAllowed => SOCKS5_REPLY_CONNECTION_NOT_ALLOWED,
            ReplyCode::NetworkUnreachable => SOCKS5_REPLY_NETWORK_UNREACHABLE,
            ReplyCode::HostUnreachable => SOCKS5_REPLY_HOST_UNREACHABLE,
            ReplyCode::ConnectionRefused => SOCKS5_REPLY_CONNECTION_REFUSED,
            ReplyCode::TtlExpired => SOCKS5_REPLY_TTL_EXPIRED,
            ReplyCode::CommandNotSupported => SOCKS5_REPLY_COMMAND_NOT_SUPPORTED,
            ReplyCode::AddressTypeNotSupported => SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
        }
    }

    /// Create from reply code, `None` for unassigned values
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            SOCKS5_REPLY_SUCCESS => ReplyCode::Succeeded,
            SOCKS5_REPLY_GENERAL_FAILURE => ReplyCode::GeneralFailure,
            SOCKS5_REPLY_CONNECTION_NOT_ALLOWED => ReplyCode::ConnectionNotAllowed,
            SOCKS5_REPLY_NETWORK_UNREACHABLE => ReplyCode::NetworkUnreachable,
            SOCKS5_REPLY_HOST_UNREACHABLE => ReplyCode::HostUnreachable,
            SOCKS5_REPLY_CONNECTION_REFUSED => ReplyCode::ConnectionRefused,
            SOCKS5_REPLY_TTL_EXPIRED => ReplyCode::TtlExpired,
            SOCKS5_REPLY_COMMAND_NOT_SUPPORTED => ReplyCode::CommandNotSupported,
            SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED => ReplyCode::AddressTypeNotSupported,
            _ => return None,
        })
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReplyCode::Succeeded => "succeeded",
            ReplyCode::GeneralFailure => "general SOCKS server failure",
            ReplyCode::ConnectionNotAllowed => "connection not allowed by ruleset",
            ReplyCode::NetworkUnreachable => "network unreachable",
            ReplyCode::HostUnreachable => "host unreachable",
            ReplyCode::ConnectionRefused => "connection refused",
            ReplyCode::TtlExpired => "TTL expired",
            ReplyCode::CommandNotSupported => "command not supported",
            ReplyCode::AddressTypeNotSupported => "address type not supported",
        })
    }
}

/// A parsed client request. Built once from the wire and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Request {
    pub command: Command,
    pub addr: TargetAddr,
    pub port: u16,
}

impl Socks5Request {
    pub fn new(command: Command, addr: TargetAddr, port: u16) -> Self {
        Self {
            command,
            addr,
            port,
        }
    }

    pub fn address_type(&self) -> AddressType {
        self.addr.address_type()
    }
}

/// SOCKS5 Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Response {
    pub reply: ReplyCode,
    pub bind_addr: TargetAddr,
    pub bind_port: u16,
}

impl Socks5Response {
    /// Create a success response
    pub fn success(bound: SocketAddr) -> Self {
        Self {
            reply: ReplyCode::Succeeded,
            bind_addr: TargetAddr::from_ip(bound.ip()),
            bind_port: bound.port(),
        }
    }

    /// Create an error response carrying `0.0.0.0:0`
    pub fn error(reply: ReplyCode) -> Self {
        Self {
            reply,
            bind_addr: TargetAddr::unspecified(),
            bind_port: 0,
        }
    }
}
