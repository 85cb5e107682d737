//! SOCKS5 wire framing
//!
//! Requests and replies share the same address framing:
//!
//! ```text
//! +----+-----+-------+------+----------+----------+
//! |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
//! +----+-----+-------+------+----------+----------+
//! | 1  |  1  | X'00' |  1   | Variable |    2     |
//! +----+-----+-------+------+----------+----------+
//! ```
//!
//! The reply swaps CMD for REP and DST for BND.

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::constants::*;
use super::error::{Result, SocksError};
use super::types::{AddressType, Command, Socks5Request, Socks5Response, TargetAddr};

/// Read a full request frame.
///
/// The address is always consumed before an unknown command is rejected, so
/// the reply that follows is not interleaved with unread request bytes.
pub async fn read_request<R>(reader: &mut R) -> Result<Socks5Request>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;

    let [version, command, reserved, address_type] = header;

    if version != SOCKS5_VERSION {
        return Err(SocksError::BadVersion(version));
    }
    if reserved != SOCKS5_RESERVED {
        return Err(SocksError::BadReserved(reserved));
    }

    let address_type = AddressType::from_code(address_type)
        .ok_or(SocksError::UnsupportedAddressType(address_type))?;
    let addr = read_address(reader, address_type).await?;
    let port = reader.read_u16().await?;

    let command = Command::from_code(command).ok_or(SocksError::UnsupportedCommand(command))?;

    Ok(Socks5Request::new(command, addr, port))
}

async fn read_address<R>(reader: &mut R, address_type: AddressType) -> Result<TargetAddr>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let addr = match address_type {
        AddressType::Ipv4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            TargetAddr::Ipv4(Ipv4Addr::from(octets))
        }
        AddressType::Ipv6 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            TargetAddr::Ipv6(Ipv6Addr::from(octets))
        }
        AddressType::DomainName => {
            let len = reader.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            reader.read_exact(&mut name).await?;
            TargetAddr::Domain(domain_from_bytes(name)?)
        }
    };
    Ok(addr)
}

fn domain_from_bytes(name: Vec<u8>) -> Result<String> {
    if name.is_empty() {
        return Err(SocksError::InvalidDomain);
    }
    String::from_utf8(name).map_err(|_| SocksError::InvalidDomain)
}

/// Append ATYP, address and port.
pub fn put_address(buf: &mut BytesMut, addr: &TargetAddr, port: u16) -> Result<()> {
    buf.put_u8(addr.address_type().code());
    match addr {
        TargetAddr::Ipv4(ip) => buf.put_slice(&ip.octets()),
        TargetAddr::Ipv6(ip) => buf.put_slice(&ip.octets()),
        TargetAddr::Domain(domain) => {
            if domain.is_empty() || domain.len() > u8::MAX as usize {
                return Err(SocksError::InvalidDomain);
            }
            buf.put_u8(domain.len() as u8);
            buf.put_slice(domain.as_bytes());
        }
    }
    buf.put_u16(port);
    Ok(())
}

/// Parse ATYP, address and port from the front of a datagram.
///
/// Returns the address, port and the number of bytes consumed.
pub fn parse_address(data: &[u8]) -> Result<(TargetAddr, u16, usize)> {
    let (&atyp, rest) = data
        .split_first()
        .ok_or(SocksError::Malformed("missing address type"))?;
    let address_type =
        AddressType::from_code(atyp).ok_or(SocksError::UnsupportedAddressType(atyp))?;

    let (addr, addr_len) = match address_type {
        AddressType::Ipv4 => {
            let octets: [u8; 4] = rest
                .get(..4)
                .and_then(|s| s.try_into().ok())
                .ok_or(SocksError::Malformed("truncated IPv4 address"))?;
            (TargetAddr::Ipv4(Ipv4Addr::from(octets)), 4)
        }
        AddressType::Ipv6 => {
            let octets: [u8; 16] = rest
                .get(..16)
                .and_then(|s| s.try_into().ok())
                .ok_or(SocksError::Malformed("truncated IPv6 address"))?;
            (TargetAddr::Ipv6(Ipv6Addr::from(octets)), 16)
        }
        AddressType::DomainName => {
            let len = *rest
                .first()
                .ok_or(SocksError::Malformed("missing domain length"))? as usize;
            let name = rest
                .get(1..1 + len)
                .ok_or(SocksError::Malformed("truncated domain name"))?;
            (TargetAddr::Domain(domain_from_bytes(name.to_vec())?), 1 + len)
        }
    };

    let port_bytes = rest
        .get(addr_len..addr_len + 2)
        .ok_or(SocksError::Malformed("truncated port"))?;
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);

    Ok((addr, port, 1 + addr_len + 2))
}

/// Encode a request frame (client side; used by tests and tooling).
pub fn encode_request(request: &Socks5Request) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(22);
    buf.put_u8(SOCKS5_VERSION);
    buf.put_u8(request.command.code());
    buf.put_u8(SOCKS5_RESERVED);
    put_address(&mut buf, &request.addr, request.port)?;
    Ok(buf)
}

/// Encode a reply frame.
pub fn encode_reply(response: &Socks5Response) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(22);
    buf.put_u8(SOCKS5_VERSION);
    buf.put_u8(response.reply.code());
    buf.put_u8(SOCKS5_RESERVED);
    put_address(&mut buf, &response.bind_addr, response.bind_port)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::ReplyCode;

    async fn decode(bytes: &[u8]) -> Result<Socks5Request> {
        let mut reader = bytes;
        read_request(&mut reader).await
    }

    #[tokio::test]
    async fn test_request_round_trip_preserves_address() {
        let requests = [
            Socks5Request::new(Command::Connect, TargetAddr::Ipv4(Ipv4Addr::new(10, 1, 2, 3)), 80),
            Socks5Request::new(Command::Bind, TargetAddr::Ipv6("2001:db8::1".parse().unwrap()), 21),
            Socks5Request::new(
                Command::UdpAssociate,
                TargetAddr::Domain("Mixed.Case.Example".to_string()),
                65535,
            ),
        ];

        for request in requests {
            let encoded = encode_request(&request).unwrap();
            let decoded = decode(&encoded).await.unwrap();
            assert_eq!(decoded, request);
            assert_eq!(decoded.address_type(), request.address_type());
        }
    }

    #[tokio::test]
    async fn test_ipv4_request_exact_length() {
        let bytes = [5, 1, 0, 1, 127, 0, 0, 1, 0x1f, 0x90];
        let request = decode(&bytes).await.unwrap();
        assert_eq!(request.command, Command::Connect);
        assert_eq!(request.addr, TargetAddr::Ipv4(Ipv4Addr::LOCALHOST));
        assert_eq!(request.port, 8080);
    }

    #[tokio::test]
    async fn test_bad_version_rejected() {
        let err = decode(&[4, 1, 0, 1, 127, 0, 0, 1, 0, 80]).await.unwrap_err();
        assert!(matches!(err, SocksError::BadVersion(4)));
    }

    #[tokio::test]
    async fn test_nonzero_reserved_rejected() {
        let err = decode(&[5, 1, 7, 1, 127, 0, 0, 1, 0, 80]).await.unwrap_err();
        assert!(matches!(err, SocksError::BadReserved(7)));
    }

    #[tokio::test]
    async fn test_unknown_address_type_rejected() {
        let err = decode(&[5, 1, 0, 2, 0, 0]).await.unwrap_err();
        assert!(matches!(err, SocksError::UnsupportedAddressType(2)));
        assert_eq!(err.reply_code(), Some(ReplyCode::AddressTypeNotSupported));
    }

    #[tokio::test]
    async fn test_unknown_command_consumes_address() {
        let bytes = [5, 9, 0, 1, 127, 0, 0, 1, 0, 80];
        let mut reader = &bytes[..];
        let err = read_request(&mut reader).await.unwrap_err();
        assert!(matches!(err, SocksError::UnsupportedCommand(9)));
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_request_is_transport_error() {
        let err = decode(&[5, 1, 0, 3, 10, b'e', b'x']).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_empty_domain_rejected() {
        let err = decode(&[5, 1, 0, 3, 0, 0, 80]).await.unwrap_err();
        assert!(matches!(err, SocksError::InvalidDomain));
    }

    #[test]
    fn test_reply_encoding() {
        let reply = Socks5Response::success("192.168.1.2:1080".parse().unwrap());
        assert_eq!(
            &encode_reply(&reply).unwrap()[..],
            &[5, 0, 0, 1, 192, 168, 1, 2, 0x04, 0x38]
        );

        let failure = Socks5Response::error(ReplyCode::ConnectionRefused);
        assert_eq!(
            &encode_reply(&failure).unwrap()[..],
            &[5, 5, 0, 1, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_parse_address_reports_consumed_bytes() {
        let data = [3, 4, b'h', b'o', b's', b't', 0, 53, 0xde, 0xad];
        let (addr, port, used) = parse_address(&data).unwrap();
        assert_eq!(addr, TargetAddr::Domain("host".to_string()));
        assert_eq!(port, 53);
        assert_eq!(used, 8);
        assert_eq!(&data[used..], &[0xde, 0xad]);
    }

    #[test]
    fn test_parse_address_truncated() {
        assert!(parse_address(&[1, 127, 0]).is_err());
        assert!(parse_address(&[4, 0, 0]).is_err());
        assert!(parse_address(&[3, 9, b'a']).is_err());
        assert!(parse_address(&[]).is_err());
    }

    #[tokio::test]
    async fn test_domain_length_boundaries() {
        for len in [1usize, 2, 254, 255] {
            let domain = "a".repeat(len);
            let request =
                Socks5Request::new(Command::Connect, TargetAddr::Domain(domain.clone()), 443);

            let encoded = encode_request(&request).unwrap();
            assert_eq!(encoded.len(), 4 + 1 + len + 2);
            assert_eq!(decode(&encoded).await.unwrap(), request);

            let mut buf = BytesMut::new();
            put_address(&mut buf, &TargetAddr::Domain(domain.clone()), 443).unwrap();
            let (addr, port, used) = parse_address(&buf).unwrap();
            assert_eq!(addr, TargetAddr::Domain(domain));
            assert_eq!(port, 443);
            assert_eq!(used, buf.len());
        }

        let mut buf = BytesMut::new();
        assert!(matches!(
            put_address(&mut buf, &TargetAddr::Domain("a".repeat(256)), 443),
            Err(SocksError::InvalidDomain)
        ));
    }
}
