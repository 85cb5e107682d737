//! UDP ASSOCIATE relay
//!
//! Datagrams from the client carry a `RSV(2) FRAG(1) ATYP DST.ADDR DST.PORT`
//! header that is stripped before forwarding; replies get the same header
//! with the sender's address. The association lives as long as the TCP
//! control connection.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::engine::{canonical, same_host};
use super::RelaySession;
use crate::auth::AuthContext;
use crate::protocol::codec::{parse_address, put_address};
use crate::protocol::{
    Command, Result, Socks5Request, SocksError, TargetAddr, SOCKS5_MAX_DATAGRAM,
};
use crate::routing::Router;

const UDP_HEADER_PREFIX: usize = 3;
const RECV_BUFFER: usize = 65_536;
const ROUTED_QUEUE: usize = 64;

/// One client's UDP association.
pub struct UdpRelay {
    socket: UdpSocket,
    outbound_v4: UdpSocket,
    outbound_v6: Option<UdpSocket>,
    router: Router,
    ctx: AuthContext,
    client_addr: SocketAddr,
}

impl UdpRelay {
    /// `socket` is the client-facing socket announced in the reply;
    /// `client_addr` is the peer of the control connection.
    pub async fn new(
        socket: UdpSocket,
        router: Router,
        ctx: AuthContext,
        client_addr: SocketAddr,
    ) -> io::Result<Self> {
        let outbound_v4 = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let outbound_v6 = match UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0)).await {
            Ok(socket) => Some(socket),
            Err(e) => {
                debug!("No IPv6 outbound socket for UDP relay: {}", e);
                None
            }
        };

        Ok(Self {
            socket,
            outbound_v4,
            outbound_v6,
            router,
            ctx,
            client_addr,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Relay datagrams until the control stream reaches EOF or fails.
    ///
    /// Receive errors on the UDP sockets (ICMP unreachable reported by some
    /// platforms) are logged and the association carries on.
    pub async fn run<C>(&self, control: &mut C, session: &RelaySession) -> io::Result<()>
    where
        C: AsyncRead + Unpin + ?Sized,
    {
        let mut control_buf = [0u8; 512];
        let mut client_buf = vec![0u8; RECV_BUFFER];
        let mut v4_buf = vec![0u8; RECV_BUFFER];
        let mut v6_buf = vec![0u8; RECV_BUFFER];
        // The client's UDP source, fixed by its first accepted datagram.
        let mut client_udp: Option<SocketAddr> = None;
        // Datagrams whose destination was resolved off the receive loop.
        let (routed_tx, mut routed_rx) = mpsc::channel::<(SocketAddr, Bytes)>(ROUTED_QUEUE);

        loop {
            tokio::select! {
                read = control.read(&mut control_buf) => {
                    if read? == 0 {
                        debug!("UDP association for {} closed by control connection", self.client_addr);
                        return Ok(());
                    }
                }
                received = self.socket.recv_from(&mut client_buf) => match received {
                    Ok((n, from)) => {
                        self.from_client(&client_buf[..n], from, &mut client_udp, &routed_tx, session)
                            .await
                    }
                    Err(e) => debug!("UDP receive on client socket failed: {}", e),
                },
                Some((dest, payload)) = routed_rx.recv() => {
                    self.send_outbound(&payload, dest, session).await;
                }
                received = self.outbound_v4.recv_from(&mut v4_buf) => match received {
                    Ok((n, from)) => self.to_client(&v4_buf[..n], from, client_udp, session).await,
                    Err(e) => debug!("UDP receive on IPv4 outbound socket failed: {}", e),
                },
                received = recv_optional(self.outbound_v6.as_ref(), &mut v6_buf) => match received {
                    Ok((n, from)) => self.to_client(&v6_buf[..n], from, client_udp, session).await,
                    Err(e) => debug!("UDP receive on IPv6 outbound socket failed: {}", e),
                },
            }
        }
    }

    async fn from_client(
        &self,
        data: &[u8],
        from: SocketAddr,
        client_udp: &mut Option<SocketAddr>,
        routed_tx: &mpsc::Sender<(SocketAddr, Bytes)>,
        session: &RelaySession,
    ) {
        if !same_host(from.ip(), self.client_addr.ip()) {
            debug!("Dropping datagram from foreign source {}", from);
            return;
        }
        match client_udp {
            Some(pinned) if *pinned != from => {
                debug!("Dropping datagram from {}, association is pinned to {}", from, pinned);
                return;
            }
            _ => {}
        }

        let (addr, port, payload) = match parse_datagram(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", from, e);
                return;
            }
        };
        *client_udp = Some(from);

        let needs_lookup = matches!(addr, TargetAddr::Domain(_));
        let request = Socks5Request::new(Command::UdpAssociate, addr, port);

        if needs_lookup {
            let router = self.router.clone();
            let ctx = self.ctx.clone();
            let client_addr = self.client_addr;
            let payload = Bytes::copy_from_slice(payload);
            let routed_tx = routed_tx.clone();
            tokio::spawn(async move {
                match router.route(&ctx, request, client_addr).await {
                    Ok(resolved) => {
                        // The association may have ended while resolving.
                        let _ = routed_tx.send((resolved.dest, payload)).await;
                    }
                    Err(e) => debug!("Dropping datagram from {}: {}", from, e),
                }
            });
            return;
        }

        match self.router.route(&self.ctx, request, self.client_addr).await {
            Ok(resolved) => self.send_outbound(payload, resolved.dest, session).await,
            Err(e) => debug!("Dropping datagram from {}: {}", from, e),
        }
    }

    async fn send_outbound(&self, payload: &[u8], dest: SocketAddr, session: &RelaySession) {
        let socket = match dest {
            SocketAddr::V4(_) => &self.outbound_v4,
            SocketAddr::V6(_) => match &self.outbound_v6 {
                Some(socket) => socket,
                None => {
                    debug!("Dropping datagram for {}: no IPv6 socket", dest);
                    return;
                }
            },
        };

        match socket.send_to(payload, dest).await {
            Ok(sent) => {
                trace!("UDP {} -> {} ({} bytes)", self.client_addr, dest, sent);
                session.add_bytes_up(sent as u64);
            }
            Err(e) => debug!("UDP send to {} failed: {}", dest, e),
        }
    }

    async fn to_client(
        &self,
        payload: &[u8],
        from: SocketAddr,
        client_udp: Option<SocketAddr>,
        session: &RelaySession,
    ) {
        let Some(client) = client_udp else {
            debug!("Dropping datagram from {} before the client sent anything", from);
            return;
        };

        let datagram = match encode_datagram(from, payload) {
            Ok(datagram) => datagram,
            Err(e) => {
                debug!("Dropping reply from {}: {}", from, e);
                return;
            }
        };

        match self.socket.send_to(&datagram, client).await {
            Ok(_) => {
                trace!("UDP {} -> {} ({} bytes)", from, client, payload.len());
                session.add_bytes_down(payload.len() as u64);
            }
            Err(e) => debug!("UDP send to client {} failed: {}", client, e),
        }
    }
}

async fn recv_optional(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

/// Split a client datagram into destination and payload.
///
/// Fragmented datagrams are not supported and are rejected.
pub fn parse_datagram(data: &[u8]) -> Result<(TargetAddr, u16, &[u8])> {
    if data.len() < UDP_HEADER_PREFIX {
        return Err(SocksError::Malformed("truncated UDP header"));
    }
    if data[0] != 0 || data[1] != 0 {
        return Err(SocksError::Malformed("non-zero UDP reserved field"));
    }
    if data[2] != 0 {
        return Err(SocksError::Malformed("fragmented datagram"));
    }

    let (addr, port, consumed) = parse_address(&data[UDP_HEADER_PREFIX..])?;
    Ok((addr, port, &data[UDP_HEADER_PREFIX + consumed..]))
}

/// Wrap a payload received from `from` for delivery to the client.
pub fn encode_datagram(from: SocketAddr, payload: &[u8]) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(UDP_HEADER_PREFIX + 19 + payload.len());
    buf.put_slice(&[0, 0, 0]);
    put_address(&mut buf, &TargetAddr::from_ip(canonical(from.ip())), from.port())?;
    buf.put_slice(payload);

    if buf.len() > SOCKS5_MAX_DATAGRAM {
        return Err(SocksError::Malformed("datagram too large"));
    }
    Ok(buf)
}
