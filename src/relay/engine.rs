//! Request Dispatcher
//!
//! Executes CONNECT, BIND and UDP ASSOCIATE against a resolved destination.
//! Every failure comes back as a `SocksError` that already knows its reply code.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info};

use super::{Dialer, TcpDialer};
use crate::config::ServerConfig;
use crate::protocol::{ReplyCode, Result, SocksError};

/// Carries out requests once they have been routed.
#[derive(Clone)]
pub struct Dispatcher {
    dialer: Arc<dyn Dialer>,
    connect_timeout: Duration,
    bind_timeout: Duration,
    bind_ip: Option<IpAddr>,
}

impl Dispatcher {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            connect_timeout: Duration::from_secs(10),
            bind_timeout: Duration::from_secs(120),
            bind_ip: None,
        }
    }

    /// Create a new dispatcher from configuration
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            dialer: Arc::new(TcpDialer),
            connect_timeout: config.connect_timeout,
            bind_timeout: config.bind_timeout,
            bind_ip: config.bind_ip,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_bind_timeout(mut self, bind_timeout: Duration) -> Self {
        self.bind_timeout = bind_timeout;
        self
    }

    pub fn with_bind_ip(mut self, bind_ip: Option<IpAddr>) -> Self {
        self.bind_ip = bind_ip;
        self
    }

    /// CONNECT: dial the destination within the connect timeout
    pub async fn connect(&self, dest: SocketAddr) -> Result<TcpStream> {
        debug!("Connecting to {}", dest);
        match timeout(self.connect_timeout, self.dialer.dial(dest)).await {
            Ok(Ok(stream)) => {
                info!("Connected to target {}", dest);
                Ok(stream)
            }
            Ok(Err(e)) => Err(SocksError::from_dial(e)),
            Err(_) => Err(SocksError::Destination {
                reply: ReplyCode::TtlExpired,
                source: io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", dest),
                ),
            }),
        }
    }

    /// Local address BIND listeners and UDP sockets use. `local_ip` is the
    /// server side of the client's control connection.
    fn listen_ip(&self, local_ip: IpAddr) -> IpAddr {
        self.bind_ip.unwrap_or(local_ip)
    }

    /// BIND, first half: open the listener the peer will connect to
    pub async fn bind(&self, local_ip: IpAddr) -> Result<TcpListener> {
        let listener = TcpListener::bind(SocketAddr::new(self.listen_ip(local_ip), 0))
            .await
            .map_err(SocksError::from_dial)?;
        debug!("BIND listener on {:?}", listener.local_addr());
        Ok(listener)
    }

    /// BIND, second half: wait for the expected peer.
    ///
    /// Connections from other addresses are dropped and waiting continues.
    /// An unspecified `expected` address accepts anyone.
    pub async fn accept_peer(
        &self,
        listener: &TcpListener,
        expected: IpAddr,
    ) -> Result<(TcpStream, SocketAddr)> {
        let wait = async {
            loop {
                let (stream, peer) = listener.accept().await.map_err(SocksError::from_dial)?;
                if expected.is_unspecified() || same_host(peer.ip(), expected) {
                    return Ok((stream, peer));
                }
                debug!("BIND dropped connection from unexpected peer {}", peer);
            }
        };

        timeout(self.bind_timeout, wait)
            .await
            .map_err(|_| SocksError::Timeout("waiting for BIND peer"))?
    }

    /// UDP ASSOCIATE: open the client-facing relay socket
    pub async fn udp_socket(&self, local_ip: IpAddr) -> Result<UdpSocket> {
        let socket = UdpSocket::bind(SocketAddr::new(self.listen_ip(local_ip), 0))
            .await
            .map_err(SocksError::from_dial)?;
        debug!("UDP relay socket on {:?}", socket.local_addr());
        Ok(socket)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(Arc::new(TcpDialer))
    }
}

/// Address equality that treats IPv4-mapped IPv6 as its IPv4 form
pub(crate) fn same_host(a: IpAddr, b: IpAddr) -> bool {
    canonical(a) == canonical(b)
}

pub(crate) fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// Report a concrete address for a socket bound to the unspecified address
pub(crate) fn reply_addr(bound: SocketAddr, local_ip: IpAddr) -> SocketAddr {
    if bound.ip().is_unspecified() {
        SocketAddr::new(local_ip, bound.port())
    } else {
        bound
    }
}
