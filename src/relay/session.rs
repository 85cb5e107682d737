//! Relay Session

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

/// Represents an active relay session
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub target_addr: SocketAddr,
    pub start_time: Instant,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    /// Milliseconds since `start_time` of the last transfer in either direction
    last_activity: AtomicU64,
}

/// Statistics for a finished session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub target_addr: SocketAddr,
    pub duration: Duration,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

/// Which side ended the session first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

impl RelaySession {
    /// Create a new relay session
    pub fn new(session_id: impl Into<String>, client_addr: SocketAddr, target_addr: SocketAddr) -> Self {
        let session_id = session_id.into();
        debug!(
            "Creating new relay session: {} ({} -> {})",
            session_id, client_addr, target_addr
        );

        Self {
            session_id,
            client_addr,
            target_addr,
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            last_activity: AtomicU64::new(0),
        }
    }

    /// Get bytes transferred upstream (client to target)
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Get bytes transferred downstream (target to client)
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_up() + self.bytes_down()
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn add_bytes_up(&self, bytes: u64) {
        self.bytes_up.fetch_add(bytes, Ordering::Relaxed);
        self.touch();
    }

    pub fn add_bytes_down(&self, bytes: u64) {
        self.bytes_down.fetch_add(bytes, Ordering::Relaxed);
        self.touch();
    }

    fn touch(&self) {
        self.last_activity
            .store(self.start_time.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Time since data last moved in either direction
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity.load(Ordering::Relaxed));
        self.start_time.elapsed().saturating_sub(last)
    }

    /// Copy in both directions until either side finishes.
    ///
    /// Each direction runs independently. EOF or an error on one side ends
    /// the whole session, as does `idle_timeout` passing with no data in
    /// either direction. Both streams are dropped when this returns.
    pub async fn relay<C, T>(
        &self,
        client: C,
        target: T,
        buffer_size: usize,
        idle_timeout: Duration,
    ) -> io::Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut target_read, mut target_write) = tokio::io::split(target);

        let up = self.pump(
            &mut client_read,
            &mut target_write,
            Direction::Up,
            buffer_size,
            idle_timeout,
        );
        let down = self.pump(
            &mut target_read,
            &mut client_write,
            Direction::Down,
            buffer_size,
            idle_timeout,
        );

        let (direction, result) = tokio::select! {
            result = up => (Direction::Up, result),
            result = down => (Direction::Down, result),
        };
        debug!(
            "Relay session {} ended by {:?} direction: {:?}",
            self.session_id, direction, result
        );
        result
    }

    /// One direction of the relay. Returns on EOF after shutting down the writer.
    async fn pump<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        direction: Direction,
        buffer_size: usize,
        idle_timeout: Duration,
    ) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; buffer_size];
        loop {
            let n = match timeout(idle_timeout, reader.read(&mut buf)).await {
                Ok(read) => read?,
                // The other direction may still be busy.
                Err(_) if self.idle_for() < idle_timeout => continue,
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "relay idle timeout",
                    ))
                }
            };
            if n == 0 {
                writer.shutdown().await?;
                return Ok(());
            }
            writer.write_all(&buf[..n]).await?;
            writer.flush().await?;
            match direction {
                Direction::Up => self.add_bytes_up(n as u64),
                Direction::Down => self.add_bytes_down(n as u64),
            }
        }
    }

    pub fn to_stats(&self) -> ConnectionStats {
        ConnectionStats {
            session_id: self.session_id.clone(),
            client_addr: self.client_addr,
            target_addr: self.target_addr,
            duration: self.duration(),
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn session() -> RelaySession {
        RelaySession::new(
            "test",
            "127.0.0.1:1000".parse().unwrap(),
            "127.0.0.1:2000".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_relay_counts_bytes_both_ways() {
        let (client, mut client_peer) = duplex(1024);
        let (target, mut target_peer) = duplex(1024);
        let session = session();

        let remote = async {
            client_peer.write_all(b"hello").await.unwrap();
            let mut buf = [0u8; 5];
            target_peer.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");

            target_peer.write_all(b"world!").await.unwrap();
            let mut buf = [0u8; 6];
            client_peer.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"world!");

            drop(client_peer);
            target_peer
        };

        let (result, _target_peer) = tokio::join!(
            session.relay(client, target, 1024, Duration::from_secs(5)),
            remote
        );
        result.unwrap();
        assert_eq!(session.bytes_up(), 5);
        assert_eq!(session.bytes_down(), 6);
        assert_eq!(session.to_stats().bytes_up, 5);
    }

    #[tokio::test]
    async fn test_one_side_closing_ends_session() {
        let (client, client_peer) = duplex(64);
        let (target, mut target_peer) = duplex(64);
        let session = session();

        drop(client_peer);
        session
            .relay(client, target, 64, Duration::from_secs(5))
            .await
            .unwrap();

        // The target side sees EOF once the relay tears down.
        let mut buf = Vec::new();
        target_peer.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (client, _client_peer) = duplex(64);
        let (target, _target_peer) = duplex(64);

        let err = session()
            .relay(client, target, 64, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_one_way_traffic_is_not_idle() {
        let (client, _client_peer) = duplex(64);
        let (target, mut target_peer) = duplex(64);
        let session = session();

        let feeder = async {
            for _ in 0..6 {
                target_peer.write_all(b"tick").await.unwrap();
                tokio::time::sleep(Duration::from_millis(40)).await;
            }
            drop(target_peer);
        };

        // Upstream is silent for longer than the idle timeout, but downstream keeps it alive.
        let (result, _) = tokio::join!(
            session.relay(client, target, 64, Duration::from_millis(100)),
            feeder
        );
        result.unwrap();
        assert_eq!(session.bytes_down(), 24);
    }
}
