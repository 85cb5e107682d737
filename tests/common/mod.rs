//! Shared helpers for integration tests

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{timeout, Duration};

use socksproxy::{Config, ConnectionManager};

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Config listening on an ephemeral localhost port
pub fn local_config() -> Config {
    let mut config = Config::default();
    config.server.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.server.shutdown_timeout = Duration::from_secs(2);
    config
}

pub async fn start_server(config: Config) -> (Arc<ConnectionManager>, SocketAddr) {
    config.validate().unwrap();
    let mut manager = ConnectionManager::new(Arc::new(config)).unwrap();
    let addr = manager.bind().await.unwrap();
    let manager = Arc::new(manager);
    let runner = Arc::clone(&manager);
    tokio::spawn(async move { runner.run().await });
    (manager, addr)
}

/// TCP server that echoes everything back on every connection
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

pub async fn start_udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

/// A port with nothing listening on it
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub async fn read_exact_timeout(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(IO_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

/// Read until the server closes the connection
pub async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    // A reset after close is as good as EOF here.
    let _ = timeout(IO_TIMEOUT, stream.read_to_end(&mut buf))
        .await
        .expect("server did not close the connection");
    buf
}

/// Send a greeting and return the selected method
pub async fn greet(stream: &mut TcpStream, methods: &[u8]) -> u8 {
    let mut frame = vec![0x05, methods.len() as u8];
    frame.extend_from_slice(methods);
    stream.write_all(&frame).await.unwrap();

    let reply = read_exact_timeout(stream, 2).await;
    assert_eq!(reply[0], 0x05);
    reply[1]
}

/// Username/password sub-negotiation, returns the status byte
pub async fn login(stream: &mut TcpStream, username: &str, password: &str) -> u8 {
    let mut frame = vec![0x01, username.len() as u8];
    frame.extend_from_slice(username.as_bytes());
    frame.push(password.len() as u8);
    frame.extend_from_slice(password.as_bytes());
    stream.write_all(&frame).await.unwrap();

    let reply = read_exact_timeout(stream, 2).await;
    assert_eq!(reply[0], 0x01);
    reply[1]
}

pub fn request_frame(command: u8, dest: SocketAddr) -> Vec<u8> {
    let mut frame = vec![0x05, command, 0x00];
    match dest.ip() {
        IpAddr::V4(ip) => {
            frame.push(0x01);
            frame.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            frame.push(0x04);
            frame.extend_from_slice(&ip.octets());
        }
    }
    frame.extend_from_slice(&dest.port().to_be_bytes());
    frame
}

pub async fn send_request(stream: &mut TcpStream, command: u8, dest: SocketAddr) {
    stream
        .write_all(&request_frame(command, dest))
        .await
        .unwrap();
}

/// Read one reply frame, returning the reply code and bound address
pub async fn read_reply(stream: &mut TcpStream) -> (u8, SocketAddr) {
    let head = read_exact_timeout(stream, 4).await;
    assert_eq!(head[0], 0x05);
    assert_eq!(head[2], 0x00);

    let ip: IpAddr = match head[3] {
        0x01 => {
            let octets: [u8; 4] = read_exact_timeout(stream, 4).await.try_into().unwrap();
            Ipv4Addr::from(octets).into()
        }
        0x04 => {
            let octets: [u8; 16] = read_exact_timeout(stream, 16).await.try_into().unwrap();
            Ipv6Addr::from(octets).into()
        }
        other => panic!("unexpected address type in reply: {}", other),
    };
    let port = read_exact_timeout(stream, 2).await;
    (head[1], SocketAddr::new(ip, u16::from_be_bytes([port[0], port[1]])))
}

/// Greet without authentication and CONNECT to `dest`
pub async fn connect_via(proxy: SocketAddr, dest: SocketAddr) -> (TcpStream, u8) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    assert_eq!(greet(&mut stream, &[0x00]).await, 0x00);
    send_request(&mut stream, 0x01, dest).await;
    let (code, _) = read_reply(&mut stream).await;
    (stream, code)
}

pub async fn assert_echo(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let echoed = read_exact_timeout(stream, payload.len()).await;
    assert_eq!(echoed, payload);
}
