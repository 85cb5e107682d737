//! Per-connection orchestration
//!
//! Drives one client through negotiation, authentication, request parsing,
//! routing and dispatch, then hands the connection to the relay. A failure
//! at any step writes the reply it owes (if any) and closes.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use super::ProxyContext;
use crate::auth::AuthContext;
use crate::protocol::{
    Command, HandshakeState, ReplyCode, Result, Socks5Handler, Socks5Request, Socks5Response,
    SocksError, SocksStream,
};
use crate::relay::engine::reply_addr;
use crate::relay::{RelaySession, UdpRelay};
use crate::routing::ResolvedRequest;

/// Runs the SOCKS5 exchange for accepted connections.
#[derive(Clone)]
pub struct ConnectionHandler {
    context: Arc<ProxyContext>,
}

impl ConnectionHandler {
    pub fn new(context: Arc<ProxyContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &ProxyContext {
        &self.context
    }

    /// Serve one client until its session ends.
    ///
    /// `local_addr` is the server side of the client connection; BIND and
    /// UDP ASSOCIATE open their sockets on that address unless a bind IP is
    /// configured.
    pub async fn handle<S: SocksStream>(
        &self,
        connection_id: &str,
        stream: S,
        client_addr: SocketAddr,
        local_addr: SocketAddr,
    ) -> Result<()> {
        let mut handler = Socks5Handler::new(stream);

        // The handshake timeout bounds reading the client's frames. A request
        // cut off by it is incomplete, so no reply is owed.
        let handshake = timeout(
            self.context.handshake_timeout,
            self.handshake(&mut handler),
        )
        .await;
        let (auth, request) = match handshake {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => return Err(self.handshake_failed(&mut handler, client_addr, e).await),
            Err(_) => {
                let e = SocksError::Timeout("handshake");
                self.observe_handshake_failure(client_addr, &e);
                return Err(e);
            }
        };

        // Resolution is bounded by the resolver's own timeout.
        let resolved = match self.context.router.route(&auth, request, client_addr).await {
            Ok(resolved) => resolved,
            Err(e) => return Err(self.handshake_failed(&mut handler, client_addr, e).await),
        };

        info!(
            "{} {} -> {} (user: {})",
            resolved.request.command,
            client_addr,
            resolved.dest,
            auth.username().unwrap_or("anonymous")
        );

        match resolved.request.command {
            Command::Connect => self.connect(connection_id, handler, &auth, &resolved).await,
            Command::Bind => {
                self.bind(connection_id, handler, &auth, &resolved, local_addr)
                    .await
            }
            Command::UdpAssociate => {
                self.udp_associate(connection_id, handler, auth, &resolved, local_addr)
                    .await
            }
        }
    }

    async fn handshake<S: SocksStream>(
        &self,
        handler: &mut Socks5Handler<S>,
    ) -> Result<(AuthContext, Socks5Request)> {
        let auth = handler.authenticate(&self.context.authenticators).await?;
        let request = handler.read_request().await?;
        Ok((auth, request))
    }

    async fn handshake_failed<S: SocksStream>(
        &self,
        handler: &mut Socks5Handler<S>,
        client_addr: SocketAddr,
        error: SocksError,
    ) -> SocksError {
        self.observe_handshake_failure(client_addr, &error);
        reply_error(handler, &error).await;
        error
    }

    fn observe_handshake_failure(&self, client_addr: SocketAddr, error: &SocksError) {
        match error {
            SocksError::AuthFailed | SocksError::NoSupportedAuth | SocksError::BadAuthVersion(_) => {
                self.context.observer.on_auth_failure(client_addr, error)
            }
            SocksError::NotAllowed(_) => self.context.observer.on_rule_denied(client_addr, error),
            _ => debug!("Handshake with {} failed: {}", client_addr, error),
        }
    }

    async fn dispatch_failed<S: SocksStream>(
        &self,
        handler: &mut Socks5Handler<S>,
        resolved: &ResolvedRequest,
        error: SocksError,
    ) -> SocksError {
        self.context.observer.on_dispatch_failure(resolved, &error);
        reply_error(handler, &error).await;
        error
    }

    async fn connect<S: SocksStream>(
        &self,
        connection_id: &str,
        mut handler: Socks5Handler<S>,
        auth: &AuthContext,
        resolved: &ResolvedRequest,
    ) -> Result<()> {
        let target = match self.context.dispatcher.connect(resolved.dest).await {
            Ok(target) => target,
            Err(e) => return Err(self.dispatch_failed(&mut handler, resolved, e).await),
        };

        let bound = match target.local_addr() {
            Ok(bound) => bound,
            Err(e) => {
                let e = SocksError::from_dial(e);
                return Err(self.dispatch_failed(&mut handler, resolved, e).await);
            }
        };
        handler.send_reply(&Socks5Response::success(bound)).await?;

        self.relay(connection_id, handler.into_stream(), target, auth, resolved)
            .await
    }

    async fn bind<S: SocksStream>(
        &self,
        connection_id: &str,
        mut handler: Socks5Handler<S>,
        auth: &AuthContext,
        resolved: &ResolvedRequest,
        local_addr: SocketAddr,
    ) -> Result<()> {
        let dispatcher = &self.context.dispatcher;
        let listener = match dispatcher.bind(local_addr.ip()).await {
            Ok(listener) => listener,
            Err(e) => return Err(self.dispatch_failed(&mut handler, resolved, e).await),
        };

        let listening = match listener.local_addr() {
            Ok(addr) => reply_addr(addr, local_addr.ip()),
            Err(e) => {
                let e = SocksError::from_dial(e);
                return Err(self.dispatch_failed(&mut handler, resolved, e).await);
            }
        };
        handler.send_reply(&Socks5Response::success(listening)).await?;
        debug!("BIND listening on {} for {}", listening, resolved.dest.ip());

        let (peer_stream, peer) = match dispatcher.accept_peer(&listener, resolved.dest.ip()).await {
            Ok(accepted) => accepted,
            Err(e) => return Err(self.dispatch_failed(&mut handler, resolved, e).await),
        };
        drop(listener);

        handler.send_reply(&Socks5Response::success(peer)).await?;
        info!("BIND peer {} connected", peer);

        self.relay(connection_id, handler.into_stream(), peer_stream, auth, resolved)
            .await
    }

    async fn udp_associate<S: SocksStream>(
        &self,
        connection_id: &str,
        mut handler: Socks5Handler<S>,
        auth: AuthContext,
        resolved: &ResolvedRequest,
        local_addr: SocketAddr,
    ) -> Result<()> {
        let socket = match self.context.dispatcher.udp_socket(local_addr.ip()).await {
            Ok(socket) => socket,
            Err(e) => return Err(self.dispatch_failed(&mut handler, resolved, e).await),
        };

        let user = auth.username().map(str::to_string);
        let relay = match UdpRelay::new(
            socket,
            self.context.router.clone(),
            auth,
            resolved.client_addr,
        )
        .await
        {
            Ok(relay) => relay,
            Err(e) => {
                let e = SocksError::from_dial(e);
                return Err(self.dispatch_failed(&mut handler, resolved, e).await);
            }
        };

        let relay_addr = match relay.local_addr() {
            Ok(addr) => reply_addr(addr, local_addr.ip()),
            Err(e) => {
                let e = SocksError::from_dial(e);
                return Err(self.dispatch_failed(&mut handler, resolved, e).await);
            }
        };
        handler.send_reply(&Socks5Response::success(relay_addr)).await?;
        info!("UDP association for {} on {}", resolved.client_addr, relay_addr);

        let session = RelaySession::new(connection_id, resolved.client_addr, relay_addr);
        let mut control = handler.into_stream();
        let result = relay.run(&mut control, &session).await;

        self.context
            .observer
            .on_connection_closed(&session.to_stats(), user.as_deref());
        result.map_err(SocksError::from)
    }

    async fn relay<S: SocksStream>(
        &self,
        connection_id: &str,
        client: S,
        target: TcpStream,
        auth: &AuthContext,
        resolved: &ResolvedRequest,
    ) -> Result<()> {
        let session = RelaySession::new(connection_id, resolved.client_addr, resolved.dest);
        let result = session
            .relay(
                client,
                target,
                self.context.buffer_size,
                self.context.idle_timeout,
            )
            .await;

        self.context
            .observer
            .on_connection_closed(&session.to_stats(), auth.username());
        result.map_err(SocksError::from)
    }
}

/// Write the failure reply owed for `error`, if any. Write errors are ignored.
async fn reply_error<S: SocksStream>(handler: &mut Socks5Handler<S>, error: &SocksError) {
    if error.is_transport() {
        return;
    }
    if !matches!(
        handler.state(),
        HandshakeState::Requested | HandshakeState::Replied
    ) {
        return;
    }

    let code = error.reply_code().unwrap_or(ReplyCode::GeneralFailure);
    if let Err(e) = handler.send_reply(&Socks5Response::error(code)).await {
        debug!("Failed to send {} reply: {}", code, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;

    use crate::auth::{Authenticators, StaticCredentials, UserPassAuthenticator};
    use crate::connection::ConnectionObserver;
    use crate::relay::ConnectionStats;
    use crate::routing::{DnsResolver, PermitAll, PermitCommand, Resolver, Router};

    #[derive(Default)]
    struct CountingObserver {
        auth_failures: AtomicUsize,
        denials: AtomicUsize,
        dispatch_failures: AtomicUsize,
        closed: AtomicUsize,
    }

    impl ConnectionObserver for CountingObserver {
        fn on_auth_failure(&self, _: SocketAddr, _: &SocksError) {
            self.auth_failures.fetch_add(1, Ordering::SeqCst);
        }

        fn on_rule_denied(&self, _: SocketAddr, _: &SocksError) {
            self.denials.fetch_add(1, Ordering::SeqCst);
        }

        fn on_dispatch_failure(&self, _: &ResolvedRequest, _: &SocksError) {
            self.dispatch_failures.fetch_add(1, Ordering::SeqCst);
        }

        fn on_connection_closed(&self, _: &ConnectionStats, _: Option<&str>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:1080".parse().unwrap(),
        )
    }

    fn handler_with(context: ProxyContext) -> (ConnectionHandler, Arc<CountingObserver>) {
        let observer = Arc::new(CountingObserver::default());
        let context = context.with_observer(observer.clone());
        (ConnectionHandler::new(Arc::new(context)), observer)
    }

    fn spawn_handler(
        handler: ConnectionHandler,
    ) -> (DuplexStream, tokio::task::JoinHandle<Result<()>>) {
        let (client, server) = duplex(4096);
        let (client_addr, local_addr) = addrs();
        let task = tokio::spawn(async move {
            handler.handle("test", server, client_addr, local_addr).await
        });
        (client, task)
    }

    fn connect_request(dest: SocketAddr) -> Vec<u8> {
        let SocketAddr::V4(v4) = dest else {
            panic!("test destinations are IPv4");
        };
        let mut frame = vec![0x05, 0x01, 0x00, 0x01];
        frame.extend_from_slice(&v4.ip().octets());
        frame.extend_from_slice(&v4.port().to_be_bytes());
        frame
    }

    #[tokio::test]
    async fn test_connect_relays_data() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let (handler, observer) = handler_with(ProxyContext::new());
        let (mut client, task) = spawn_handler(handler);

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        client.write_all(&connect_request(target_addr)).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
        assert_eq!(&reply[4..8], &[127, 0, 0, 1]);

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        drop(client);
        task.await.unwrap().unwrap();
        assert_eq!(observer.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refused_connect_replies_and_observes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = listener.local_addr().unwrap();
        drop(listener);

        let (handler, observer) = handler_with(ProxyContext::new());
        let (mut client, task) = spawn_handler(handler);

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client.write_all(&connect_request(closed_addr)).await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(
            response,
            vec![0x05, 0x00, 0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.reply_code(), Some(ReplyCode::ConnectionRefused));
        assert_eq!(observer.dispatch_failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_denied_request_gets_not_allowed() {
        let router = Router::new(
            Arc::new(DnsResolver::default()),
            Arc::new(PermitCommand {
                connect: false,
                ..PermitCommand::all()
            }),
        );
        let (handler, observer) = handler_with(ProxyContext::new().with_router(router));
        let (mut client, task) = spawn_handler(handler);

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client
            .write_all(&connect_request("127.0.0.1:80".parse().unwrap()))
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(&response[2..4], &[0x05, 0x02]);

        assert!(matches!(
            task.await.unwrap(),
            Err(SocksError::NotAllowed(_))
        ));
        assert_eq!(observer.denials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bad_password_observed_as_auth_failure() {
        let store = StaticCredentials::new().with_user("foo", "bar");
        let authenticators =
            Authenticators::new().with(UserPassAuthenticator::new(Arc::new(store)));
        let (handler, observer) =
            handler_with(ProxyContext::new().with_authenticators(authenticators));
        let (mut client, task) = spawn_handler(handler);

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        client
            .write_all(&[0x01, 0x03, b'f', b'o', b'o', 0x03, b'b', b'a', b'z'])
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, vec![0x05, 0x02, 0x01, 0x01]);

        assert!(matches!(task.await.unwrap(), Err(SocksError::AuthFailed)));
        assert_eq!(observer.auth_failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_silent_client_times_out_without_reply() {
        let context = ProxyContext::new().with_handshake_timeout(Duration::from_millis(100));
        let (handler, _observer) = handler_with(context);
        let (mut client, task) = spawn_handler(handler);

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty());
        assert!(matches!(
            task.await.unwrap(),
            Err(SocksError::Timeout("handshake"))
        ));
    }

    #[tokio::test]
    async fn test_partial_request_times_out_without_reply() {
        let context = ProxyContext::new().with_handshake_timeout(Duration::from_millis(100));
        let (handler, _observer) = handler_with(context);
        let (mut client, task) = spawn_handler(handler);

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        // Half a request, then nothing.
        client.write_all(&[0x05, 0x01]).await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, vec![0x05, 0x00]);
        assert!(matches!(
            task.await.unwrap(),
            Err(SocksError::Timeout("handshake"))
        ));
    }

    /// Fails every lookup with `TimedOut`, after `delay`.
    struct FailingResolver {
        delay: Duration,
    }

    #[async_trait]
    impl Resolver for FailingResolver {
        async fn resolve(&self, _host: &str, _port: u16) -> io::Result<SocketAddr> {
            tokio::time::sleep(self.delay).await;
            Err(io::Error::new(io::ErrorKind::TimedOut, "lookup timed out"))
        }
    }

    #[tokio::test]
    async fn test_slow_failed_lookup_gets_host_unreachable() {
        let resolver = FailingResolver {
            delay: Duration::from_millis(300),
        };
        let router = Router::new(Arc::new(resolver), Arc::new(PermitAll));
        let context = ProxyContext::new()
            .with_router(router)
            .with_handshake_timeout(Duration::from_millis(200));
        let (handler, _observer) = handler_with(context);
        let (mut client, task) = spawn_handler(handler);

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut request = vec![0x05, 0x01, 0x00, 0x03, 12];
        request.extend_from_slice(b"slow.example");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(
            response,
            vec![0x05, 0x00, 0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
        assert!(matches!(
            task.await.unwrap(),
            Err(SocksError::Resolve { .. })
        ));
    }
}
