//! Connection Manager Implementation

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{ConnectionHandler, ProxyContext};
use crate::config::Config;
use crate::resource::{ResourceManager, ResourceUsageStats};
use crate::Result;

/// Connection information for tracking
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: String,
    pub addr: SocketAddr,
    pub start_time: Instant,
}

/// Accepts SOCKS5 clients and runs each on its own task
pub struct ConnectionManager {
    listener: Option<TcpListener>,
    config: Arc<Config>,
    handler: ConnectionHandler,
    resource_manager: Arc<ResourceManager>,
    connection_tracker: Arc<RwLock<HashMap<String, ConnectionInfo>>>,
    shutdown_flag: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ConnectionManager {
    /// Create a new ConnectionManager with services built from `config`
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let context = ProxyContext::from_config(&config)?;
        Ok(Self::with_context(config, context))
    }

    /// Create a ConnectionManager around caller-supplied services
    pub fn with_context(config: Arc<Config>, context: ProxyContext) -> Self {
        let resource_manager = Arc::new(ResourceManager::new(config.server.max_connections));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            listener: None,
            config,
            handler: ConnectionHandler::new(Arc::new(context)),
            resource_manager,
            connection_tracker: Arc::new(RwLock::new(HashMap::new())),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Bind the listener to the configured address
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let bind_addr = self.config.server.bind_addr;

        info!("Binding TCP listener to {}", bind_addr);
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", bind_addr))?;
        let local_addr = listener.local_addr()?;

        info!("Successfully bound to {}", local_addr);
        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// Bind if needed, then accept connections until shutdown
    pub async fn start(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        self.run().await
    }

    /// Main connection acceptance loop. Requires a prior `bind`.
    pub async fn run(&self) -> Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Listener not initialized"))?;

        info!("Starting connection acceptance loop");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut backoff = Duration::ZERO;

        loop {
            if self.shutdown_flag.load(Ordering::Relaxed) {
                info!("Shutdown flag set, stopping connection acceptance");
                break;
            }

            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            backoff = Duration::ZERO;
                            self.spawn_connection(stream, addr);
                        }
                        Err(e) => {
                            // Errors such as EMFILE persist; wait before retrying.
                            backoff = next_accept_backoff(backoff);
                            error!("Error accepting connection: {}, retrying in {:?}", e, backoff);
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    self.shutdown_flag.store(true, Ordering::Relaxed);
                    break;
                }
            }
        }

        info!("Connection acceptance loop stopped");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        debug!("Accepted connection from {}", addr);

        if self.shutdown_flag.load(Ordering::Relaxed) {
            debug!("Rejecting connection from {} due to shutdown", addr);
            return;
        }

        // Over the limit: drop without writing anything.
        let connection_slot = match self.resource_manager.acquire_connection_slot() {
            Ok(slot) => slot,
            Err(_) => {
                warn!("Connection limit reached, rejecting connection from {}", addr);
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }
        let local_addr = stream
            .local_addr()
            .unwrap_or(self.config.server.bind_addr);

        let connection_id = Uuid::new_v4().to_string();
        let conn_info = ConnectionInfo {
            id: connection_id.clone(),
            addr,
            start_time: Instant::now(),
        };

        let handler = self.handler.clone();
        let connection_tracker = Arc::clone(&self.connection_tracker);
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let _connection_slot = connection_slot;

            connection_tracker
                .write()
                .await
                .insert(connection_id.clone(), conn_info);

            info!("Started handling connection {} from {}", connection_id, addr);
            Self::handle_connection_with_shutdown(
                handler,
                stream,
                addr,
                local_addr,
                connection_id.clone(),
                shutdown_rx,
            )
            .await;

            if let Some(removed) = connection_tracker.write().await.remove(&connection_id) {
                info!(
                    "Connection {} from {} closed after {:?}",
                    connection_id,
                    addr,
                    removed.start_time.elapsed()
                );
            }
        });
    }

    /// Handle a single connection with shutdown awareness
    #[instrument(skip(handler, stream, local_addr, shutdown_rx), fields(connection_id = %connection_id, addr = %addr))]
    async fn handle_connection_with_shutdown(
        handler: ConnectionHandler,
        stream: TcpStream,
        addr: SocketAddr,
        local_addr: SocketAddr,
        connection_id: String,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        tokio::select! {
            result = handler.handle(&connection_id, stream, addr, local_addr) => {
                match result {
                    Ok(()) => debug!("Connection {} completed successfully", connection_id),
                    Err(e) if e.is_transport() => {
                        debug!("Connection {} ended: {}", connection_id, e)
                    }
                    Err(e) => info!("Connection {} failed: {}", connection_id, e),
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Connection {} received shutdown signal, closing", connection_id);
            }
        }
    }

    /// Get the number of active connections
    pub fn get_active_connections(&self) -> usize {
        self.resource_manager.active_connections()
    }

    /// Get the bound address if the listener is initialized
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// Get information about all active connections
    pub async fn get_active_connection_info(&self) -> Vec<ConnectionInfo> {
        self.connection_tracker.read().await.values().cloned().collect()
    }

    pub fn get_resource_stats(&self) -> ResourceUsageStats {
        self.resource_manager.get_stats()
    }

    /// Stop accepting and signal every connection task to close
    pub fn initiate_shutdown(&self) {
        info!("Initiating graceful shutdown of connection manager");
        self.shutdown_flag.store(true, Ordering::Relaxed);

        if let Err(e) = self.shutdown_tx.send(()) {
            debug!("No receivers for shutdown signal: {}", e);
        }
    }

    /// Get a shutdown receiver for external components
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Wait up to `shutdown_timeout` for all connections to close
    pub async fn wait_for_connections_to_close(&self, shutdown_timeout: Duration) -> Result<()> {
        let start_time = Instant::now();

        info!(
            "Waiting for {} active connections to close (timeout: {:?})",
            self.get_active_connections(),
            shutdown_timeout
        );

        while self.get_active_connections() > 0 && start_time.elapsed() < shutdown_timeout {
            debug!("Waiting for {} active connections to close", self.get_active_connections());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let remaining = self.get_active_connections();
        let elapsed = start_time.elapsed();

        if remaining == 0 {
            info!("All connections closed gracefully in {:?}", elapsed);
        } else {
            warn!(
                "Shutdown timeout reached after {:?} with {} connections still active",
                elapsed, remaining
            );
        }

        Ok(())
    }

    /// Gracefully shutdown using the configured timeout
    pub async fn shutdown(&self) -> Result<()> {
        self.initiate_shutdown();
        self.wait_for_connections_to_close(self.config.server.shutdown_timeout)
            .await
    }
}

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(10);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Delay before the next accept after a failed one: doubles per failure
fn next_accept_backoff(current: Duration) -> Duration {
    (current * 2).clamp(MIN_ACCEPT_BACKOFF, MAX_ACCEPT_BACKOFF)
}
