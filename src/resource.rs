//! Resource Management
//!
//! Connection limits backed by a semaphore, plus counters for what was
//! admitted and turned away.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::Result;

/// Tracks and enforces the concurrent connection limit
pub struct ResourceManager {
    max_connections: usize,
    connection_semaphore: Arc<Semaphore>,
    stats: ResourceStats,
}

#[derive(Debug, Default)]
struct ResourceStats {
    peak_connections: AtomicUsize,
    total_connections_created: AtomicUsize,
    total_connections_rejected: AtomicUsize,
}

impl ResourceManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            stats: ResourceStats::default(),
        }
    }

    /// Try to acquire a connection slot without waiting
    pub fn acquire_connection_slot(&self) -> Result<ConnectionSlot> {
        match Arc::clone(&self.connection_semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.stats
                    .total_connections_created
                    .fetch_add(1, Ordering::Relaxed);

                let current = self.active_connections();

                let mut peak = self.stats.peak_connections.load(Ordering::Relaxed);
                while current > peak {
                    match self.stats.peak_connections.compare_exchange_weak(
                        peak,
                        current,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(x) => peak = x,
                    }
                }

                debug!("Acquired connection slot, active connections: {}", current);
                Ok(ConnectionSlot { _permit: permit })
            }
            Err(_) => {
                self.stats
                    .total_connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Connection limit reached ({}), rejecting connection",
                    self.max_connections
                );
                Err(anyhow::anyhow!("Connection limit reached"))
            }
        }
    }

    pub fn active_connections(&self) -> usize {
        self.max_connections - self.connection_semaphore.available_permits()
    }

    /// Get current resource usage statistics
    pub fn get_stats(&self) -> ResourceUsageStats {
        ResourceUsageStats {
            active_connections: self.active_connections(),
            peak_connections: self.stats.peak_connections.load(Ordering::Relaxed),
            total_connections_created: self.stats.total_connections_created.load(Ordering::Relaxed),
            total_connections_rejected: self
                .stats
                .total_connections_rejected
                .load(Ordering::Relaxed),
            max_connections: self.max_connections,
        }
    }
}

/// Connection slot that releases when dropped
pub struct ConnectionSlot {
    _permit: OwnedSemaphorePermit,
}

/// Resource usage statistics for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceUsageStats {
    pub active_connections: usize,
    pub peak_connections: usize,
    pub total_connections_created: usize,
    pub total_connections_rejected: usize,
    pub max_connections: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_slot_acquisition() {
        let resource_manager = ResourceManager::new(16);

        let mut slots = Vec::new();
        for _ in 0..10 {
            slots.push(resource_manager.acquire_connection_slot().unwrap());
        }
        assert_eq!(resource_manager.get_stats().active_connections, 10);

        drop(slots);
        let stats = resource_manager.get_stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.peak_connections, 10);
        assert_eq!(stats.total_connections_created, 10);
    }

    #[test]
    fn test_limit_rejects_excess() {
        let resource_manager = ResourceManager::new(2);

        let _a = resource_manager.acquire_connection_slot().unwrap();
        let b = resource_manager.acquire_connection_slot().unwrap();
        assert!(resource_manager.acquire_connection_slot().is_err());
        assert_eq!(resource_manager.get_stats().total_connections_rejected, 1);

        drop(b);
        assert!(resource_manager.acquire_connection_slot().is_ok());
    }
}
