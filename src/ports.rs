//! Host port allocation for main service ports
//!
//! A port is free when it can be bound on the host. Finding a port and creating
//! the container that publishes it must happen under one lock, otherwise two
//! concurrent starts can pick the same port.

use std::net::TcpListener;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::EngineError;

/// Tells whether a host port can be used
pub trait PortProbe: Send + Sync {
    fn is_free(&self, port: u16) -> bool;
}

/// Probes by binding a TCP listener on all interfaces
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpPortProbe;

impl PortProbe for TcpPortProbe {
    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).is_ok()
    }
}

/// Hands out host ports; clones share the same lock
#[derive(Clone)]
pub struct PortAllocator {
    base: u16,
    probe: Arc<dyn PortProbe>,
    lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self::with_probe(base, Arc::new(TcpPortProbe))
    }

    pub fn with_probe(base: u16, probe: Arc<dyn PortProbe>) -> Self {
        Self {
            base,
            probe,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    /// Take the allocation lock. Hold the lease until the container that
    /// publishes the port has been started.
    pub async fn lock(&self) -> PortLease<'_> {
        let guard = self.lock.lock().await;
        PortLease {
            allocator: self,
            _guard: guard,
        }
    }
}

/// Proof that the allocation lock is held
pub struct PortLease<'a> {
    allocator: &'a PortAllocator,
    _guard: MutexGuard<'a, ()>,
}

impl PortLease<'_> {
    /// Lowest free port at or above the base
    pub fn find_free_port(&self) -> Result<u16, EngineError> {
        let base = self.allocator.base;
        (base..=u16::MAX)
            .find(|port| self.allocator.probe.is_free(*port))
            .ok_or(EngineError::PortsExhausted(base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    struct TakenPorts(StdMutex<HashSet<u16>>);

    impl PortProbe for TakenPorts {
        fn is_free(&self, port: u16) -> bool {
            !self.0.lock().unwrap().contains(&port)
        }
    }

    #[tokio::test]
    async fn test_lowest_free_port() {
        let taken = Arc::new(TakenPorts(StdMutex::new(HashSet::from([30000, 30001]))));
        let allocator = PortAllocator::with_probe(30000, taken.clone());

        let lease = allocator.lock().await;
        assert_eq!(lease.find_free_port().unwrap(), 30002);
        drop(lease);

        taken.0.lock().unwrap().remove(&30000);
        assert_eq!(allocator.lock().await.find_free_port().unwrap(), 30000);
    }

    #[tokio::test]
    async fn test_exhausted() {
        let taken = Arc::new(TakenPorts(StdMutex::new(HashSet::from([u16::MAX - 1, u16::MAX]))));
        let allocator = PortAllocator::with_probe(u16::MAX - 1, taken);

        let err = allocator.lock().await.find_free_port().unwrap_err();
        assert!(matches!(err, EngineError::PortsExhausted(65534)));
    }

    #[tokio::test]
    async fn test_tcp_probe_sees_bound_port() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!TcpPortProbe.is_free(port));
    }

    #[tokio::test]
    async fn test_clones_share_lock() {
        let allocator = PortAllocator::new(30000);
        let clone = allocator.clone();

        let _lease = allocator.lock().await;
        let second = tokio::time::timeout(std::time::Duration::from_millis(50), clone.lock()).await;
        assert!(second.is_err());
    }
}
