//! Selection of a gateway client per call.
//!
//! A [`GatewayPool`] hands out clients round robin and skips the ones
//! whose health probe fails.
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::gateway::{GatewayClient, GwError, GwResult};

/// Something that can hand out a gateway client.
pub trait ClientSelector: Debug + Send + Sync {
    /// The next client to use.
    fn next(&self) -> GwResult<&(dyn GatewayClient + 'static)>;
}

#[derive(Debug)]
struct PoolInner {
    clients: Vec<Box<dyn GatewayClient>>,
    cursor: AtomicUsize,
}

/// Round robin pool of gateway clients.
#[derive(Debug, Clone)]
pub struct GatewayPool {
    inner: Arc<PoolInner>,
}

impl GatewayPool {
    pub fn new(clients: Vec<Box<dyn GatewayClient>>) -> GatewayPool {
        GatewayPool {
            inner: Arc::new(PoolInner {
                clients,
                cursor: AtomicUsize::new(0),
            }),
        }
    }

    /// Pool with a single client.
    pub fn single(client: Box<dyn GatewayClient>) -> GatewayPool {
        GatewayPool::new(vec![client])
    }

    pub fn len(&self) -> usize {
        self.inner.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.clients.is_empty()
    }
}

impl ClientSelector for GatewayPool {
    fn next(&self) -> GwResult<&(dyn GatewayClient + 'static)> {
        let clients = &self.inner.clients;
        let n = clients.len();
        if n > 0 {
            let start = self.inner.cursor.fetch_add(1, Ordering::Relaxed);
            for i in 0..n {
                let c = &clients[(start + i) % n];
                if c.healthy() {
                    return Ok(c.as_ref());
                }
                debug!("gateway client {} is unhealthy, skipping", (start + i) % n);
            }
        }
        error!("no healthy gateway client available");
        Err(GwError::Transport(
            "no healthy gateway client available".to_string(),
        ))
    }
}

#[cfg(all(test, feature = "memgw"))]
mod tests {
    use super::*;
    use crate::memgw::MemGateway;

    #[test]
    fn round_robin_skips_unhealthy() {
        let a = MemGateway::new();
        let b = MemGateway::new();
        b.set_healthy(false);
        let pool = GatewayPool::new(vec![Box::new(a.clone()), Box::new(b.clone())]);
        for _ in 0..4 {
            assert!(pool.next().unwrap().healthy());
        }
        b.set_healthy(true);
        a.set_healthy(false);
        for _ in 0..4 {
            assert!(pool.next().unwrap().healthy());
        }
    }

    #[test]
    fn no_healthy_client() {
        let a = MemGateway::new();
        a.set_healthy(false);
        let pool = GatewayPool::single(Box::new(a));
        assert!(matches!(pool.next(), Err(GwError::Transport(_))));
        let empty = GatewayPool::new(Vec::new());
        assert!(empty.is_empty());
        assert!(empty.next().is_err());
    }
}
