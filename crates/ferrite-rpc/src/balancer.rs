//! Node selection strategies for the client.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use rand::Rng;

use crate::error::{Result, RpcError};
use crate::node::Node;

/// Strategy selecting which node serves the next call.
pub trait Balancer: Send + Sync {
    /// Replaces the node set. Called on every resolver reconciliation.
    fn update(&self, nodes: Vec<Arc<Node>>);

    /// Picks the node for the next call. Must fail with
    /// node-unavailable when the set is empty.
    fn next(&self) -> Result<Arc<Node>>;
}

/// Uniform random selection. The default.
#[derive(Default)]
pub struct RandomBalancer {
    nodes: RwLock<Vec<Arc<Node>>>,
}

impl RandomBalancer {
    /// Creates an empty random balancer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for RandomBalancer {
    fn update(&self, nodes: Vec<Arc<Node>>) {
        *self.nodes.write().unwrap() = nodes;
    }

    fn next(&self) -> Result<Arc<Node>> {
        let nodes = self.nodes.read().unwrap();
        if nodes.is_empty() {
            return Err(RpcError::NodeUnavailable { detail: None });
        }
        let idx = rand::thread_rng().gen_range(0..nodes.len());
        Ok(nodes[idx].clone())
    }
}

/// Rotating selection in listed order.
#[derive(Default)]
pub struct RoundRobinBalancer {
    nodes: RwLock<Vec<Arc<Node>>>,
    cursor: AtomicUsize,
}

impl RoundRobinBalancer {
    /// Creates an empty round-robin balancer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for RoundRobinBalancer {
    fn update(&self, nodes: Vec<Arc<Node>>) {
        *self.nodes.write().unwrap() = nodes;
        self.cursor.store(0, Ordering::SeqCst);
    }

    fn next(&self) -> Result<Arc<Node>> {
        let nodes = self.nodes.read().unwrap();
        if nodes.is_empty() {
            return Err(RpcError::NodeUnavailable { detail: None });
        }
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst) % nodes.len();
        Ok(nodes[idx].clone())
    }
}
