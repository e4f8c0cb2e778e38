//! Address resolution strategies for the client.
//!
//! A resolver produces the current set of server addresses and may push
//! updates asynchronously through a watch channel. An update must never
//! be an empty list; "drop everything" is not expressible through a
//! resolver push.

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::{Result, RpcError};

/// Strategy producing and refreshing the server address set.
pub trait Resolver: Send + Sync {
    /// Returns the current address list.
    fn resolve(&self) -> Result<Vec<String>>;

    /// Subscribes `updates` to future address pushes. Updates are
    /// delivered asynchronously and never carry an empty list.
    fn watch(&self, updates: mpsc::Sender<Vec<String>>);

    /// Releases resolver resources.
    fn close(&self);
}

/// Fixed address list, never updated. The default resolver.
pub struct StaticResolver {
    addrs: Vec<String>,
}

impl StaticResolver {
    /// Creates a resolver over a fixed address list.
    pub fn new(addrs: Vec<String>) -> Self {
        Self { addrs }
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self) -> Result<Vec<String>> {
        if self.addrs.is_empty() {
            return Err(RpcError::NodeUnavailable {
                detail: Some("static resolver has no addresses".into()),
            });
        }
        Ok(self.addrs.clone())
    }

    fn watch(&self, _updates: mpsc::Sender<Vec<String>>) {}

    fn close(&self) {}
}

/// Resolver whose address list is pushed by the owner, for dynamic
/// discovery fed from outside the runtime.
#[derive(Default)]
pub struct ManualResolver {
    addrs: Mutex<Vec<String>>,
    subscribers: Mutex<Vec<mpsc::Sender<Vec<String>>>>,
}

impl ManualResolver {
    /// Creates a resolver seeded with `addrs`.
    pub fn new(addrs: Vec<String>) -> Self {
        Self {
            addrs: Mutex::new(addrs),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the address list and pushes it to every subscriber.
    /// Empty lists are rejected.
    pub fn push(&self, addrs: Vec<String>) -> Result<()> {
        if addrs.is_empty() {
            return Err(RpcError::InvalidArgument(
                "resolver update must not be empty".into(),
            ));
        }
        *self.addrs.lock().unwrap() = addrs.clone();
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| match tx.try_send(addrs.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("resolver subscriber lagging, update dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        Ok(())
    }
}

impl Resolver for ManualResolver {
    fn resolve(&self) -> Result<Vec<String>> {
        let addrs = self.addrs.lock().unwrap().clone();
        if addrs.is_empty() {
            return Err(RpcError::NodeUnavailable {
                detail: Some("resolver has no addresses".into()),
            });
        }
        Ok(addrs)
    }

    fn watch(&self, updates: mpsc::Sender<Vec<String>>) {
        self.subscribers.lock().unwrap().push(updates);
    }

    fn close(&self) {
        self.subscribers.lock().unwrap().clear();
    }
}
