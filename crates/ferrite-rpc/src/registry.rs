//! Server-side address publication contract.
//!
//! Discovery backends live outside the runtime; the server only drives
//! this interface around its own lifecycle: register on serve, offline
//! on drain, close on shutdown.

use async_trait::async_trait;

use crate::error::Result;

/// Publishes a server's addresses for discovery.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Publishes the server's addresses.
    async fn register(&self) -> Result<()>;

    /// Marks the server unavailable without removing it.
    async fn offline(&self) -> Result<()>;

    /// Marks the server available again.
    async fn online(&self) -> Result<()>;

    /// Removes the server and releases backend resources.
    async fn close(&self) -> Result<()>;
}

/// Registry that publishes nowhere. Default for servers that are
/// discovered statically.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRegistry;

#[async_trait]
impl Registry for NoopRegistry {
    async fn register(&self) -> Result<()> {
        Ok(())
    }

    async fn offline(&self) -> Result<()> {
        Ok(())
    }

    async fn online(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
