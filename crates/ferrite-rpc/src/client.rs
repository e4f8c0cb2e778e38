//! Client orchestration: resolve addresses, balance across nodes, dial
//! on demand, and apply the fail-over policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::balancer::{Balancer, RandomBalancer};
use crate::call::CallContext;
use crate::codec::CodecRegistry;
use crate::error::{Result, RpcError};
use crate::json::JSON_CODEC_NAME;
use crate::node::{CallFilter, Node};
use crate::resolver::Resolver;
use crate::transport::{Dialer, TcpTransport};

/// Client policy on call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailMode {
    /// Return the first error immediately.
    #[default]
    FailFast,
    /// Retry the same node a fixed number of additional times.
    FailTry,
    /// Try every other known node in listed order.
    FailOver,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Codec name, looked up in the codec registry.
    pub codec: String,
    /// Failure policy.
    pub fail_mode: FailMode,
    /// Additional attempts under [`FailMode::FailTry`].
    pub retries: u32,
    /// Overall deadline covering all attempts of one call.
    pub call_timeout: Option<Duration>,
    /// Dial timeout per node.
    pub connect_timeout: Duration,
    /// Number of nodes constructed per resolved address.
    pub channels: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            codec: JSON_CODEC_NAME.to_string(),
            fail_mode: FailMode::FailFast,
            retries: 2,
            call_timeout: None,
            connect_timeout: Duration::from_secs(5),
            channels: 1,
        }
    }
}

struct AddressEntry {
    addr: String,
    nodes: Vec<Arc<Node>>,
}

#[derive(Default)]
struct ClientState {
    entries: Vec<AddressEntry>,
    watch_task: Option<tokio::task::JoinHandle<()>>,
}

/// RPC client for one logical target server.
pub struct RpcClient {
    config: ClientConfig,
    codecs: Arc<CodecRegistry>,
    dialer: Arc<dyn Dialer>,
    resolver: Arc<dyn Resolver>,
    balancer: Arc<dyn Balancer>,
    filters: Vec<Arc<dyn CallFilter>>,
    state: tokio::sync::Mutex<ClientState>,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl RpcClient {
    /// Creates a client with the default TCP transport and random
    /// balancer. Nothing is dialed until the first call.
    pub fn new(
        config: ClientConfig,
        codecs: Arc<CodecRegistry>,
        resolver: Arc<dyn Resolver>,
    ) -> Arc<Self> {
        Self::with_strategies(
            config,
            codecs,
            resolver,
            Arc::new(RandomBalancer::new()),
            Arc::new(TcpTransport::default()),
            Vec::new(),
        )
    }

    /// Creates a client with explicit balancer, transport, and node
    /// filter chain.
    pub fn with_strategies(
        config: ClientConfig,
        codecs: Arc<CodecRegistry>,
        resolver: Arc<dyn Resolver>,
        balancer: Arc<dyn Balancer>,
        dialer: Arc<dyn Dialer>,
        filters: Vec<Arc<dyn CallFilter>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            codecs,
            dialer,
            resolver,
            balancer,
            filters,
            state: tokio::sync::Mutex::new(ClientState::default()),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn build_node(&self, addr: &str) -> Result<Arc<Node>> {
        let builder = self.codecs.client(&self.config.codec)?;
        Ok(Node::new(
            addr.to_string(),
            self.dialer.clone(),
            builder,
            self.config.connect_timeout,
            self.filters.clone(),
        ))
    }

    // First-use initialization, double-checked: the hot path reads one
    // atomic once the client is up.
    async fn ensure_initialized(self: &Arc<Self>) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let addrs = self.resolver.resolve()?;
        for addr in addrs {
            let mut nodes = Vec::with_capacity(self.config.channels.max(1));
            for _ in 0..self.config.channels.max(1) {
                nodes.push(self.build_node(&addr)?);
            }
            state.entries.push(AddressEntry { addr, nodes });
        }
        self.balancer.update(Self::flatten(&state.entries));

        let (tx, mut rx) = mpsc::channel(8);
        self.resolver.watch(tx);
        let client = self.clone();
        state.watch_task = Some(tokio::spawn(async move {
            while let Some(addrs) = rx.recv().await {
                client.update_addresses(addrs).await;
            }
        }));

        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn flatten(entries: &[AddressEntry]) -> Vec<Arc<Node>> {
        entries
            .iter()
            .flat_map(|e| e.nodes.iter().cloned())
            .collect()
    }

    /// Reconciles the node set against a new address list: unchanged
    /// addresses keep their nodes and live connections, removed
    /// addresses have their nodes closed, added addresses get fresh
    /// nodes. Serialized under the client lock.
    pub async fn update_addresses(&self, addrs: Vec<String>) {
        if addrs.is_empty() {
            tracing::warn!("ignoring empty resolver update");
            return;
        }
        let mut state = self.state.lock().await;

        let mut kept: Vec<AddressEntry> = Vec::with_capacity(addrs.len());
        let mut old: Vec<AddressEntry> = std::mem::take(&mut state.entries);
        for addr in addrs {
            match old.iter().position(|e| e.addr == addr) {
                Some(pos) => kept.push(old.swap_remove(pos)),
                None => {
                    let mut nodes = Vec::with_capacity(self.config.channels.max(1));
                    let mut failed = false;
                    for _ in 0..self.config.channels.max(1) {
                        match self.build_node(&addr) {
                            Ok(node) => nodes.push(node),
                            Err(e) => {
                                tracing::warn!(addr = %addr, error = %e, "node construction failed");
                                failed = true;
                                break;
                            }
                        }
                    }
                    if !failed {
                        tracing::debug!(addr = %addr, "address added");
                        kept.push(AddressEntry { addr, nodes });
                    }
                }
            }
        }
        for entry in old {
            tracing::debug!(addr = %entry.addr, "address removed");
            for node in entry.nodes {
                tokio::spawn(async move { node.close().await });
            }
        }

        state.entries = kept;
        self.balancer.update(Self::flatten(&state.entries));
    }

    /// Snapshot of the current node list in listed order.
    pub async fn nodes(&self) -> Vec<Arc<Node>> {
        Self::flatten(&self.state.lock().await.entries)
    }

    /// Issues one call, applying the configured overall timeout and
    /// fail mode.
    pub async fn call(
        self: &Arc<Self>,
        ctx: &CallContext,
        service: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::ServerClosed);
        }
        self.ensure_initialized().await?;

        let attempt = self.call_with_fail_mode(ctx, service, method, args);
        match self.config.call_timeout {
            Some(t) => tokio::time::timeout(t, attempt)
                .await
                .map_err(|_| RpcError::DeadlineExceeded)?,
            None => attempt.await,
        }
    }

    async fn call_with_fail_mode(
        self: &Arc<Self>,
        ctx: &CallContext,
        service: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let node = self.balancer.next()?;
        let first = node.call(ctx, service, method, args.clone()).await;
        let err = match first {
            Ok(value) => return Ok(value),
            // Application-level failures reached a handler; replaying
            // them would re-run a successful dispatch.
            Err(e) if !e.retryable() => return Err(e),
            Err(e) => e,
        };

        match self.config.fail_mode {
            FailMode::FailFast => Err(err),
            FailMode::FailTry => {
                let mut last = err;
                for attempt in 0..self.config.retries {
                    tracing::debug!(addr = %node.addr(), attempt, "fail-try retry");
                    match node.call(ctx, service, method, args.clone()).await {
                        Ok(value) => return Ok(value),
                        Err(e) if !e.retryable() => return Err(e),
                        Err(e) => last = e,
                    }
                }
                Err(last)
            }
            FailMode::FailOver => {
                let mut last = err;
                let all = self.nodes().await;
                for other in all {
                    if Arc::ptr_eq(&other, &node) {
                        continue;
                    }
                    tracing::debug!(addr = %other.addr(), "fail-over attempt");
                    match other.call(ctx, service, method, args.clone()).await {
                        Ok(value) => return Ok(value),
                        Err(e) if !e.retryable() => return Err(e),
                        Err(e) => last = e,
                    }
                }
                Err(last)
            }
        }
    }

    /// Closes every node and releases the resolver. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().await;
        if let Some(task) = state.watch_task.take() {
            task.abort();
        }
        self.resolver.close();
        for entry in state.entries.drain(..) {
            for node in entry.nodes {
                node.close().await;
            }
        }
        self.balancer.update(Vec::new());
    }
}
