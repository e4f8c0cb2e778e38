//! One managed client-side connection to one remote endpoint.
//!
//! A node is created idle, dialed lazily on first call, and terminal
//! once shut down; a replacement node is constructed instead of
//! resurrecting a dead one. Each ready node runs a single read loop
//! task that matches response ids against the call pool.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::call::{CallContext, CallPool};
use crate::codec::{ClientCodec, ClientCodecBuilder};
use crate::error::{Result, RpcError};
use crate::message::{Request, HEARTBEAT_ID};
use crate::transport::Dialer;

const STATE_IDLE: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_SHUTDOWN: u8 = 2;

/// Connection lifecycle state. Transitions are monotonic:
/// idle -> ready -> shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Constructed, not yet dialed.
    Idle,
    /// Connected, read loop running.
    Ready,
    /// Terminal; all pending calls were resolved with node-shutdown.
    Shutdown,
}

impl From<u8> for NodeState {
    fn from(raw: u8) -> Self {
        match raw {
            STATE_READY => NodeState::Ready,
            STATE_SHUTDOWN => NodeState::Shutdown,
            _ => NodeState::Idle,
        }
    }
}

/// The send-and-wait invocation a call filter wraps.
pub type CallHandler =
    Arc<dyn Fn(Request) -> crate::action::BoxFuture<Result<Value>> + Send + Sync>;

/// Client-side middleware around a node's send-and-wait path. The first
/// filter in a node's chain is outermost.
pub trait CallFilter: Send + Sync {
    /// Wraps `next`, returning the composed handler.
    fn wrap(&self, next: CallHandler) -> CallHandler;
}

/// One managed connection to one remote endpoint.
pub struct Node {
    addr: String,
    state: AtomicU8,
    dialer: Arc<dyn Dialer>,
    codec_builder: ClientCodecBuilder,
    connect_timeout: Duration,
    codec: Mutex<Option<Arc<dyn ClientCodec>>>,
    pool: Arc<CallPool>,
    filters: Vec<Arc<dyn CallFilter>>,
    init_lock: tokio::sync::Mutex<()>,
}

impl Node {
    /// Creates an idle node for `addr`. Dialing is deferred to the
    /// first call.
    pub fn new(
        addr: String,
        dialer: Arc<dyn Dialer>,
        codec_builder: ClientCodecBuilder,
        connect_timeout: Duration,
        filters: Vec<Arc<dyn CallFilter>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            addr,
            state: AtomicU8::new(STATE_IDLE),
            dialer,
            codec_builder,
            connect_timeout,
            codec: Mutex::new(None),
            pool: Arc::new(CallPool::new()),
            filters,
            init_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The endpoint address this node manages.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        NodeState::from(self.state.load(Ordering::SeqCst))
    }

    /// Number of calls currently in flight on this node.
    pub fn pending(&self) -> usize {
        self.pool.pending_count()
    }

    /// Dials and starts the read loop if this node is still idle.
    /// Re-entrant calls while ready are no-ops.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        match self.state() {
            NodeState::Ready => return Ok(()),
            NodeState::Shutdown => return Err(RpcError::NodeShutdown),
            NodeState::Idle => {}
        }
        let _guard = self.init_lock.lock().await;
        match self.state() {
            NodeState::Ready => return Ok(()),
            NodeState::Shutdown => return Err(RpcError::NodeShutdown),
            NodeState::Idle => {}
        }

        let io = self.dialer.dial(&self.addr, self.connect_timeout).await?;
        let codec = (self.codec_builder)(io);
        *self.codec.lock().unwrap() = Some(codec.clone());

        // Ready must be published before the read loop exists: an
        // immediately dead connection drives the loop into close(),
        // and that shutdown is terminal, never overwritten.
        self.state.store(STATE_READY, Ordering::SeqCst);

        let node = self.clone();
        tokio::spawn(async move {
            node.read_loop(codec).await;
        });

        tracing::debug!(addr = %self.addr, "node ready");
        Ok(())
    }

    /// Issues one call on this node: acquire, encode, wait for the
    /// completion signal or the caller's cancellation/deadline.
    pub async fn call(
        self: &Arc<Self>,
        ctx: &CallContext,
        service: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.initialize().await?;
        let codec = self
            .codec
            .lock()
            .unwrap()
            .clone()
            .ok_or(RpcError::NodeShutdown)?;

        let mut handler = self.send_and_wait(codec, ctx.clone());
        for filter in self.filters.iter().rev() {
            handler = filter.wrap(handler);
        }

        let mut req = Request::default();
        req.service = service.to_string();
        req.method = method.to_string();
        req.labels = ctx.labels.clone();
        req.args = args;
        handler(req).await
    }

    // Terminal call handler: the id is assigned here, under acquisition.
    fn send_and_wait(&self, codec: Arc<dyn ClientCodec>, ctx: CallContext) -> CallHandler {
        let pool = self.pool.clone();
        Arc::new(move |mut req: Request| {
            let pool = pool.clone();
            let codec = codec.clone();
            let ctx = ctx.clone();
            Box::pin(async move {
                let (call, mut done) = pool.acquire();
                req.id = call.id();
                if let Err(e) = codec.encode(&req).await {
                    pool.release(&call);
                    return Err(e);
                }

                let wait = async {
                    match (&mut done).await {
                        Ok(outcome) => outcome,
                        // Sender dropped without completion: pool cleared.
                        Err(_) => Err(RpcError::NodeShutdown),
                    }
                };
                let result = if let Some(t) = ctx.timeout {
                    tokio::select! {
                        r = wait => r,
                        _ = ctx.cancelled() => Err(RpcError::Canceled),
                        _ = tokio::time::sleep(t) => Err(RpcError::DeadlineExceeded),
                    }
                } else {
                    tokio::select! {
                        r = wait => r,
                        _ = ctx.cancelled() => Err(RpcError::Canceled),
                    }
                };

                match &result {
                    // An abandoned wait leaves the call pending: a late
                    // response, node shutdown, or process exit reclaims it.
                    Err(RpcError::Canceled) | Err(RpcError::DeadlineExceeded) => {}
                    _ => pool.release(&call),
                }
                result
            })
        })
    }

    async fn read_loop(self: Arc<Self>, codec: Arc<dyn ClientCodec>) {
        loop {
            let head = match codec.decode_head().await {
                Ok(head) => head,
                Err(e) => {
                    if self.state() != NodeState::Shutdown {
                        tracing::debug!(addr = %self.addr, error = %e, "read loop ended");
                    }
                    break;
                }
            };

            if head.id == HEARTBEAT_ID {
                let _ = codec.discard_result().await;
                if codec.encode(&Request::heartbeat()).await.is_err() {
                    break;
                }
                continue;
            }

            if !self.pool.find(head.id) {
                tracing::warn!(addr = %self.addr, id = head.id, "late response discarded");
                let _ = codec.discard_result().await;
                continue;
            }

            match head.error {
                Some(coded) => {
                    let _ = codec.discard_result().await;
                    self.pool.finish(head.id, Err(RpcError::from(coded)));
                }
                None => match codec.decode_result().await {
                    Ok(value) => {
                        self.pool.finish(head.id, Ok(value));
                    }
                    Err(e) => {
                        // A corrupt result is connection-fatal.
                        tracing::warn!(addr = %self.addr, error = %e, "result decode failed");
                        self.pool.finish(head.id, Err(e));
                        break;
                    }
                },
            }
        }
        self.close().await;
    }

    /// Shuts this node down: terminal state, pending calls resolved
    /// with node-shutdown, write half closed. Idempotent.
    pub async fn close(&self) {
        let prev = self.state.swap(STATE_SHUTDOWN, Ordering::SeqCst);
        if prev == STATE_SHUTDOWN {
            return;
        }
        tracing::debug!(addr = %self.addr, pending = self.pool.pending_count(), "node shutdown");
        let codec = self.codec.lock().unwrap().take();
        self.pool.clear(|_| Err(RpcError::NodeShutdown));
        if let Some(codec) = codec {
            codec.close().await;
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}
