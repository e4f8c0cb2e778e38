//! RPC server: accepts connections, matches codecs, dispatches decoded
//! requests to the action registry, enforces heartbeat timeouts, and
//! drains in-flight work on shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::{watch, Notify};

use crate::action::{Action, ActionContext, ActionRegistry};
use crate::codec::{CodecRegistry, PeekStream, ServerCodec};
use crate::context::ContextPool;
use crate::error::{Result, RpcError};
use crate::message::{RequestHead, Response, HEARTBEAT_ID};
use crate::registry::{NoopRegistry, Registry};
use crate::session::Session;
use crate::transport::{BoxedReader, IoStream, Listener, TcpTransport};

// Bytes sniffed from a new connection for codec matching.
const SNIFF_LEN: usize = 16;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Heartbeat push/sweep interval; `None` disables liveness sweeps.
    pub heartbeat_interval: Option<Duration>,
    /// Slack added to the interval before a silent session is closed.
    pub heartbeat_slack: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: None,
            heartbeat_slack: Duration::from_secs(3),
        }
    }
}

/// RPC server over one or more listeners.
pub struct RpcServer {
    config: ServerConfig,
    actions: Arc<ActionRegistry>,
    codecs: Arc<CodecRegistry>,
    registry: Arc<dyn Registry>,
    contexts: ContextPool,
    sessions: RwLock<HashMap<u64, Arc<Session>>>,
    next_session: AtomicU64,
    serving: AtomicBool,
    draining: AtomicBool,
    inflight: AtomicUsize,
    drained: Notify,
    shutdown_tx: watch::Sender<bool>,
}

impl RpcServer {
    /// Creates a server that publishes nowhere (no-op registry).
    pub fn new(
        config: ServerConfig,
        actions: Arc<ActionRegistry>,
        codecs: Arc<CodecRegistry>,
    ) -> Arc<Self> {
        Self::with_registry(config, actions, codecs, Arc::new(NoopRegistry))
    }

    /// Creates a server publishing its addresses through `registry`.
    pub fn with_registry(
        config: ServerConfig,
        actions: Arc<ActionRegistry>,
        codecs: Arc<CodecRegistry>,
        registry: Arc<dyn Registry>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            actions,
            codecs,
            registry,
            contexts: ContextPool::default(),
            sessions: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            serving: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            inflight: AtomicUsize::new(0),
            drained: Notify::new(),
            shutdown_tx,
        })
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Number of requests currently dispatched and not yet answered.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Whether the server is draining.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Starts serving on the given listeners. One-shot: a second call
    /// fails. Spawns one accept loop per listener plus the heartbeat
    /// sweeper, then returns; the first fatal accept error shuts the
    /// whole server down.
    pub async fn serve(self: &Arc<Self>, listeners: Vec<Box<dyn Listener>>) -> Result<()> {
        if self
            .serving
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RpcError::AlreadyServing);
        }
        self.registry.register().await?;

        if let Some(interval) = self.config.heartbeat_interval {
            let server = self.clone();
            tokio::spawn(async move { server.heartbeat_sweeper(interval).await });
        }
        for listener in listeners {
            let server = self.clone();
            tokio::spawn(async move { server.accept_loop(listener).await });
        }
        Ok(())
    }

    /// Binds TCP listeners on `addrs` and serves on them. Returns the
    /// bound local addresses, useful with port 0.
    pub async fn serve_tcp(self: &Arc<Self>, addrs: &[String]) -> Result<Vec<String>> {
        let transport = TcpTransport::default();
        let mut listeners: Vec<Box<dyn Listener>> = Vec::with_capacity(addrs.len());
        let mut bound = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let listener = transport.listen(addr).await?;
            bound.push(listener.local_addr());
            listeners.push(Box::new(listener));
        }
        self.serve(listeners).await?;
        Ok(bound)
    }

    async fn accept_loop(self: Arc<Self>, mut listener: Box<dyn Listener>) {
        let local = listener.local_addr();
        let mut shutdown = self.shutdown_tx.subscribe();
        tracing::info!(addr = %local, "listening");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(io) => {
                        let server = self.clone();
                        tokio::spawn(async move { server.handle_connection(io).await });
                    }
                    Err(e) => {
                        tracing::error!(addr = %local, error = %e, "accept failed, shutting down");
                        let server = self.clone();
                        tokio::spawn(async move { server.close(None).await });
                        break;
                    }
                },
            }
        }
        tracing::debug!(addr = %local, "accept loop ended");
    }

    async fn handle_connection(self: Arc<Self>, mut io: IoStream) {
        let mut peek = vec![0u8; SNIFF_LEN];
        let n = match io.reader.read(&mut peek).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        peek.truncate(n);

        let Some(entry) = self.codecs.match_server(&peek).cloned() else {
            tracing::warn!(peer = %io.peer_addr, "no codec matched, dropping connection");
            return;
        };
        let reader: BoxedReader = Box::new(PeekStream::new(peek, io.reader));
        let codec = (entry.server)(IoStream {
            reader,
            writer: io.writer,
            peer_addr: io.peer_addr.clone(),
        });

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id, codec.clone(), io.peer_addr.clone()));
        {
            // Shutdown drains the session map under this lock; a
            // connection that arrives after the final drain must not
            // outlive the server.
            let mut sessions = self.sessions.write().unwrap();
            if self.draining.load(Ordering::SeqCst) {
                drop(sessions);
                tracing::debug!(session = id, peer = %io.peer_addr, "draining, connection refused");
                session.close().await;
                return;
            }
            sessions.insert(id, session.clone());
        }
        tracing::debug!(session = id, peer = %io.peer_addr, codec = %entry.name, "connection accepted");

        self.decode_loop(&session, codec).await;

        self.sessions.write().unwrap().remove(&id);
        session.close().await;
    }

    async fn decode_loop(self: &Arc<Self>, session: &Arc<Session>, codec: Arc<dyn ServerCodec>) {
        loop {
            let head = match codec.decode_head().await {
                Ok(head) => head,
                Err(e) => {
                    tracing::debug!(session = session.id(), error = %e, "decode loop ended");
                    break;
                }
            };
            if session.is_closed() {
                break;
            }

            if head.id == HEARTBEAT_ID {
                session.touch();
                let _ = codec.discard_args().await;
                continue;
            }

            // New requests on an already-accepted connection degrade to
            // an immediate server-closed response while draining.
            if self.draining.load(Ordering::SeqCst) {
                let _ = codec.discard_args().await;
                let _ = codec
                    .encode(&Response::fail(head.id, RpcError::ServerClosed.to_coded()))
                    .await;
                continue;
            }

            let Some(action) = self.actions.find(&head.service, &head.method) else {
                let _ = codec.discard_args().await;
                let err = RpcError::MethodNotFound {
                    service: head.service.clone(),
                    method: head.method.clone(),
                };
                if codec
                    .encode(&Response::fail(head.id, err.to_coded()))
                    .await
                    .is_err()
                {
                    break;
                }
                continue;
            };

            let args = match codec.decode_args().await {
                Ok(args) => args,
                Err(e) => {
                    let err = RpcError::InvalidArgument(e.to_string());
                    let _ = codec
                        .encode(&Response::fail(head.id, err.to_coded()))
                        .await;
                    continue;
                }
            };

            self.inflight.fetch_add(1, Ordering::SeqCst);
            let server = self.clone();
            let codec = codec.clone();
            let peer = session.peer_addr().to_string();
            tokio::spawn(async move {
                server.dispatch(codec, peer, head, action, args).await;
            });
        }
    }

    async fn dispatch(
        self: Arc<Self>,
        codec: Arc<dyn ServerCodec>,
        peer: String,
        head: RequestHead,
        action: Arc<Action>,
        args: Vec<serde_json::Value>,
    ) {
        let mut ctx = self.contexts.acquire();
        ctx.req.id = head.id;
        ctx.req.service = head.service;
        ctx.req.method = head.method;
        ctx.req.labels = head.labels;
        ctx.req.args = args;
        ctx.peer_addr = peer;
        ctx.action = Some(action.clone());

        let action_ctx = ActionContext {
            labels: ctx.req.labels.clone(),
            peer_addr: ctx.peer_addr.clone(),
        };
        let invoke_args = std::mem::take(&mut ctx.req.args);
        let id = ctx.req.id;

        // The handler runs in its own task so a panic is contained to
        // this one request and surfaces as a join error here.
        let invocation = {
            let action = action.clone();
            tokio::spawn(async move { action.invoke(action_ctx, invoke_args).await })
        };
        let result = match invocation.await {
            Ok(result) => result,
            Err(join) if join.is_panic() => {
                tracing::error!(action = %action.name(), "handler panicked");
                Err(RpcError::Handler(format!(
                    "panic in handler {}",
                    action.name()
                )))
            }
            Err(_) => Err(RpcError::Canceled),
        };

        ctx.resp = match result {
            Ok(value) => Response::ok(id, value),
            Err(e) => Response::fail(id, e.to_coded()),
        };
        if let Err(e) = codec.encode(&ctx.resp).await {
            tracing::warn!(id, error = %e, "response encode failed");
        }
        self.contexts.release(ctx);

        if self.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_one();
        }
    }

    async fn heartbeat_sweeper(self: Arc<Self>, interval: Duration) {
        let threshold = interval + self.config.heartbeat_slack;
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // first tick completes immediately
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            let snapshot: Vec<Arc<Session>> =
                self.sessions.read().unwrap().values().cloned().collect();
            for session in snapshot {
                if session.last_heartbeat().elapsed() > threshold {
                    tracing::warn!(
                        session = session.id(),
                        peer = %session.peer_addr(),
                        "heartbeat timeout, closing session"
                    );
                    self.sessions.write().unwrap().remove(&session.id());
                    session.close().await;
                } else if session.push_heartbeat().await.is_err() {
                    tracing::debug!(session = session.id(), "heartbeat push failed");
                }
            }
        }
    }

    /// Drains and shuts down. One-shot; later calls return at once.
    ///
    /// Stops accepting, waits for in-flight dispatched requests, then
    /// closes every remaining session. `None` or a zero timeout waits
    /// unboundedly; a non-zero timeout gives up once it elapses and
    /// closes anyway.
    pub async fn close(&self, timeout: Option<Duration>) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(inflight = self.inflight(), "server draining");
        if let Err(e) = self.registry.offline().await {
            tracing::warn!(error = %e, "registry offline failed");
        }
        let _ = self.shutdown_tx.send(true);

        let wait_drain = async {
            loop {
                if self.inflight.load(Ordering::SeqCst) == 0 {
                    break;
                }
                self.drained.notified().await;
            }
        };
        match timeout {
            Some(t) if !t.is_zero() => {
                if tokio::time::timeout(t, wait_drain).await.is_err() {
                    tracing::warn!(inflight = self.inflight(), "drain timed out, closing anyway");
                }
            }
            _ => wait_drain.await,
        }

        let sessions: Vec<Arc<Session>> =
            self.sessions.write().unwrap().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
        if let Err(e) = self.registry.close().await {
            tracing::warn!(error = %e, "registry close failed");
        }
        tracing::info!("server closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{handler1, ServiceBuilder};
    use crate::balancer::RoundRobinBalancer;
    use crate::call::CallContext;
    use crate::client::{ClientConfig, FailMode, RpcClient};
    use crate::error::Status;
    use crate::resolver::StaticResolver;
    use serde_json::Value;

    fn echo_registry() -> Arc<ActionRegistry> {
        let actions = ActionRegistry::new();
        ServiceBuilder::new("Echo")
            .method(
                "Upper",
                handler1(|s: String| async move { Ok(s.to_uppercase()) }),
            )
            .method(
                "Slow",
                handler1(|s: String| async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(s.to_uppercase())
                }),
            )
            .method(
                "Panic",
                handler1(|s: String| async move {
                    if s != "never" {
                        panic!("boom");
                    }
                    Ok(s)
                }),
            )
            .register(&actions);
        Arc::new(actions)
    }

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    async fn start_server(config: ServerConfig) -> (Arc<RpcServer>, String) {
        init_logging();
        let server = RpcServer::new(
            config,
            echo_registry(),
            Arc::new(CodecRegistry::with_json()),
        );
        let bound = server
            .serve_tcp(&["127.0.0.1:0".to_string()])
            .await
            .unwrap();
        (server, bound[0].clone())
    }

    fn client_for(addrs: Vec<String>, fail_mode: FailMode) -> Arc<RpcClient> {
        let config = ClientConfig {
            fail_mode,
            connect_timeout: Duration::from_millis(500),
            ..ClientConfig::default()
        };
        RpcClient::with_strategies(
            config,
            Arc::new(CodecRegistry::with_json()),
            Arc::new(StaticResolver::new(addrs)),
            Arc::new(RoundRobinBalancer::new()),
            Arc::new(TcpTransport::default()),
            Vec::new(),
        )
    }

    fn dead_addr() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn test_echo_upper_end_to_end() {
        let (_server, addr) = start_server(ServerConfig::default()).await;
        let client = client_for(vec![addr], FailMode::FailFast);
        let out = client
            .call(&CallContext::new(), "Echo", "Upper", vec![Value::from("hi")])
            .await
            .unwrap();
        assert_eq!(out, Value::from("HI"));
        client.close().await;
    }

    #[tokio::test]
    async fn test_serve_is_one_shot() {
        let (server, _addr) = start_server(ServerConfig::default()).await;
        let err = server.serve(Vec::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::AlreadyServing));
    }

    #[tokio::test]
    async fn test_method_not_found() {
        let (_server, addr) = start_server(ServerConfig::default()).await;
        let client = client_for(vec![addr], FailMode::FailFast);
        let err = client
            .call(&CallContext::new(), "Echo", "Missing", vec![Value::from("x")])
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::MethodNotFound);
        client.close().await;
    }

    #[tokio::test]
    async fn test_invalid_argument_type() {
        let (_server, addr) = start_server(ServerConfig::default()).await;
        let client = client_for(vec![addr], FailMode::FailFast);
        let err = client
            .call(&CallContext::new(), "Echo", "Upper", vec![Value::from(42)])
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);
        client.close().await;
    }

    #[tokio::test]
    async fn test_handler_panic_is_request_local() {
        let (_server, addr) = start_server(ServerConfig::default()).await;
        let client = client_for(vec![addr], FailMode::FailFast);

        let err = client
            .call(&CallContext::new(), "Echo", "Panic", vec![Value::from("x")])
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::Unknown);

        // The connection survived the panic.
        let out = client
            .call(&CallContext::new(), "Echo", "Upper", vec![Value::from("ok")])
            .await
            .unwrap();
        assert_eq!(out, Value::from("OK"));
        client.close().await;
    }

    #[tokio::test]
    async fn test_fail_over_reaches_live_node_in_order() {
        let (_server, live) = start_server(ServerConfig::default()).await;
        let addrs = vec![dead_addr(), dead_addr(), live];
        let client = client_for(addrs, FailMode::FailOver);
        // Round-robin starts at the first (dead) node; fail-over then
        // walks the remaining nodes in listed order.
        let out = client
            .call(&CallContext::new(), "Echo", "Upper", vec![Value::from("hi")])
            .await
            .unwrap();
        assert_eq!(out, Value::from("HI"));
        client.close().await;
    }

    #[tokio::test]
    async fn test_fail_fast_does_not_touch_other_nodes() {
        let (server, live) = start_server(ServerConfig::default()).await;
        let addrs = vec![dead_addr(), live];
        let client = client_for(addrs, FailMode::FailFast);
        let err = client
            .call(&CallContext::new(), "Echo", "Upper", vec![Value::from("hi")])
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::NodeUnavailable);
        // The live server never saw a connection.
        assert_eq!(server.session_count(), 0);
        client.close().await;
    }

    #[tokio::test]
    async fn test_fail_try_retries_same_node() {
        let addrs = vec![dead_addr()];
        let client = client_for(addrs, FailMode::FailTry);
        let err = client
            .call(&CallContext::new(), "Echo", "Upper", vec![Value::from("hi")])
            .await
            .unwrap_err();
        // All attempts exhausted against the one dead node.
        assert_eq!(err.status(), Status::NodeUnavailable);
        client.close().await;
    }

    #[tokio::test]
    async fn test_graceful_close_waits_for_inflight() {
        let (server, addr) = start_server(ServerConfig::default()).await;
        let client = client_for(vec![addr], FailMode::FailFast);

        let inflight = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call(&CallContext::new(), "Echo", "Slow", vec![Value::from("hi")])
                    .await
            })
        };
        // Let the slow call reach the server.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.inflight(), 1);

        // Zero timeout still waits for dispatched work.
        server.close(Some(Duration::ZERO)).await;
        let out = inflight.await.unwrap().unwrap();
        assert_eq!(out, Value::from("HI"));
        assert_eq!(server.inflight(), 0);
        client.close().await;
    }

    #[tokio::test]
    async fn test_draining_rejects_new_requests_with_server_closed() {
        let (server, addr) = start_server(ServerConfig::default()).await;
        let client = client_for(vec![addr], FailMode::FailFast);

        let slow = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call(&CallContext::new(), "Echo", "Slow", vec![Value::from("hi")])
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let closer = {
            let server = server.clone();
            tokio::spawn(async move { server.close(None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.is_draining());

        // A new request on the already-accepted connection is answered
        // with server-closed rather than silently dropped.
        let err = client
            .call(&CallContext::new(), "Echo", "Upper", vec![Value::from("x")])
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::ServerClosed);

        let out = slow.await.unwrap().unwrap();
        assert_eq!(out, Value::from("HI"));
        closer.await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn test_connection_arriving_after_close_is_shut_down() {
        let server = RpcServer::new(
            ServerConfig::default(),
            echo_registry(),
            Arc::new(CodecRegistry::with_json()),
        );
        server.close(None).await;

        // A connection handed over after the final session sweep must
        // not linger in the session set.
        use tokio::io::AsyncWriteExt;
        let (a, b) = tokio::io::duplex(256);
        let (ar, aw) = tokio::io::split(a);
        let (_br, mut bw) = tokio::io::split(b);
        bw.write_all(b"{\"id\":0}\n").await.unwrap();
        bw.flush().await.unwrap();

        server
            .clone()
            .handle_connection(IoStream {
                reader: Box::new(ar),
                writer: Box::new(aw),
                peer_addr: "late".into(),
            })
            .await;
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_closes_silent_session() {
        let config = ServerConfig {
            heartbeat_interval: Some(Duration::from_millis(50)),
            heartbeat_slack: Duration::from_millis(50),
        };
        let (server, addr) = start_server(config).await;

        // Speak one heartbeat so the codec matches, then go silent.
        use tokio::io::AsyncWriteExt;
        let mut raw = tokio::net::TcpStream::connect(&addr).await.unwrap();
        raw.write_all(b"{\"id\":0}\n").await.unwrap();
        raw.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.session_count(), 1);

        // interval + slack elapses without another heartbeat.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_heartbeating_client_session_survives() {
        let config = ServerConfig {
            heartbeat_interval: Some(Duration::from_millis(50)),
            heartbeat_slack: Duration::from_millis(50),
        };
        let (server, addr) = start_server(config).await;
        let client = client_for(vec![addr], FailMode::FailFast);

        // Establish the connection; the node's read loop answers pushes.
        client
            .call(&CallContext::new(), "Echo", "Upper", vec![Value::from("x")])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(server.session_count(), 1);
        client.close().await;
    }

    #[tokio::test]
    async fn test_unmatched_codec_is_dropped() {
        let (server, addr) = start_server(ServerConfig::default()).await;
        use tokio::io::AsyncWriteExt;
        let mut raw = tokio::net::TcpStream::connect(&addr).await.unwrap();
        raw.write_all(b"\x00\x01\x02binary garbage").await.unwrap();
        raw.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.session_count(), 0);
    }
}
