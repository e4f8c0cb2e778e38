//! ferrite-rpc: a small service-oriented RPC runtime.
//!
//! Services register named actions; clients resolve server addresses,
//! balance calls across connections, and apply a configurable failure
//! policy (fail-fast, fail-try, fail-over). Wire formats are pluggable
//! codecs selected by name on the client and by content sniffing on the
//! server; a newline-delimited JSON codec is built in. Both sides
//! exchange id-0 heartbeat frames so the server can close silent
//! connections.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ferrite_rpc::{
//!     handler1, ActionRegistry, CallContext, ClientConfig, CodecRegistry,
//!     RpcClient, RpcServer, ServerConfig, ServiceBuilder, StaticResolver,
//! };
//!
//! # async fn run() -> ferrite_rpc::Result<()> {
//! let actions = ActionRegistry::new();
//! ServiceBuilder::new("Echo")
//!     .method("Upper", handler1(|s: String| async move { Ok(s.to_uppercase()) }))
//!     .register(&actions);
//!
//! let codecs = Arc::new(CodecRegistry::with_json());
//! let server = RpcServer::new(ServerConfig::default(), Arc::new(actions), codecs.clone());
//! let bound = server.serve_tcp(&["127.0.0.1:0".to_string()]).await?;
//!
//! let client = RpcClient::new(
//!     ClientConfig::default(),
//!     codecs,
//!     Arc::new(StaticResolver::new(bound)),
//! );
//! let out = client
//!     .call(&CallContext::new(), "Echo", "Upper", vec!["hi".into()])
//!     .await?;
//! assert_eq!(out, "HI");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod action;
pub mod balancer;
pub mod call;
pub mod client;
pub mod codec;
pub mod context;
pub mod error;
pub mod json;
pub mod message;
pub mod node;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod session;
pub mod transport;

pub use action::{
    handler0, handler0_ctx, handler1, handler1_ctx, handler2, handler2_ctx, Action, ActionContext,
    ActionRegistry, Filter, Handler, ServiceBuilder, TypedHandler,
};
pub use balancer::{Balancer, RandomBalancer, RoundRobinBalancer};
pub use call::{Call, CallContext, CallPool};
pub use client::{ClientConfig, FailMode, RpcClient};
pub use codec::{ClientCodec, CodecEntry, CodecRegistry, Matcher, ServerCodec};
pub use context::{Context, ContextPool};
pub use error::{CodedError, Result, RpcError, Status};
pub use json::{JsonClientCodec, JsonServerCodec, JSON_CODEC_NAME};
pub use message::{Request, RequestHead, Response, ResponseHead, HEARTBEAT_ID};
pub use node::{CallFilter, Node, NodeState};
pub use registry::{NoopRegistry, Registry};
pub use resolver::{ManualResolver, Resolver, StaticResolver};
pub use server::{RpcServer, ServerConfig};
pub use session::Session;
pub use transport::{Dialer, IoStream, Listener, TcpTransport, TcpTransportConfig};
