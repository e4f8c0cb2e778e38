//! Action registry: maps `(service, method)` to invocable handlers.
//!
//! Handlers are built at registration time from a closed set of call
//! shapes (0, 1, or 2 positional arguments, with or without a leading
//! call context), each resolved into a fixed invocation thunk that
//! decodes arguments into their declared types. Unsupported shapes are
//! unrepresentable. Filters wrap the thunk at registration, innermost
//! being the real invocation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, RpcError};

/// Boxed future returned by handlers.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Server-side context handed to handlers that asked for one.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    /// Labels carried by the request.
    pub labels: HashMap<String, String>,
    /// Address of the calling peer.
    pub peer_addr: String,
}

/// The invocation thunk every action resolves to.
pub type Handler =
    Arc<dyn Fn(ActionContext, Vec<Value>) -> BoxFuture<Result<Value>> + Send + Sync>;

/// Middleware wrapping a handler. Filters compose at registration time;
/// the first registered filter is outermost.
pub trait Filter: Send + Sync {
    /// Wraps `next`, returning the composed handler.
    fn wrap(&self, next: Handler) -> Handler;
}

/// One registered, invocable service method.
pub struct Action {
    service: String,
    method: String,
    arity: usize,
    handler: Handler,
}

impl Action {
    /// The `service.method` identity.
    pub fn name(&self) -> String {
        format!("{}.{}", self.service, self.method)
    }

    /// Service this action belongs to.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Method name within the service.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Declared number of positional arguments.
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Invokes the filter chain and handler.
    pub async fn invoke(&self, ctx: ActionContext, args: Vec<Value>) -> Result<Value> {
        if args.len() != self.arity {
            return Err(RpcError::InvalidArgument(format!(
                "{} expects {} argument(s), got {}",
                self.name(),
                self.arity,
                args.len()
            )));
        }
        (self.handler)(ctx, args).await
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name())
            .field("arity", &self.arity)
            .finish()
    }
}

/// Registry of actions, immutable once registered.
#[derive(Default)]
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, Arc<Action>>>,
}

impl ActionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one method under `service`, wrapping `handler` with
    /// `filters` (first filter outermost).
    pub fn register(
        &self,
        service: impl Into<String>,
        method: impl Into<String>,
        handler: TypedHandler,
        filters: &[Arc<dyn Filter>],
    ) {
        let service = service.into();
        let method = method.into();
        let mut wrapped = handler.thunk;
        for filter in filters.iter().rev() {
            wrapped = filter.wrap(wrapped);
        }
        let action = Arc::new(Action {
            service: service.clone(),
            method: method.clone(),
            arity: handler.arity,
            handler: wrapped,
        });
        tracing::debug!(action = %action.name(), arity = action.arity, "registered action");
        self.actions
            .write()
            .unwrap()
            .insert(action.name(), action);
    }

    /// Looks up an action by service and method.
    pub fn find(&self, service: &str, method: &str) -> Option<Arc<Action>> {
        self.actions
            .read()
            .unwrap()
            .get(&format!("{service}.{method}"))
            .cloned()
    }

    /// Visits every registered action.
    pub fn range(&self, mut f: impl FnMut(&Arc<Action>)) {
        for action in self.actions.read().unwrap().values() {
            f(action);
        }
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        self.actions.read().unwrap().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.actions.read().unwrap().is_empty()
    }
}

/// A handler thunk paired with its declared arity.
pub struct TypedHandler {
    thunk: Handler,
    arity: usize,
}

impl TypedHandler {
    /// Builds a handler from a raw thunk and arity, for callers that
    /// decode arguments themselves.
    pub fn raw(arity: usize, thunk: Handler) -> Self {
        Self { thunk, arity }
    }
}

fn decode_arg<A: DeserializeOwned>(value: &Value, index: usize) -> Result<A> {
    serde_json::from_value(value.clone())
        .map_err(|e| RpcError::InvalidArgument(format!("argument {index}: {e}")))
}

fn encode_reply<R: Serialize>(reply: R) -> Result<Value> {
    serde_json::to_value(reply).map_err(|e| RpcError::Codec(e.to_string()))
}

/// Nullary handler without context.
pub fn handler0<R, Fut>(f: impl Fn() -> Fut + Send + Sync + 'static) -> TypedHandler
where
    R: Serialize,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    TypedHandler {
        arity: 0,
        thunk: Arc::new(move |_ctx, _args| {
            let fut = f();
            Box::pin(async move { encode_reply(fut.await?) })
        }),
    }
}

/// Unary handler without context.
pub fn handler1<A, R, Fut>(f: impl Fn(A) -> Fut + Send + Sync + 'static) -> TypedHandler
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let f = Arc::new(f);
    TypedHandler {
        arity: 1,
        thunk: Arc::new(move |_ctx, args| {
            let f = f.clone();
            Box::pin(async move {
                let a: A = decode_arg(&args[0], 0)?;
                encode_reply(f(a).await?)
            })
        }),
    }
}

/// Binary handler without context.
pub fn handler2<A, B, R, Fut>(f: impl Fn(A, B) -> Fut + Send + Sync + 'static) -> TypedHandler
where
    A: DeserializeOwned + Send + 'static,
    B: DeserializeOwned + Send + 'static,
    R: Serialize,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let f = Arc::new(f);
    TypedHandler {
        arity: 2,
        thunk: Arc::new(move |_ctx, args| {
            let f = f.clone();
            Box::pin(async move {
                let a: A = decode_arg(&args[0], 0)?;
                let b: B = decode_arg(&args[1], 1)?;
                encode_reply(f(a, b).await?)
            })
        }),
    }
}

/// Nullary handler taking the call context.
pub fn handler0_ctx<R, Fut>(
    f: impl Fn(ActionContext) -> Fut + Send + Sync + 'static,
) -> TypedHandler
where
    R: Serialize,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let f = Arc::new(f);
    TypedHandler {
        arity: 0,
        thunk: Arc::new(move |ctx, _args| {
            let fut = f(ctx);
            Box::pin(async move { encode_reply(fut.await?) })
        }),
    }
}

/// Unary handler taking the call context.
pub fn handler1_ctx<A, R, Fut>(
    f: impl Fn(ActionContext, A) -> Fut + Send + Sync + 'static,
) -> TypedHandler
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let f = Arc::new(f);
    TypedHandler {
        arity: 1,
        thunk: Arc::new(move |ctx, args| {
            let f = f.clone();
            Box::pin(async move {
                let a: A = decode_arg(&args[0], 0)?;
                encode_reply(f(ctx, a).await?)
            })
        }),
    }
}

/// Binary handler taking the call context.
pub fn handler2_ctx<A, B, R, Fut>(
    f: impl Fn(ActionContext, A, B) -> Fut + Send + Sync + 'static,
) -> TypedHandler
where
    A: DeserializeOwned + Send + 'static,
    B: DeserializeOwned + Send + 'static,
    R: Serialize,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    let f = Arc::new(f);
    TypedHandler {
        arity: 2,
        thunk: Arc::new(move |ctx, args| {
            let f = f.clone();
            Box::pin(async move {
                let a: A = decode_arg(&args[0], 0)?;
                let b: B = decode_arg(&args[1], 1)?;
                encode_reply(f(ctx, a, b).await?)
            })
        }),
    }
}

/// Registers a batch of methods under one service with a shared filter
/// chain, mirroring whole-service registration.
pub struct ServiceBuilder {
    service: String,
    filters: Vec<Arc<dyn Filter>>,
    methods: Vec<(String, TypedHandler)>,
}

impl ServiceBuilder {
    /// Starts a builder for `service`.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            filters: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Adds a filter applied to every method of this service.
    pub fn filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Adds a method.
    pub fn method(mut self, name: impl Into<String>, handler: TypedHandler) -> Self {
        self.methods.push((name.into(), handler));
        self
    }

    /// Registers every method into `registry`.
    pub fn register(self, registry: &ActionRegistry) {
        for (name, handler) in self.methods {
            registry.register(self.service.clone(), name, handler, &self.filters);
        }
    }
}
