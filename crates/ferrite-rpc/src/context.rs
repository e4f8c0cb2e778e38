//! Pooled per-request scratch object for the server dispatch path.
//!
//! A context is bound to exactly one in-flight request at a time and
//! returned to its pool only after the response has been encoded.

use std::sync::{Arc, Mutex};

use crate::action::Action;
use crate::message::{Request, Response};

/// Per-request scratch: the decoded request, the response being built,
/// and the resolved action.
#[derive(Default)]
pub struct Context {
    /// The decoded request.
    pub req: Request,
    /// The response under construction.
    pub resp: Response,
    /// The resolved action, if lookup succeeded.
    pub action: Option<Arc<Action>>,
    /// Address of the calling peer.
    pub peer_addr: String,
}

impl Context {
    fn reset(&mut self) {
        self.req = Request::default();
        self.resp = Response::default();
        self.action = None;
        self.peer_addr.clear();
    }
}

/// Free-list pool of contexts, capped to bound idle memory.
pub struct ContextPool {
    free: Mutex<Vec<Box<Context>>>,
    cap: usize,
}

impl Default for ContextPool {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ContextPool {
    /// Creates a pool retaining at most `cap` idle contexts.
    pub fn new(cap: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            cap,
        }
    }

    /// Takes a context from the pool, or allocates a fresh one.
    pub fn acquire(&self) -> Box<Context> {
        self.free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_default()
    }

    /// Returns a context after its response was fully encoded.
    pub fn release(&self, mut ctx: Box<Context>) {
        ctx.reset();
        let mut free = self.free.lock().unwrap();
        if free.len() < self.cap {
            free.push(ctx);
        }
    }

    /// Number of idle contexts currently pooled.
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}
