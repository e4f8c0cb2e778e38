//! In-flight call tracking: the per-node call pool and the caller-side
//! call context.
//!
//! The pool is an arena of reusable slots with an index-based free list.
//! Acquiring a call pops a free slot (or grows the arena) and inserts it
//! into the pending-by-id map under the same critical section, so a
//! concurrent lookup never observes a half-initialized call. Release is
//! guarded by a single atomic transition per acquisition, making it
//! idempotent under races between the read loop and an abandoning caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::sync::Notify;

use crate::error::Result;

/// Outcome delivered to the caller waiting on a call.
pub type CallOutcome = Result<Value>;

/// Handle for one acquired in-flight call.
pub struct Call {
    id: u64,
    slot: usize,
    released: Arc<AtomicBool>,
}

impl Call {
    /// The call id, unique per pool for the lifetime of the process.
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct Slot {
    id: u64,
    tx: Option<oneshot::Sender<CallOutcome>>,
    released: Arc<AtomicBool>,
    next_free: Option<usize>,
}

struct PoolInner {
    slots: Vec<Slot>,
    free_head: Option<usize>,
    pending: HashMap<u64, usize>,
}

/// Per-node registry of in-flight calls.
pub struct CallPool {
    inner: RwLock<PoolInner>,
    next_id: AtomicU64,
}

impl Default for CallPool {
    fn default() -> Self {
        Self::new()
    }
}

impl CallPool {
    /// Creates an empty pool. Ids start at 1; 0 is the heartbeat marker.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                slots: Vec::new(),
                free_head: None,
                pending: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Acquires a call with a fresh id, reusing a freed slot if one
    /// exists. Returns the call handle and the receiver its outcome
    /// will arrive on.
    pub fn acquire(&self) -> (Call, oneshot::Receiver<CallOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let released = Arc::new(AtomicBool::new(false));

        let mut inner = self.inner.write().unwrap();
        let slot = match inner.free_head {
            Some(slot) => {
                inner.free_head = inner.slots[slot].next_free.take();
                let entry = &mut inner.slots[slot];
                entry.id = id;
                entry.tx = Some(tx);
                entry.released = released.clone();
                slot
            }
            None => {
                inner.slots.push(Slot {
                    id,
                    tx: Some(tx),
                    released: released.clone(),
                    next_free: None,
                });
                inner.slots.len() - 1
            }
        };
        inner.pending.insert(id, slot);

        (Call { id, slot, released }, rx)
    }

    /// Whether `id` is currently pending.
    pub fn find(&self, id: u64) -> bool {
        self.inner.read().unwrap().pending.contains_key(&id)
    }

    /// Number of currently pending calls.
    pub fn pending_count(&self) -> usize {
        self.inner.read().unwrap().pending.len()
    }

    /// Completes the pending call `id` with `outcome` and returns its
    /// slot to the free list. Returns false for unknown (late) ids.
    pub fn finish(&self, id: u64, outcome: CallOutcome) -> bool {
        let (tx, slot, released) = {
            let mut inner = self.inner.write().unwrap();
            let Some(slot) = inner.pending.remove(&id) else {
                return false;
            };
            let entry = &mut inner.slots[slot];
            (entry.tx.take(), slot, entry.released.clone())
        };
        if let Some(tx) = tx {
            // The receiver may be gone if the caller abandoned its wait.
            let _ = tx.send(outcome);
        }
        self.release_slot(slot, &released);
        true
    }

    /// Returns a call's slot to the free list. Idempotent: exactly one
    /// of a concurrent release pair takes effect.
    pub fn release(&self, call: &Call) {
        self.release_slot(call.slot, &call.released);
    }

    fn release_slot(&self, slot: usize, released: &AtomicBool) {
        if released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let mut inner = self.inner.write().unwrap();
        let id = inner.slots[slot].id;
        inner.pending.remove(&id);
        inner.slots[slot].tx = None;
        inner.slots[slot].next_free = inner.free_head;
        inner.free_head = Some(slot);
    }

    /// Drains every pending call, resolving each waiter exactly once via
    /// `outcome_for`. Used when the owning node shuts down.
    pub fn clear(&self, outcome_for: impl Fn(u64) -> CallOutcome) {
        let drained: Vec<(u64, Option<oneshot::Sender<CallOutcome>>, usize, Arc<AtomicBool>)> = {
            let mut inner = self.inner.write().unwrap();
            let ids: Vec<(u64, usize)> = inner.pending.drain().collect();
            ids.into_iter()
                .map(|(id, slot)| {
                    let entry = &mut inner.slots[slot];
                    (id, entry.tx.take(), slot, entry.released.clone())
                })
                .collect()
        };
        for (id, tx, slot, released) in drained {
            if let Some(tx) = tx {
                let _ = tx.send(outcome_for(id));
            }
            self.release_slot(slot, &released);
        }
    }

    #[cfg(test)]
    fn free_list_len(&self) -> usize {
        let inner = self.inner.read().unwrap();
        let mut n = 0;
        let mut cursor = inner.free_head;
        while let Some(slot) = cursor {
            n += 1;
            cursor = inner.slots[slot].next_free;
        }
        n
    }
}

#[derive(Default)]
struct CancelFlag {
    notify: Notify,
    set: AtomicBool,
}

/// Caller-scoped context for one logical call: metadata labels, an
/// optional per-attempt timeout, and an optional cancellation token.
///
/// Cancellation unblocks only the caller's wait; the in-flight request
/// stays pending until a real response or node shutdown reclaims it.
#[derive(Clone, Default)]
pub struct CallContext {
    /// Metadata passed through to the handler.
    pub labels: HashMap<String, String>,
    /// Per-attempt timeout for the wait on a node.
    pub timeout: Option<Duration>,
    cancel: Option<Arc<CancelFlag>>,
}

impl CallContext {
    /// Creates an empty context without timeout or cancellation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a context with the given per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attaches a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Makes this context cancellable and returns it.
    pub fn cancellable(mut self) -> Self {
        self.cancel = Some(Arc::new(CancelFlag::default()));
        self
    }

    /// Cancels every wait attached to this context. No-op for contexts
    /// not created via [`CallContext::cancellable`].
    pub fn cancel(&self) {
        if let Some(flag) = &self.cancel {
            flag.set.store(true, Ordering::SeqCst);
            flag.notify.notify_waiters();
        }
    }

    /// Whether this context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|f| f.set.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Resolves when the context is cancelled; pends forever for
    /// non-cancellable contexts.
    pub async fn cancelled(&self) {
        match &self.cancel {
            Some(flag) => loop {
                if flag.set.load(Ordering::SeqCst) {
                    return;
                }
                let notified = flag.notify.notified();
                if flag.set.load(Ordering::SeqCst) {
                    return;
                }
                notified.await;
            },
            None => std::future::pending().await,
        }
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("labels", &self.labels)
            .field("timeout", &self.timeout)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RpcError, Status};

    #[test]
    fn test_acquire_assigns_fresh_increasing_ids() {
        let pool = CallPool::new();
        let (a, _rx_a) = pool.acquire();
        let (b, _rx_b) = pool.acquire();
        assert!(a.id() >= 1);
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_acquire_reuses_released_slot() {
        let pool = CallPool::new();
        let (a, _rx) = pool.acquire();
        let slot_a = a.slot;
        pool.release(&a);
        let (b, _rx) = pool.acquire();
        assert_eq!(b.slot, slot_a);
        assert_ne!(b.id(), a.id());
    }

    #[test]
    fn test_release_removes_from_pending() {
        let pool = CallPool::new();
        let (call, _rx) = pool.acquire();
        assert!(pool.find(call.id()));
        pool.release(&call);
        assert!(!pool.find(call.id()));
        assert_eq!(pool.pending_count(), 0);
    }

    #[test]
    fn test_double_release_is_single_effect() {
        let pool = CallPool::new();
        let (call, _rx) = pool.acquire();
        pool.release(&call);
        pool.release(&call);
        assert_eq!(pool.free_list_len(), 1);
    }

    #[test]
    fn test_finish_then_release_is_single_effect() {
        let pool = CallPool::new();
        let (call, mut rx) = pool.acquire();
        assert!(pool.finish(call.id(), Ok(Value::from("done"))));
        pool.release(&call);
        assert_eq!(pool.free_list_len(), 1);
        assert_eq!(rx.try_recv().unwrap().unwrap(), Value::from("done"));
    }

    #[test]
    fn test_finish_unknown_id_is_miss() {
        let pool = CallPool::new();
        assert!(!pool.finish(12345, Ok(Value::Null)));
    }

    #[test]
    fn test_clear_resolves_all_pending_with_shutdown() {
        let pool = CallPool::new();
        let mut receivers = Vec::new();
        for _ in 0..4 {
            let (_call, rx) = pool.acquire();
            receivers.push(rx);
        }
        assert_eq!(pool.pending_count(), 4);
        pool.clear(|_| Err(RpcError::NodeShutdown));
        assert_eq!(pool.pending_count(), 0);
        for mut rx in receivers {
            let outcome = rx.try_recv().unwrap();
            assert_eq!(outcome.unwrap_err().status(), Status::NodeShutdown);
        }
        assert_eq!(pool.free_list_len(), 4);
    }

    #[test]
    fn test_concurrent_release_from_two_threads() {
        let pool = Arc::new(CallPool::new());
        for _ in 0..100 {
            let (call, _rx) = pool.acquire();
            let call = Arc::new(call);
            let p1 = pool.clone();
            let c1 = call.clone();
            let t1 = std::thread::spawn(move || p1.release(&c1));
            let p2 = pool.clone();
            let c2 = call.clone();
            let t2 = std::thread::spawn(move || p2.release(&c2));
            t1.join().unwrap();
            t2.join().unwrap();
            assert_eq!(pool.free_list_len(), 1);
            // Drain the free list back into use for the next round.
            let (next, _rx) = pool.acquire();
            assert_eq!(pool.free_list_len(), 0);
            pool.release(&next);
        }
    }

    #[tokio::test]
    async fn test_context_cancel_unblocks_waiter() {
        let ctx = CallContext::new().cancellable();
        let waiter = ctx.clone();
        let task = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        tokio::task::yield_now().await;
        ctx.cancel();
        assert!(task.await.unwrap());
    }

    #[test]
    fn test_context_without_token_is_never_cancelled() {
        let ctx = CallContext::new();
        ctx.cancel();
        assert!(!ctx.is_cancelled());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Any interleaving of acquire/release keeps the pending map
            // and free list consistent: released ids never linger.
            #[test]
            fn prop_release_evicts_pending(ops in proptest::collection::vec(0..3u8, 1..64)) {
                let pool = CallPool::new();
                let mut live: Vec<Call> = Vec::new();
                for op in ops {
                    match op {
                        0 | 1 => {
                            let (call, _rx) = pool.acquire();
                            live.push(call);
                        }
                        _ => {
                            if let Some(call) = live.pop() {
                                pool.release(&call);
                                prop_assert!(!pool.find(call.id()));
                            }
                        }
                    }
                }
                prop_assert_eq!(pool.pending_count(), live.len());
                for call in &live {
                    prop_assert!(pool.find(call.id()));
                }
            }
        }
    }
}
