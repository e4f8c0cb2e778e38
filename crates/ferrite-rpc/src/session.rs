//! Server-side session: one accepted connection plus its liveness state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::codec::ServerCodec;
use crate::error::Result;
use crate::message::Request;

/// One accepted connection, its codec, and its last-heartbeat timestamp.
pub struct Session {
    id: u64,
    codec: Arc<dyn ServerCodec>,
    peer_addr: String,
    last_heartbeat: Mutex<Instant>,
    closed: AtomicBool,
}

impl Session {
    /// Wraps a freshly accepted, codec-matched connection.
    pub fn new(id: u64, codec: Arc<dyn ServerCodec>, peer_addr: String) -> Self {
        Self {
            id,
            codec,
            peer_addr,
            last_heartbeat: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        }
    }

    /// Session identifier, unique per server.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// The codec bound to this connection.
    pub fn codec(&self) -> &Arc<dyn ServerCodec> {
        &self.codec
    }

    /// Records a heartbeat received from the peer.
    pub fn touch(&self) {
        *self.last_heartbeat.lock().unwrap() = Instant::now();
    }

    /// Time of the last heartbeat (or accept, whichever is later).
    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock().unwrap()
    }

    /// Pushes a heartbeat request to the peer.
    pub async fn push_heartbeat(&self) -> Result<()> {
        self.codec.encode_request(&Request::heartbeat()).await
    }

    /// Whether this session has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the session's write half. Idempotent.
    pub async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        tracing::debug!(session = self.id, peer = %self.peer_addr, "session closed");
        self.codec.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::JsonServerCodec;
    use crate::transport::IoStream;

    fn stub_codec() -> Arc<dyn ServerCodec> {
        let (a, _b) = tokio::io::duplex(64);
        let (r, w) = tokio::io::split(a);
        JsonServerCodec::build(IoStream {
            reader: Box::new(r),
            writer: Box::new(w),
            peer_addr: "stub".into(),
        })
    }

    #[tokio::test]
    async fn test_touch_advances_timestamp() {
        let session = Session::new(1, stub_codec(), "peer".into());
        let before = session.last_heartbeat();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        session.touch();
        assert!(session.last_heartbeat() > before);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = Session::new(2, stub_codec(), "peer".into());
        assert!(!session.is_closed());
        session.close().await;
        session.close().await;
        assert!(session.is_closed());
    }
}
