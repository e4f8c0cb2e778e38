//! Codec contracts, content matching, and the explicit codec registry.
//!
//! Codecs are pluggable: the runtime only requires the framing contracts
//! below. The registry is an explicit value handed to client and server
//! constructors; there is no process-wide implicit registration.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, ReadBuf};

use crate::error::{Result, RpcError};
use crate::message::{Request, RequestHead, Response, ResponseHead};
use crate::transport::IoStream;

/// Client-side framing contract.
///
/// `encode` must tolerate concurrent callers: many in-flight calls share
/// one connection and serialize on the codec's internal write path. The
/// decode methods have exactly one caller, the node's read loop.
#[async_trait]
pub trait ClientCodec: Send + Sync {
    /// Encodes and writes one request frame.
    async fn encode(&self, req: &Request) -> Result<()>;

    /// Reads and decodes the head of the next response frame.
    async fn decode_head(&self) -> Result<ResponseHead>;

    /// Decodes the result of the frame whose head was just read.
    /// A nil result decodes to `Value::Null` without error.
    async fn decode_result(&self) -> Result<Value>;

    /// Drains the result of the frame whose head was just read.
    async fn discard_result(&self) -> Result<()>;

    /// Shuts down the write half of the connection.
    async fn close(&self);
}

/// Server-side framing contract, mirror of [`ClientCodec`].
#[async_trait]
pub trait ServerCodec: Send + Sync {
    /// Encodes and writes one response frame. Concurrent-safe: every
    /// dispatched request task writes through this method.
    async fn encode(&self, resp: &Response) -> Result<()>;

    /// Encodes and writes a request frame, used for heartbeat pushes.
    async fn encode_request(&self, req: &Request) -> Result<()>;

    /// Reads and decodes the head of the next request frame.
    async fn decode_head(&self) -> Result<RequestHead>;

    /// Decodes the arguments of the frame whose head was just read.
    async fn decode_args(&self) -> Result<Vec<Value>>;

    /// Drains the arguments of the frame whose head was just read.
    async fn discard_args(&self) -> Result<()>;

    /// Shuts down the write half of the connection.
    async fn close(&self);
}

/// Content matcher: inspects the first bytes of a new connection and
/// decides whether this codec owns it. Evaluated in registration order,
/// first match wins.
pub type Matcher = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Builds a client codec over an established connection.
pub type ClientCodecBuilder = Arc<dyn Fn(IoStream) -> Arc<dyn ClientCodec> + Send + Sync>;

/// Builds a server codec over an accepted connection.
pub type ServerCodecBuilder = Arc<dyn Fn(IoStream) -> Arc<dyn ServerCodec> + Send + Sync>;

/// One named codec with its matcher and both-side builders.
#[derive(Clone)]
pub struct CodecEntry {
    /// Codec name, looked up by clients.
    pub name: String,
    /// Connection sniffer for server-side selection.
    pub matcher: Matcher,
    /// Client-side builder.
    pub client: ClientCodecBuilder,
    /// Server-side builder.
    pub server: ServerCodecBuilder,
}

/// Ordered codec registry. Constructed once at process start and passed
/// by reference to client and server constructors.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    entries: Vec<CodecEntry>,
}

impl CodecRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding only the built-in JSON codec.
    pub fn with_json() -> Self {
        let mut registry = Self::new();
        registry.register(crate::json::json_codec_entry());
        registry
    }

    /// Appends a codec entry. Order matters for server-side matching.
    pub fn register(&mut self, entry: CodecEntry) {
        self.entries.push(entry);
    }

    /// Looks up the client builder for a codec by name.
    pub fn client(&self, name: &str) -> Result<ClientCodecBuilder> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.client.clone())
            .ok_or_else(|| RpcError::CodecNotRegistered {
                name: name.to_string(),
            })
    }

    /// Matches the sniffed first bytes of a connection against the
    /// registered codecs, first match wins.
    pub fn match_server(&self, peek: &[u8]) -> Option<&CodecEntry> {
        self.entries.iter().find(|e| (e.matcher)(peek))
    }

    /// Number of registered codecs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reader wrapper replaying bytes consumed while sniffing a connection.
pub struct PeekStream<R> {
    prefix: Vec<u8>,
    offset: usize,
    inner: R,
}

impl<R> PeekStream<R> {
    /// Wraps `inner`, replaying `prefix` before any further reads.
    pub fn new(prefix: Vec<u8>, inner: R) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PeekStream<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if me.offset < me.prefix.len() {
            let n = std::cmp::min(buf.remaining(), me.prefix.len() - me.offset);
            buf.put_slice(&me.prefix[me.offset..me.offset + n]);
            me.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut me.inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn dummy_entry(name: &str, byte: u8) -> CodecEntry {
        let stream_to_client: ClientCodecBuilder =
            Arc::new(|io| crate::json::JsonClientCodec::build(io));
        let stream_to_server: ServerCodecBuilder =
            Arc::new(|io| crate::json::JsonServerCodec::build(io));
        CodecEntry {
            name: name.to_string(),
            matcher: Arc::new(move |peek: &[u8]| peek.first() == Some(&byte)),
            client: stream_to_client,
            server: stream_to_server,
        }
    }

    #[test]
    fn test_client_lookup_by_name() {
        let mut registry = CodecRegistry::new();
        registry.register(dummy_entry("a", b'a'));
        assert!(registry.client("a").is_ok());
        let Err(err) = registry.client("missing") else {
            panic!("lookup of an unregistered codec must fail");
        };
        assert_eq!(err.status(), crate::error::Status::CodecNotRegistered);
    }

    #[test]
    fn test_match_order_first_wins() {
        let mut registry = CodecRegistry::new();
        registry.register(dummy_entry("first", b'x'));
        registry.register(dummy_entry("second", b'x'));
        let matched = registry.match_server(b"x...").unwrap();
        assert_eq!(matched.name, "first");
    }

    #[test]
    fn test_no_match() {
        let mut registry = CodecRegistry::new();
        registry.register(dummy_entry("a", b'a'));
        assert!(registry.match_server(b"zzz").is_none());
    }

    #[tokio::test]
    async fn test_peek_stream_replays_prefix() {
        let (client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            server.write_all(b"world").await.unwrap();
        });
        let mut peeked = PeekStream::new(b"hello ".to_vec(), client);
        let mut out = vec![0u8; 11];
        peeked.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello world");
    }
}
