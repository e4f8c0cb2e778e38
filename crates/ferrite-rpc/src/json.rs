//! Reference newline-delimited JSON codec.
//!
//! Each frame is one JSON object on one line. The matcher sniffs for a
//! leading `{`, so this codec can coexist with binary codecs in one
//! registry. Heads and payloads arrive in the same frame: `decode_head`
//! parses the whole object and stashes the payload for the follow-up
//! `decode_result`/`decode_args` call on the same frame.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::codec::{ClientCodec, CodecEntry, Matcher, ServerCodec};
use crate::error::{Result, RpcError};
use crate::message::{Request, RequestHead, Response, ResponseHead};
use crate::transport::{BoxedReader, BoxedWriter, IoStream};

/// Name under which the JSON codec registers.
pub const JSON_CODEC_NAME: &str = "json";

/// Builds the registry entry for the JSON codec.
pub fn json_codec_entry() -> CodecEntry {
    let matcher: Matcher = Arc::new(|peek: &[u8]| {
        peek.iter()
            .find(|b| !b.is_ascii_whitespace())
            .map(|b| *b == b'{')
            .unwrap_or(false)
    });
    CodecEntry {
        name: JSON_CODEC_NAME.to_string(),
        matcher,
        client: Arc::new(JsonClientCodec::build),
        server: Arc::new(JsonServerCodec::build),
    }
}

async fn read_frame(reader: &Mutex<BufReader<BoxedReader>>) -> Result<String> {
    let mut line = String::new();
    let n = reader.lock().await.read_line(&mut line).await?;
    if n == 0 {
        return Err(RpcError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed",
        )));
    }
    Ok(line)
}

async fn write_frame(writer: &Mutex<BoxedWriter>, text: String) -> Result<()> {
    let mut bytes = text.into_bytes();
    bytes.push(b'\n');
    let mut guard = writer.lock().await;
    guard.write_all(&bytes).await?;
    guard.flush().await?;
    Ok(())
}

/// Client side of the JSON codec.
pub struct JsonClientCodec {
    reader: Mutex<BufReader<BoxedReader>>,
    writer: Mutex<BoxedWriter>,
    // Result stashed by decode_head for the frame currently being read.
    pending_result: std::sync::Mutex<Option<Value>>,
}

impl JsonClientCodec {
    /// Wraps an established connection.
    pub fn build(io: IoStream) -> Arc<dyn ClientCodec> {
        Arc::new(Self {
            reader: Mutex::new(BufReader::new(io.reader)),
            writer: Mutex::new(io.writer),
            pending_result: std::sync::Mutex::new(None),
        })
    }
}

#[async_trait]
impl ClientCodec for JsonClientCodec {
    async fn encode(&self, req: &Request) -> Result<()> {
        let text = serde_json::to_string(req).map_err(|e| RpcError::Codec(e.to_string()))?;
        write_frame(&self.writer, text).await
    }

    async fn decode_head(&self) -> Result<ResponseHead> {
        let line = read_frame(&self.reader).await?;
        let resp: Response =
            serde_json::from_str(line.trim()).map_err(|e| RpcError::Codec(e.to_string()))?;
        *self.pending_result.lock().unwrap() = resp.result;
        Ok(ResponseHead {
            id: resp.id,
            error: resp.error,
        })
    }

    async fn decode_result(&self) -> Result<Value> {
        let stashed = self.pending_result.lock().unwrap().take();
        Ok(stashed.unwrap_or(Value::Null))
    }

    async fn discard_result(&self) -> Result<()> {
        self.pending_result.lock().unwrap().take();
        Ok(())
    }

    async fn close(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}

/// Server side of the JSON codec.
pub struct JsonServerCodec {
    reader: Mutex<BufReader<BoxedReader>>,
    writer: Mutex<BoxedWriter>,
    // Arguments stashed by decode_head for the frame currently being read.
    pending_args: std::sync::Mutex<Option<Vec<Value>>>,
}

impl JsonServerCodec {
    /// Wraps an accepted connection.
    pub fn build(io: IoStream) -> Arc<dyn ServerCodec> {
        Arc::new(Self {
            reader: Mutex::new(BufReader::new(io.reader)),
            writer: Mutex::new(io.writer),
            pending_args: std::sync::Mutex::new(None),
        })
    }
}

#[async_trait]
impl ServerCodec for JsonServerCodec {
    async fn encode(&self, resp: &Response) -> Result<()> {
        let text = serde_json::to_string(resp).map_err(|e| RpcError::Codec(e.to_string()))?;
        write_frame(&self.writer, text).await
    }

    async fn encode_request(&self, req: &Request) -> Result<()> {
        let text = serde_json::to_string(req).map_err(|e| RpcError::Codec(e.to_string()))?;
        write_frame(&self.writer, text).await
    }

    async fn decode_head(&self) -> Result<RequestHead> {
        let line = read_frame(&self.reader).await?;
        let req: Request =
            serde_json::from_str(line.trim()).map_err(|e| RpcError::Codec(e.to_string()))?;
        *self.pending_args.lock().unwrap() = Some(req.args);
        Ok(RequestHead {
            id: req.id,
            service: req.service,
            method: req.method,
            labels: req.labels,
        })
    }

    async fn decode_args(&self) -> Result<Vec<Value>> {
        let stashed = self.pending_args.lock().unwrap().take();
        Ok(stashed.unwrap_or_default())
    }

    async fn discard_args(&self) -> Result<()> {
        self.pending_args.lock().unwrap().take();
        Ok(())
    }

    async fn close(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}
