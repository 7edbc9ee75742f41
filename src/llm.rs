use crate::error::UpstreamError;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ============================================================
// Upstream LLM Client
// ============================================================
//
// Streams chat completions from an OpenAI-compatible endpoint. The wire
// is SSE: `data: {json}` lines terminated by `data: [DONE]`. Chunks can
// split lines anywhere, so incomplete trailing bytes are carried in a
// buffer until the next chunk arrives.
// ============================================================

/// One message in the upstream chat payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamMessage {
    pub role: String,
    pub content: String,
}

/// One content delta from the upstream stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    pub content: String,
}

/// Items delivered by the stream handle.
#[derive(Debug)]
pub enum StreamItem {
    Delta(Delta),
    Done,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub max_sockets: usize,
    /// Production keeps this on; development may disable it.
    pub verify_tls: bool,
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            api_key: None,
            max_sockets: 20,
            verify_tls: true,
            connect_timeout_secs: 10,
        }
    }
}

pub struct LlmClient {
    config: UpstreamConfig,
    client: reqwest::Client,
}

/// Handle to one in-flight upstream stream: a lazy, finite,
/// non-restartable sequence of deltas ending with `Done`.
pub struct UpstreamStream {
    rx: mpsc::Receiver<Result<StreamItem, UpstreamError>>,
    cancel: CancellationToken,
}

impl UpstreamStream {
    /// Next item, or None once the reader task has shut down.
    pub async fn next(&mut self) -> Option<Result<StreamItem, UpstreamError>> {
        self.rx.recv().await
    }

    /// Stop delivery and release the connection. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for UpstreamStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
impl UpstreamStream {
    /// Hand-fed stream for exercising the orchestrator without a socket.
    pub(crate) fn fed_by(
        rx: mpsc::Receiver<Result<StreamItem, UpstreamError>>,
        cancel: CancellationToken,
    ) -> Self {
        Self { rx, cancel }
    }
}

impl LlmClient {
    pub fn new(config: UpstreamConfig) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_sockets)
            .connect_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { config, client }
    }

    /// Open a streaming chat completion. Errors before the stream begins
    /// are returned here; mid-stream failures arrive through the handle.
    pub async fn stream_chat(
        &self,
        model: &str,
        messages: &[UpstreamMessage],
        max_tokens: u32,
        temperature: f64,
        cancel: CancellationToken,
    ) -> Result<UpstreamStream, UpstreamError> {
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "max_tokens": max_tokens.min(1000),
            "temperature": temperature.min(0.85),
            "stream": true,
        });

        let mut request = self
            .client
            .post(format!("{}/v1/chat/completions", self.config.base_url))
            .header("content-type", "application/json")
            .json(&body);
        if let Some(ref key) = self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(classify_send_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status(status.as_u16()));
        }

        let (tx, rx) = mpsc::channel::<Result<StreamItem, UpstreamError>>(64);
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            read_sse_stream(response, tx, reader_cancel).await;
        });

        Ok(UpstreamStream { rx, cancel })
    }

    /// Quick reachability probe for `/health`.
    pub async fn probe(&self) -> bool {
        let url = format!("{}/v1/models", self.config.base_url);
        match self
            .client
            .get(url)
            .timeout(std::time::Duration::from_secs(2))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

fn classify_send_error(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Timeout(10)
    } else {
        UpstreamError::Unavailable(err.to_string())
    }
}

/// Line reassembly across chunk boundaries: a chunk can end mid-line,
/// so the trailing partial stays buffered until the next chunk.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    /// Feed one chunk; returns the lines completed by it.
    fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            lines.push(line.trim().to_string());
        }
        lines
    }
}

/// Pump the byte stream, reassemble SSE lines across chunk boundaries,
/// and forward parsed deltas until `[DONE]`, an error, or cancellation.
async fn read_sse_stream(
    response: reqwest::Response,
    tx: mpsc::Sender<Result<StreamItem, UpstreamError>>,
    cancel: CancellationToken,
) {
    let mut byte_stream = response.bytes_stream();
    let mut lines = LineBuffer::default();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = byte_stream.next() => chunk,
        };

        let bytes = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                let _ = tx.send(Err(UpstreamError::Unavailable(e.to_string()))).await;
                return;
            }
            // Upstream closed without [DONE]; treat as a clean end so
            // already-emitted bytes are not retracted.
            None => {
                let _ = tx.send(Ok(StreamItem::Done)).await;
                return;
            }
        };

        for line in lines.push(&String::from_utf8_lossy(&bytes)) {
            match parse_sse_line(&line) {
                SseLine::Done => {
                    let _ = tx.send(Ok(StreamItem::Done)).await;
                    return;
                }
                SseLine::Delta(delta) => {
                    if tx.send(Ok(StreamItem::Delta(delta))).await.is_err() {
                        return; // receiver dropped
                    }
                }
                SseLine::Malformed(detail) => {
                    let _ = tx.send(Err(UpstreamError::Protocol(detail))).await;
                    return;
                }
                SseLine::Ignored => {}
            }
        }
    }
}

enum SseLine {
    Delta(Delta),
    Done,
    Malformed(String),
    Ignored,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        // Blank keep-alives, `event:` and `id:` lines are legal framing.
        return SseLine::Ignored;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    if data.is_empty() {
        return SseLine::Ignored;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            let content = chunk
                .choices
                .first()
                .and_then(|c| c.delta.content.clone())
                .unwrap_or_default();
            SseLine::Delta(Delta { content })
        }
        Err(e) => SseLine::Malformed(format!("bad data frame: {}", e)),
    }
}

// Upstream streaming chunk types

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

// ============================================================
// Tests
// ============================================================
