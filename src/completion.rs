use crate::auth::AuthUser;
use crate::cache::CompressionCache;
use crate::commit::{self, SideEffects};
use crate::compressor::{self, model_profile, CompressedContext};
use crate::context::{self, DEFAULT_HISTORY_WINDOW};
use crate::error::{ApiError, UpstreamError};
use crate::extract::{extract_markers, sanitize, MarkerFilter};
use crate::llm::{StreamItem, UpstreamStream};
use crate::metrics::Metrics;
use crate::models::*;
use crate::{db, AppState};
use axum::{
    extract::State,
    http::HeaderValue,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    Extension, Json,
};
use futures::StreamExt;
use std::convert::Infallible;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ============================================================
// Completion Orchestrator
// ============================================================
//
// One request walks: validate → rate limit → cached user load →
// context assembly (compressing intelligence context when present) →
// upstream stream → SSE relay → extraction → sanitation → commit.
//
// The commit always runs after the terminal [DONE]; a client that
// disconnects mid-stream still gets its partial turn remembered.
// ============================================================

/// Generation caps locked in at prepare time.
const N_PREDICT: u32 = 1000;
const TEMPERATURE: f64 = 0.85;

/// A stream that runs longer than this is drained with what it has.
const HARD_STREAM_TIMEOUT: Duration = Duration::from_secs(45);
/// Reset on every non-empty delta.
const NO_BYTE_TIMEOUT: Duration = Duration::from_secs(30);
/// Delta cap; one non-empty delta approximates one token.
const MAX_DELTAS: u32 = 800;

/// Forwarding ends as soon as any of these appears in the visible text.
/// Newline-prefixed role markers come first so the newline itself is
/// dropped when one terminates the stream.
const STOP_SEQUENCES: &[&str] = &[
    "\nUSER:",
    "\nHuman:",
    "\nAssistant:",
    "USER:",
    "Human:",
    "Assistant:",
    "[INST]",
    "[/INST]",
    "<s>",
    "</s>",
    "---",
    "***",
    "\n\n\n\n",
    "Example:",
    "Note:",
    "Source:",
];

fn find_stop_sequence(text: &str) -> Option<usize> {
    STOP_SEQUENCES
        .iter()
        .filter_map(|seq| text.find(seq))
        .min()
}

// ============================================================
// Handler
// ============================================================

/// POST /completion - Streaming (SSE) or one-shot chat completion
pub async fn handle_completion(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(payload): Json<CompletionRequest>,
) -> Result<Response, ApiError> {
    let prompt = payload.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(ApiError::InvalidInput("prompt must be a non-empty string".to_string()));
    }

    state
        .rate_limiter
        .check(crate::ratelimit::Scope::Completion, &user_id.to_string())
        .map_err(|retry_after_secs| ApiError::RateLimited { retry_after_secs })?;

    let (user, memory) = load_user_cached(&state, user_id).await?;
    let intelligence = compress_context(&state, user_id, &payload, memory.len());

    let profile = model_profile(&payload.model);
    let prompt_budget = profile.max_context_tokens.saturating_sub(N_PREDICT);
    let messages = context::assemble(&user, &memory, &prompt, intelligence.as_ref(), prompt_budget);

    let cancel = CancellationToken::new();
    let upstream = state
        .llm
        .stream_chat(&payload.model, &messages, N_PREDICT, TEMPERATURE, cancel)
        .await?;

    state.metrics.completion_started();
    let started = Instant::now();

    if payload.stream {
        // The relay buffers at most one delta; backpressure flows to the pump.
        let (tx, rx) = mpsc::channel::<Event>(1);
        let task_state = state.clone();
        tokio::spawn(async move {
            let mut sink = Sink::Channel(tx);
            let outcome = pump_stream(
                upstream,
                &mut sink,
                &task_state.metrics,
                HARD_STREAM_TIMEOUT,
                NO_BYTE_TIMEOUT,
                MAX_DELTAS,
            )
            .await;
            let _ = sink.send_done().await;
            drop(sink);
            finalize(&task_state, user_id, &prompt, &outcome, started).await;
        });

        let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
        let mut response = Sse::new(stream).into_response();
        let headers = response.headers_mut();
        headers.insert("cache-control", HeaderValue::from_static("no-cache"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        // Reverse proxies must not buffer the event stream.
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
        Ok(response)
    } else {
        let mut sink = Sink::Buffer(String::new());
        let mut outcome = pump_stream(
            upstream,
            &mut sink,
            &state.metrics,
            HARD_STREAM_TIMEOUT,
            NO_BYTE_TIMEOUT,
            MAX_DELTAS,
        )
        .await;

        // Nothing arrived and the upstream failed: surface the error.
        if outcome.raw.is_empty() {
            if let Some(err) = outcome.error.take() {
                state.metrics.completion_finished(started.elapsed().as_millis() as u64, false);
                return Err(ApiError::Upstream(err));
            }
        }

        let assistant = finalize(&state, user_id, &prompt, &outcome, started).await;
        Ok(Json(CompletionResponse { content: assistant }).into_response())
    }
}

async fn load_user_cached(
    state: &AppState,
    user_id: Uuid,
) -> Result<(User, Vec<MemoryMessage>), ApiError> {
    if let Some(entry) = state.user_cache.get(user_id).await {
        return Ok((entry.user, entry.recent_memory));
    }
    let user = db::get_user(&state.db, user_id)
        .await?
        .ok_or(ApiError::UserNotFound)?;
    let memory = db::recent_memory(&state.db, user_id, DEFAULT_HISTORY_WINDOW as i64).await?;
    state
        .user_cache
        .insert(user_id, user.clone(), memory.clone())
        .await;
    Ok((user, memory))
}

/// Compress the request's intelligence context, through the bounded cache.
fn compress_context(
    state: &AppState,
    user_id: Uuid,
    payload: &CompletionRequest,
    history_len: usize,
) -> Option<CompressedContext> {
    let ctx = payload.context.as_ref().filter(|c| !c.is_empty())?;
    let key = CompressionCache::key(user_id, &payload.message_type, payload.complexity, &payload.model);
    if let Some(hit) = state.compression_cache.get(&key) {
        return Some(hit);
    }
    let compressed = compressor::compress(
        ctx,
        &payload.message_type,
        payload.complexity,
        history_len,
        &payload.model,
        None,
    );
    state.compression_cache.insert(key, compressed.clone());
    Some(compressed)
}

// ============================================================
// Stream Pump
// ============================================================

/// Where forwarded text goes: the SSE channel, or a buffer for the
/// non-streaming path.
enum Sink {
    Channel(mpsc::Sender<Event>),
    Buffer(String),
}

impl Sink {
    /// False when the client is gone.
    async fn send_text(&mut self, text: &str) -> bool {
        match self {
            Sink::Channel(tx) => {
                let data = serde_json::to_string(&StreamEvent::content(text)).unwrap_or_default();
                tx.send(Event::default().event("message").data(data)).await.is_ok()
            }
            Sink::Buffer(buf) => {
                buf.push_str(text);
                true
            }
        }
    }

    async fn send_error(&mut self, message: &str) -> bool {
        match self {
            Sink::Channel(tx) => {
                let data = serde_json::to_string(&StreamEvent::error(message)).unwrap_or_default();
                tx.send(Event::default().event("message").data(data)).await.is_ok()
            }
            Sink::Buffer(_) => true,
        }
    }

    async fn send_done(&mut self) -> bool {
        match self {
            Sink::Channel(tx) => tx.send(Event::default().data("[DONE]")).await.is_ok(),
            Sink::Buffer(_) => true,
        }
    }
}

#[derive(Debug, Default)]
struct PumpOutcome {
    /// Every upstream byte, markers included; the extractor's input.
    raw: String,
    /// Text actually delivered to the client.
    delivered: String,
    error: Option<UpstreamError>,
    stopped: bool,
    capped: bool,
    timed_out: bool,
    client_gone: bool,
}

/// Drive one upstream stream to completion: filter markers, scan for
/// stop sequences, enforce the delta cap and both timers, and forward
/// whatever survives. Cancels the upstream on every exit path.
async fn pump_stream(
    mut upstream: UpstreamStream,
    sink: &mut Sink,
    metrics: &Metrics,
    hard_timeout: Duration,
    idle_timeout: Duration,
    max_deltas: u32,
) -> PumpOutcome {
    let mut outcome = PumpOutcome::default();
    let mut filter = MarkerFilter::new();
    let mut visible = String::new();
    let mut sent = 0usize;
    let mut deltas = 0u32;

    let hard = tokio::time::sleep(hard_timeout);
    tokio::pin!(hard);

    loop {
        let next = tokio::select! {
            _ = &mut hard => {
                outcome.timed_out = true;
                break;
            }
            next = tokio::time::timeout(idle_timeout, upstream.next()) => next,
        };

        let delta = match next {
            // No bytes inside the window.
            Err(_) => {
                let err = UpstreamError::Timeout(idle_timeout.as_secs());
                if !sink.send_error(&err.to_string()).await {
                    outcome.client_gone = true;
                }
                outcome.error = Some(err);
                break;
            }
            Ok(None) => break,
            Ok(Some(Ok(StreamItem::Done))) => break,
            Ok(Some(Ok(StreamItem::Delta(delta)))) => delta,
            Ok(Some(Err(err))) => {
                if !sink.send_error(&err.to_string()).await {
                    outcome.client_gone = true;
                }
                outcome.error = Some(err);
                break;
            }
        };

        if delta.content.is_empty() {
            continue;
        }
        deltas += 1;
        outcome.raw.push_str(&delta.content);

        let safe = filter.push(&delta.content);
        if !safe.is_empty() {
            visible.push_str(&safe);
            forward_new(sink, metrics, &visible, &mut sent, &mut outcome).await;
            if outcome.stopped || outcome.client_gone {
                break;
            }
        }

        if deltas > max_deltas {
            outcome.capped = true;
            break;
        }
    }

    // A held false-prefix is plain text once the stream is over.
    if !outcome.stopped && !outcome.client_gone && outcome.error.is_none() {
        let tail = filter.finish();
        if !tail.is_empty() {
            visible.push_str(&tail);
            forward_new(sink, metrics, &visible, &mut sent, &mut outcome).await;
        }
    }

    upstream.cancel();
    outcome.delivered = visible[..sent].to_string();
    outcome
}

/// Forward the unsent portion of `visible`, honoring stop sequences.
/// Once a stop sequence appears anywhere in the visible text, nothing
/// at or past it is ever delivered.
async fn forward_new(
    sink: &mut Sink,
    metrics: &Metrics,
    visible: &str,
    sent: &mut usize,
    outcome: &mut PumpOutcome,
) {
    let limit = match find_stop_sequence(visible) {
        Some(pos) => {
            outcome.stopped = true;
            pos
        }
        None => visible.len(),
    };
    if limit > *sent {
        if !sink.send_text(&visible[*sent..limit]).await {
            outcome.client_gone = true;
            return;
        }
        metrics.delta_relayed();
        *sent = limit;
    }
}

// ============================================================
// Finalize: extraction, sanitation, commit
// ============================================================

/// Runs after the last client-visible byte. Returns the sanitized
/// assistant content (what the memory pair records).
async fn finalize(
    state: &AppState,
    user_id: Uuid,
    prompt: &str,
    outcome: &PumpOutcome,
    started: Instant,
) -> String {
    let extraction = extract_markers(&outcome.raw);
    let assistant = sanitize(&extraction.cleaned);

    if outcome.client_gone {
        tracing::debug!(user_id = %user_id, "client disconnected; committing partial turn");
    }

    let commit_outcome = commit::commit(
        &state.db,
        SideEffects {
            user_id,
            user_prompt: prompt.to_string(),
            assistant_content: assistant.clone(),
            emotion: extraction.emotion,
            task: extraction.task,
        },
    )
    .await;
    if !commit_outcome.all_ok() {
        state.metrics.commit_failure();
    }

    // The next read must observe the new memory pair.
    state.user_cache.invalidate(user_id).await;

    let latency_ms = started.elapsed().as_millis() as u64;
    state
        .metrics
        .completion_finished(latency_ms, outcome.error.is_none());
    tracing::info!(
        user_id = %user_id,
        latency_ms,
        delivered = outcome.delivered.len(),
        stopped = outcome.stopped,
        capped = outcome.capped,
        timed_out = outcome.timed_out,
        client_gone = outcome.client_gone,
        "completion finished"
    );

    assistant
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Delta;

    mod stop_sequence_tests {
        use super::*;

        #[test]
        fn earliest_sequence_wins() {
            let text = "answer Note: something --- more";
            assert_eq!(find_stop_sequence(text), Some(7));
        }

        #[test]
        fn clean_text_has_no_stop() {
            assert_eq!(find_stop_sequence("just a normal reply"), None);
        }

        #[test]
        fn role_markers_and_delimiters_detected() {
            for seq in ["USER:", "Human:", "Assistant:", "[INST]", "</s>", "***"] {
                let text = format!("abc {}", seq);
                assert_eq!(find_stop_sequence(&text), Some(4), "missed {}", seq);
            }
        }

        #[test]
        fn three_blank_lines_terminate() {
            assert!(find_stop_sequence("para\n\n\n\nnext").is_some());
        }
    }

    mod pump_tests {
        use super::*;

        /// Feed scripted items through a hand-fed upstream stream into a
        /// buffer sink and return (outcome, delivered text).
        async fn run_script(items: Vec<Result<StreamItem, UpstreamError>>) -> (PumpOutcome, String) {
            let (tx, rx) = mpsc::channel(16);
            let cancel = CancellationToken::new();
            let upstream = UpstreamStream::fed_by(rx, cancel);
            tokio::spawn(async move {
                for item in items {
                    if tx.send(item).await.is_err() {
                        break;
                    }
                }
            });

            let metrics = Metrics::default();
            let mut sink = Sink::Buffer(String::new());
            let outcome = pump_stream(
                upstream,
                &mut sink,
                &metrics,
                Duration::from_secs(5),
                Duration::from_secs(2),
                MAX_DELTAS,
            )
            .await;
            let delivered = match sink {
                Sink::Buffer(buf) => buf,
                _ => unreachable!(),
            };
            (outcome, delivered)
        }

        fn delta(content: &str) -> Result<StreamItem, UpstreamError> {
            Ok(StreamItem::Delta(Delta { content: content.to_string() }))
        }

        #[tokio::test]
        async fn happy_path_forwards_everything() {
            let (outcome, delivered) =
                run_script(vec![delta("Hi"), delta(" there"), Ok(StreamItem::Done)]).await;
            assert_eq!(delivered, "Hi there");
            assert_eq!(outcome.raw, "Hi there");
            assert_eq!(outcome.delivered, "Hi there");
            assert!(!outcome.stopped && !outcome.capped && outcome.error.is_none());
        }

        #[tokio::test]
        async fn marker_delta_held_back_but_accumulated() {
            let (outcome, delivered) = run_script(vec![
                delta("I hear you. "),
                delta(r#"EMOTION_LOG: {"emotion":"sad","intensity":6}"#),
                Ok(StreamItem::Done),
            ])
            .await;
            assert_eq!(delivered, "I hear you. ");
            assert!(outcome.raw.contains("EMOTION_LOG"));
        }

        #[tokio::test]
        async fn marker_split_across_deltas_never_leaks() {
            let (outcome, delivered) = run_script(vec![
                delta("EMOTIO"),
                delta(r#"N_LOG: {"emotion":"joy"}"#),
                Ok(StreamItem::Done),
            ])
            .await;
            assert_eq!(delivered, "");
            assert!(outcome.raw.contains("EMOTION_LOG"));
        }

        #[tokio::test]
        async fn stop_sequence_ends_forwarding() {
            let (outcome, delivered) =
                run_script(vec![delta("Answer. \nHuman:"), delta(" injected"), Ok(StreamItem::Done)])
                    .await;
            assert_eq!(delivered, "Answer. ");
            assert!(outcome.stopped);
        }

        #[tokio::test]
        async fn stop_sequence_split_across_deltas_stops_late_content() {
            let (outcome, delivered) = run_script(vec![
                delta("ok \nHum"),
                delta("an: secret"),
                Ok(StreamItem::Done),
            ])
            .await;
            // "\nHum" was already on the wire before the sequence completed;
            // nothing after the completed sequence ever is.
            assert!(outcome.stopped);
            assert!(!delivered.contains("secret"));
        }

        #[tokio::test]
        async fn delta_cap_drains_stream() {
            let mut items: Vec<Result<StreamItem, UpstreamError>> =
                (0..900).map(|_| delta("x")).collect();
            items.push(Ok(StreamItem::Done));
            let (outcome, delivered) = run_script(items).await;
            assert!(outcome.capped);
            assert_eq!(delivered.len(), 801);
        }

        #[tokio::test]
        async fn zero_byte_stream_yields_empty_delivery() {
            let (outcome, delivered) = run_script(vec![Ok(StreamItem::Done)]).await;
            assert_eq!(delivered, "");
            assert!(outcome.raw.is_empty());
            assert!(outcome.error.is_none());
        }

        #[tokio::test]
        async fn mid_stream_error_preserves_emitted_bytes() {
            let (outcome, delivered) = run_script(vec![
                delta("partial "),
                Err(UpstreamError::Protocol("bad frame".to_string())),
            ])
            .await;
            assert_eq!(delivered, "partial ");
            assert!(matches!(outcome.error, Some(UpstreamError::Protocol(_))));
        }

        #[tokio::test]
        async fn false_marker_prefix_flushed_at_end() {
            let (_, delivered) =
                run_script(vec![delta("tasks EMOTIO"), Ok(StreamItem::Done)]).await;
            assert_eq!(delivered, "tasks EMOTIO");
        }

        #[tokio::test]
        async fn forwarded_chunks_are_counted_as_relayed() {
            let (tx, rx) = mpsc::channel(16);
            let cancel = CancellationToken::new();
            let upstream = UpstreamStream::fed_by(rx, cancel);
            tokio::spawn(async move {
                for item in [delta("Hi"), delta(" there"), Ok(StreamItem::Done)] {
                    if tx.send(item).await.is_err() {
                        break;
                    }
                }
            });

            let metrics = Metrics::default();
            let mut sink = Sink::Buffer(String::new());
            let outcome = pump_stream(
                upstream,
                &mut sink,
                &metrics,
                Duration::from_secs(5),
                Duration::from_secs(2),
                MAX_DELTAS,
            )
            .await;

            assert_eq!(outcome.delivered, "Hi there");
            assert_eq!(metrics.snapshot().deltas_relayed, 2);
        }

        #[tokio::test]
        async fn client_disconnect_cancels_and_keeps_partial() {
            let (tx, rx) = mpsc::channel(16);
            let cancel = CancellationToken::new();
            let upstream = UpstreamStream::fed_by(rx, cancel.clone());

            // Endless upstream until cancelled.
            tokio::spawn(async move {
                loop {
                    if tx
                        .send(Ok(StreamItem::Delta(Delta { content: "tok ".to_string() })))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });

            let (event_tx, mut event_rx) = mpsc::channel::<Event>(1);
            let mut sink = Sink::Channel(event_tx);
            let pump = tokio::spawn(async move {
                let metrics = Metrics::default();
                pump_stream(
                    upstream,
                    &mut sink,
                    &metrics,
                    Duration::from_secs(5),
                    Duration::from_secs(2),
                    MAX_DELTAS,
                )
                .await
            });

            // Read one frame, then hang up.
            let first = event_rx.recv().await;
            assert!(first.is_some());
            drop(event_rx);

            let outcome = pump.await.unwrap();
            assert!(outcome.client_gone);
            assert!(!outcome.delivered.is_empty());
            assert!(cancel.is_cancelled());
        }
    }
}
