//! OpenAI-compatible chat and model routes
//!
//! Requests are validated and shaped here, then handed to the relay. A
//! streamed answer is produced by a spawned relay task feeding an mpsc
//! channel; dropping the response body closes the channel, which the relay
//! observes as cancellation.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use relay::{Completion, DeltaEvent, Orchestrator, RelayError, RelayRequest};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{Instrument, Span, error, info, instrument, warn};
use upstream::{ChatMessage, ChatRequest, find_model, models};

use crate::error::PreflightError;
use crate::metrics::{self, Mode};
use crate::service::{InFlight, ServiceStats};

/// Inbound bodies carry base64 images, so allow more than axum's default.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Deltas buffered between the relay task and the response body.
const STREAM_BUFFER: usize = 64;

/// Shared state for the chat handler
#[derive(Clone)]
pub struct ChatState {
    pub orchestrator: Arc<Orchestrator>,
    pub pre_messages: Arc<Vec<ChatMessage>>,
    pub default_max_tokens: u32,
    pub stats: ServiceStats,
}

/// Validate and shape an inbound body into a relay request.
///
/// Steps run in a fixed order: parse, drop empty messages, resolve the
/// model, bound `max_tokens`, default a missing `max_tokens`, then insert
/// the configured pre-messages.
pub fn preflight(
    body: &[u8],
    pre_messages: &[ChatMessage],
    default_max_tokens: u32,
) -> Result<RelayRequest, PreflightError> {
    let mut chat: ChatRequest =
        serde_json::from_slice(body).map_err(|e| PreflightError::InvalidBody(e.to_string()))?;
    chat.remove_empty_messages();

    let model =
        find_model(&chat.model).ok_or_else(|| PreflightError::UnknownModel(chat.model.clone()))?;

    if chat.max_tokens > model.max_tokens {
        return Err(PreflightError::MaxTokensTooLarge {
            model: model.id.to_string(),
            requested: chat.max_tokens,
            limit: model.max_tokens,
        });
    }
    if chat.max_tokens <= 1 {
        chat.max_tokens = default_max_tokens.min(model.max_tokens);
    }

    chat.insert_pre_messages(pre_messages.to_vec());
    Ok(RelayRequest { chat, model })
}

fn error_body(error_type: &str, code: &str, message: &str, request_id: &str) -> Value {
    json!({
        "error": {
            "message": message,
            "type": error_type,
            "code": code,
            "request_id": request_id,
        }
    })
}

/// JSON error response: {"error":{"message","type","code","request_id"}}
pub fn error_response(
    status: StatusCode,
    error_type: &str,
    code: &str,
    message: &str,
    request_id: &str,
) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        error_body(error_type, code, message, request_id).to_string(),
    )
        .into_response()
}

fn relay_error_response(err: &RelayError, request_id: &str) -> Response {
    error_response(
        relay_status(err),
        err.error_type(),
        err.code(),
        &err.to_string(),
        request_id,
    )
}

fn relay_status(err: &RelayError) -> StatusCode {
    StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_GATEWAY)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().as_simple())
}

#[instrument(skip_all, fields(request_id = %request_id, model = tracing::field::Empty, stream = tracing::field::Empty))]
pub async fn chat_completions(
    state: &ChatState,
    request: Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let in_flight = state.stats.begin();

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            let err = PreflightError::InvalidBody(e.to_string());
            return reject(state, &err, &request_id, started);
        }
    };

    let relay_request = match preflight(&body, &state.pre_messages, state.default_max_tokens) {
        Ok(r) => r,
        Err(err) => return reject(state, &err, &request_id, started),
    };

    let span = Span::current();
    span.record("model", relay_request.model.id);
    span.record("stream", relay_request.chat.stream);

    if relay_request.chat.stream {
        stream_response(state, relay_request, request_id, in_flight, started)
    } else {
        buffered_response(state, relay_request, &request_id, started).await
    }
}

fn reject(state: &ChatState, err: &PreflightError, request_id: &str, started: Instant) -> Response {
    warn!(error = %err, code = err.code(), "request rejected before relay");
    state.stats.record_error();
    metrics::record_request(
        err.status().as_u16(),
        Mode::Buffered,
        started.elapsed().as_secs_f64(),
    );
    error_response(
        err.status(),
        err.error_type(),
        err.code(),
        &err.to_string(),
        request_id,
    )
}

async fn buffered_response(
    state: &ChatState,
    request: RelayRequest,
    request_id: &str,
    started: Instant,
) -> Response {
    match state.orchestrator.complete(&request).await {
        Ok(completion) => {
            info!(
                finish_reason = %completion.finish_reason,
                prompt_tokens = completion.usage.prompt_tokens,
                completion_tokens = completion.usage.completion_tokens,
                "chat request completed"
            );
            metrics::record_request(200, Mode::Buffered, started.elapsed().as_secs_f64());
            (
                StatusCode::OK,
                axum::Json(completion_body(&completion, request.model.id)),
            )
                .into_response()
        }
        Err(err) => {
            error!(error = %err, code = err.code(), "chat request failed");
            state.stats.record_error();
            metrics::record_request(
                err.status_code(),
                Mode::Buffered,
                started.elapsed().as_secs_f64(),
            );
            relay_error_response(&err, request_id)
        }
    }
}

fn completion_body(completion: &Completion, model: &str) -> Value {
    json!({
        "id": completion_id(),
        "object": "chat.completion",
        "created": unix_now(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": completion.content},
            "finish_reason": completion.finish_reason,
        }],
        "usage": completion.usage,
    })
}

/// Turns relay deltas into OpenAI `chat.completion.chunk` payloads.
struct ChunkWriter {
    id: String,
    model: &'static str,
    created: u64,
    request_id: String,
    role_sent: bool,
}

impl ChunkWriter {
    fn new(model: &'static str, request_id: String) -> Self {
        Self {
            id: completion_id(),
            model,
            created: unix_now(),
            request_id,
            role_sent: false,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>, usage: Option<Value>) -> Value {
        let mut chunk = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        if let Some(usage) = usage {
            chunk["usage"] = usage;
        }
        chunk
    }

    /// SSE data payloads for one delta, in order.
    fn frames(&mut self, event: &DeltaEvent) -> Vec<String> {
        match event {
            DeltaEvent::Content(text) => {
                let delta = if self.role_sent {
                    json!({"content": text})
                } else {
                    self.role_sent = true;
                    json!({"role": "assistant", "content": text})
                };
                vec![self.chunk(delta, None, None).to_string()]
            }
            DeltaEvent::Finish { reason, usage } => vec![
                self.chunk(json!({}), Some(reason.as_str()), Some(json!(usage)))
                    .to_string(),
                upstream::DONE_MARKER.to_string(),
            ],
            DeltaEvent::Error(err) => vec![
                error_body(
                    err.error_type(),
                    err.code(),
                    &err.to_string(),
                    &self.request_id,
                )
                .to_string(),
            ],
        }
    }

    /// Frame for a relay task that ended without a terminal event.
    fn interrupted(&self) -> String {
        error_body(
            "upstream_error",
            "stream_interrupted",
            "relay ended without a final event",
            &self.request_id,
        )
        .to_string()
    }
}

/// Per-response streaming state, dropped with the response body.
struct StreamState {
    rx: mpsc::Receiver<DeltaEvent>,
    writer: ChunkWriter,
    stats: ServiceStats,
    started: Instant,
    done: bool,
    _in_flight: InFlight,
}

impl StreamState {
    fn finish(&mut self, status: u16) {
        self.done = true;
        if status != 200 {
            self.stats.record_error();
        }
        metrics::record_request(status, Mode::Stream, self.started.elapsed().as_secs_f64());
    }

    async fn next_frames(&mut self) -> Option<Vec<String>> {
        if self.done {
            return None;
        }
        let Some(event) = self.rx.recv().await else {
            warn!("relay task ended without a terminal event");
            self.finish(StatusCode::BAD_GATEWAY.as_u16());
            return Some(vec![self.writer.interrupted()]);
        };
        match &event {
            DeltaEvent::Content(_) => {}
            DeltaEvent::Finish { reason, usage } => {
                info!(
                    finish_reason = %reason,
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "chat stream completed"
                );
                self.finish(200);
            }
            DeltaEvent::Error(err) => {
                error!(error = %err, code = err.code(), "chat stream failed");
                self.finish(err.status_code());
            }
        }
        Some(self.writer.frames(&event))
    }
}

fn stream_response(
    state: &ChatState,
    request: RelayRequest,
    request_id: String,
    in_flight: InFlight,
    started: Instant,
) -> Response {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let model = request.model.id;

    let orchestrator = state.orchestrator.clone();
    tokio::spawn(
        async move { orchestrator.stream(&request, tx).await }.instrument(Span::current()),
    );

    let stream_state = StreamState {
        rx,
        writer: ChunkWriter::new(model, request_id),
        stats: state.stats.clone(),
        started,
        done: false,
        _in_flight: in_flight,
    };

    let events = futures_util::stream::unfold(stream_state, |mut st| async move {
        let frames = st.next_frames().await?;
        Some((futures_util::stream::iter(frames), st))
    })
    .flatten()
    .map(|data| Ok::<Event, Infallible>(Event::default().data(data)));

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// OpenAI-shaped model list built from the registry.
pub fn model_list() -> Value {
    let data: Vec<Value> = models()
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "object": "model",
                "owned_by": m.source.label(),
            })
        })
        .collect();
    json!({"object": "list", "data": data})
}
