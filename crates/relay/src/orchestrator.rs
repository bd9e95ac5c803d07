//! Failover orchestration across the cookie pool
//!
//! One logical request runs at most one attempt per candidate cookie. The
//! first cookie is picked at random, later ones follow in order. A
//! reactivated cookie is retried once for free: that retry is issued but
//! not counted against the budget.
//!
//! Pool side effects (rate-limit marks, evictions) are applied before the
//! next attempt starts, so concurrent requests see them immediately.
//!
//! In streaming mode content is forwarded as it arrives. Once an attempt
//! has forwarded anything it can no longer be abandoned: a later rejection
//! still updates the pool but ends the request instead of rotating.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cookie_pool::{Cookie, CookiePool};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use upstream::{
    ChatRequest, ModelInfo, ReactivationOutcome, Reactivator, RejectionKind, TokenCounter,
    Transport, UpstreamRequest, build_upstream_body, request_headers,
};

use crate::error::{RelayError, Result};
use crate::events::{Completion, DeltaEvent, Usage};
use crate::translator::{Signal, StreamTranslator};

/// A validated request ready to relay.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub chat: ChatRequest,
    pub model: &'static ModelInfo,
}

/// How one attempt ended, short of a fatal error.
#[derive(Debug)]
enum AttemptOutcome {
    Success {
        content: String,
        reason: String,
    },
    Rejected {
        kind: RejectionKind,
        payload: String,
        forwarded: bool,
    },
}

/// What the pool handling of a rejection decided.
enum Next {
    /// Retry the same cookie without spending budget
    RetrySame,
    /// Move on to the next candidate
    Rotate,
}

pub struct Orchestrator {
    pool: Arc<CookiePool>,
    transport: Arc<dyn Transport>,
    reactivator: Option<Arc<dyn Reactivator>>,
    token_counter: Arc<dyn TokenCounter>,
    rate_limit_lock: Duration,
}

impl Orchestrator {
    pub fn new(
        pool: Arc<CookiePool>,
        transport: Arc<dyn Transport>,
        reactivator: Option<Arc<dyn Reactivator>>,
        token_counter: Arc<dyn TokenCounter>,
        rate_limit_lock: Duration,
    ) -> Self {
        Self {
            pool,
            transport,
            reactivator,
            token_counter,
            rate_limit_lock,
        }
    }

    pub fn pool(&self) -> &Arc<CookiePool> {
        &self.pool
    }

    /// Buffered mode: one final answer with usage, or an error.
    pub async fn complete(&self, request: &RelayRequest) -> Result<Completion> {
        self.run(request, None).await
    }

    /// Streaming mode: content deltas then exactly one `Finish` or `Error`.
    ///
    /// Returns early, without a terminal event, once the receiver is gone.
    pub async fn stream(&self, request: &RelayRequest, tx: mpsc::Sender<DeltaEvent>) {
        let terminal = match self.run(request, Some(&tx)).await {
            Ok(completion) => DeltaEvent::Finish {
                reason: completion.finish_reason,
                usage: completion.usage,
            },
            Err(RelayError::Cancelled) => {
                debug!("caller went away, stream abandoned");
                return;
            }
            Err(e) => DeltaEvent::Error(e),
        };
        if tx.send(terminal).await.is_err() {
            debug!("caller went away before the terminal event");
        }
    }

    #[instrument(skip_all, fields(model = %request.model.id, source = request.model.source.label()))]
    async fn run(
        &self,
        request: &RelayRequest,
        tx: Option<&mpsc::Sender<DeltaEvent>>,
    ) -> Result<Completion> {
        let mut candidates = self.pool.candidates().await;
        if candidates.is_empty() {
            warn!("no cookies available for request");
            return Err(RelayError::NoCredentialsAvailable);
        }
        let max_attempts = candidates.len();
        let mut cookie = candidates
            .pick_random()
            .map_err(|_| RelayError::NoCredentialsAvailable)?;

        let body = build_upstream_body(&request.chat, request.model)
            .map_err(|e| RelayError::InvalidRequest(e.to_string()))?;

        let mut attempts_used = 0usize;
        let mut attempts_issued = 0usize;
        let mut reactivated: HashSet<usize> = HashSet::new();

        while attempts_used < max_attempts {
            if tx.is_some_and(|tx| tx.is_closed()) {
                return Err(RelayError::Cancelled);
            }
            attempts_issued += 1;
            debug!(
                attempt = attempts_issued,
                max_attempts,
                cookie = cookie.fingerprint(),
                "issuing upstream attempt"
            );

            let outcome = self.attempt(&cookie, request, &body, tx).await?;
            let (kind, payload, forwarded) = match outcome {
                AttemptOutcome::Success { content, reason } => {
                    record_attempt("success");
                    info!(
                        attempt = attempts_issued,
                        max_attempts,
                        cookie = cookie.fingerprint(),
                        finish_reason = %reason,
                        "upstream attempt succeeded"
                    );
                    let usage = self.usage(request, &content)?;
                    return Ok(Completion {
                        content,
                        finish_reason: reason,
                        usage,
                    });
                }
                AttemptOutcome::Rejected {
                    kind,
                    payload,
                    forwarded,
                } => (kind, payload, forwarded),
            };
            record_attempt(kind.label());

            if !kind.is_credential_scoped() {
                error!(
                    attempt = attempts_issued,
                    cookie = cookie.fingerprint(),
                    rejection = kind.label(),
                    "fatal upstream rejection"
                );
                return Err(RelayError::Rejected {
                    kind,
                    message: payload,
                });
            }

            warn!(
                attempt = attempts_issued,
                max_attempts,
                cookie = cookie.fingerprint(),
                rejection = kind.label(),
                "cookie rejected by upstream"
            );
            let next = self
                .handle_rejection(&cookie, kind, &mut reactivated, !forwarded)
                .await?;

            if forwarded {
                // Content already reached the caller; a retry would duplicate it.
                error!(
                    cookie = cookie.fingerprint(),
                    rejection = kind.label(),
                    "rejection after content was streamed"
                );
                return Err(RelayError::Rejected {
                    kind,
                    message: payload,
                });
            }

            match next {
                Next::RetrySame => continue,
                Next::Rotate => {
                    attempts_used += 1;
                    if attempts_used >= max_attempts {
                        break;
                    }
                    cookie = candidates
                        .advance()
                        .map_err(|_| RelayError::AllCredentialsExhausted {
                            attempts: attempts_issued,
                        })?;
                }
            }
        }

        warn!(attempts = attempts_issued, max_attempts, "all candidate cookies exhausted");
        Err(RelayError::AllCredentialsExhausted {
            attempts: attempts_issued,
        })
    }

    /// Apply the pool-side consequence of a credential-scoped rejection.
    ///
    /// Reactivation is only attempted when the same cookie may be retried.
    async fn handle_rejection(
        &self,
        cookie: &Cookie,
        kind: RejectionKind,
        reactivated: &mut HashSet<usize>,
        can_retry: bool,
    ) -> Result<Next> {
        match kind {
            RejectionKind::UsageLimitExceeded => {
                let reactivator = match &self.reactivator {
                    Some(r) if can_retry && !reactivated.contains(&cookie.index()) => r,
                    _ => {
                        self.pool.evict(cookie).await;
                        return Ok(Next::Rotate);
                    }
                };
                match reactivator.reactivate(cookie.session_key()).await {
                    Ok(ReactivationOutcome::Reactivated) => {
                        info!(cookie = cookie.fingerprint(), "cookie reactivated, retrying");
                        record_attempt("reactivated");
                        reactivated.insert(cookie.index());
                        Ok(Next::RetrySame)
                    }
                    Ok(ReactivationOutcome::PaymentRequired) => {
                        warn!(cookie = cookie.fingerprint(), "reactivation needs a payment method");
                        self.pool.evict(cookie).await;
                        Ok(Next::Rotate)
                    }
                    Ok(ReactivationOutcome::OtherFailure(detail)) => {
                        error!(cookie = cookie.fingerprint(), detail = %detail, "reactivation failed");
                        Err(RelayError::Reactivation(detail))
                    }
                    Err(e) => {
                        error!(cookie = cookie.fingerprint(), error = %e, "reactivation call failed");
                        Err(RelayError::Reactivation(e.to_string()))
                    }
                }
            }
            RejectionKind::RateLimited => {
                self.pool
                    .mark_rate_limited(cookie, self.rate_limit_lock)
                    .await;
                Ok(Next::Rotate)
            }
            // Transient on the upstream side; the cookie is not blamed.
            _ => Ok(Next::Rotate),
        }
    }

    /// Run one attempt against one cookie.
    async fn attempt(
        &self,
        cookie: &Cookie,
        request: &RelayRequest,
        body: &[u8],
        tx: Option<&mpsc::Sender<DeltaEvent>>,
    ) -> Result<AttemptOutcome> {
        let headers = request_headers(cookie.session_key()).map_err(|e| {
            RelayError::Transport(format!("cookie {}: {e}", cookie.fingerprint()))
        })?;
        let upstream_request = UpstreamRequest {
            source: request.model.source,
            headers,
            body: body.to_vec(),
        };

        let mut events = until_cancelled(tx, self.transport.open(upstream_request))
            .await?
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let mut translator = StreamTranslator::new(request.model.source);
        let mut content = String::new();
        let mut forwarded = false;

        loop {
            let raw = match until_cancelled(tx, events.next()).await? {
                Some(Ok(raw)) => raw,
                Some(Err(e)) => return Err(RelayError::Transport(e.to_string())),
                None => return end_of_stream(content),
            };
            debug!(status = raw.status, terminal = raw.is_terminal, payload = %raw.text, "upstream event");

            let translated = translator.feed(&raw)?;
            if let Some(delta) = translated.content {
                content.push_str(&delta);
                if let Some(tx) = tx {
                    tx.send(DeltaEvent::Content(delta))
                        .await
                        .map_err(|_| RelayError::Cancelled)?;
                    forwarded = true;
                }
            }

            match translated.signal {
                None => continue,
                Some(Signal::Success(reason)) => {
                    return Ok(AttemptOutcome::Success { content, reason });
                }
                Some(Signal::EndOfStream) => return end_of_stream(content),
                Some(Signal::Rejected { kind, payload }) => {
                    return Ok(AttemptOutcome::Rejected {
                        kind,
                        payload,
                        forwarded,
                    });
                }
            }
        }
    }

    fn usage(&self, request: &RelayRequest, completion: &str) -> Result<Usage> {
        let prompt = serde_json::to_string(&request.chat.messages)
            .map_err(|e| RelayError::InvalidRequest(e.to_string()))?;
        let model = request.model.upstream_model;
        Ok(Usage::new(
            self.token_counter.count(&prompt, model),
            self.token_counter.count(completion, model),
        ))
    }
}

/// End of stream without an explicit finish: success if anything arrived.
fn end_of_stream(content: String) -> Result<AttemptOutcome> {
    if content.is_empty() {
        return Err(RelayError::EmptyResponse);
    }
    Ok(AttemptOutcome::Success {
        content,
        reason: "stop".into(),
    })
}

/// Await `fut`, giving up as soon as the streaming receiver is dropped.
async fn until_cancelled<F: Future>(
    tx: Option<&mpsc::Sender<DeltaEvent>>,
    fut: F,
) -> Result<F::Output> {
    match tx {
        None => Ok(fut.await),
        Some(tx) => tokio::select! {
            biased;
            _ = tx.closed() => Err(RelayError::Cancelled),
            out = fut => Ok(out),
        },
    }
}

fn record_attempt(outcome: &'static str) {
    metrics::counter!("relay_attempts_total", "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::sync::Mutex;
    use upstream::{EventStream, RawEvent, TransportError, find_model};

    /// One scripted transport answer.
    enum Reply {
        Events(Vec<RawEvent>),
        Hang,
        Fail(String),
    }

    struct ScriptedTransport {
        replies: Mutex<VecDeque<Reply>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Transport for ScriptedTransport {
        fn open<'a>(
            &'a self,
            request: UpstreamRequest,
        ) -> Pin<Box<dyn Future<Output = std::result::Result<EventStream, TransportError>> + Send + 'a>>
        {
            Box::pin(async move {
                let auth = request.headers["authorization"].to_str().unwrap().to_string();
                self.calls
                    .lock()
                    .unwrap()
                    .push(auth.trim_start_matches("Bearer ").to_string());
                let reply = self
                    .replies
                    .lock()
                    .unwrap()
                    .pop_front()
                    .expect("unscripted transport call");
                match reply {
                    Reply::Events(events) => {
                        let stream: EventStream =
                            Box::pin(futures_util::stream::iter(
                                events.into_iter().map(Ok::<RawEvent, TransportError>),
                            ));
                        Ok(stream)
                    }
                    Reply::Hang => {
                        let stream: EventStream = Box::pin(futures_util::stream::pending::<
                            std::result::Result<RawEvent, TransportError>,
                        >());
                        Ok(stream)
                    }
                    Reply::Fail(msg) => Err(TransportError::Request(msg)),
                }
            })
        }
    }

    struct ScriptedReactivator {
        outcomes: Mutex<VecDeque<std::result::Result<ReactivationOutcome, TransportError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedReactivator {
        fn new(
            outcomes: Vec<std::result::Result<ReactivationOutcome, TransportError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl Reactivator for ScriptedReactivator {
        fn reactivate<'a>(
            &'a self,
            session_key: &'a str,
        ) -> Pin<
            Box<
                dyn Future<Output = std::result::Result<ReactivationOutcome, TransportError>>
                    + Send
                    + 'a,
            >,
        > {
            Box::pin(async move {
                self.calls.lock().unwrap().push(session_key.to_string());
                self.outcomes
                    .lock()
                    .unwrap()
                    .pop_front()
                    .expect("unscripted reactivation")
            })
        }
    }

    /// Counts whitespace-separated words.
    struct WordCounter;

    impl TokenCounter for WordCounter {
        fn count(&self, text: &str, _model: &str) -> usize {
            text.split_whitespace().count()
        }
    }

    const LOCK: Duration = Duration::from_secs(600);

    fn cookies(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("session-key-{i:03}=rest")).collect()
    }

    fn orchestrator(
        pool: Arc<CookiePool>,
        transport: Arc<ScriptedTransport>,
        reactivator: Option<Arc<ScriptedReactivator>>,
    ) -> Orchestrator {
        Orchestrator::new(
            pool,
            transport,
            reactivator.map(|r| r as Arc<dyn Reactivator>),
            Arc::new(WordCounter),
            LOCK,
        )
    }

    fn claude_request() -> RelayRequest {
        let chat: ChatRequest = serde_json::from_value(serde_json::json!({
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 1000,
            "messages": [{"role": "user", "content": "say hi"}]
        }))
        .unwrap();
        RelayRequest {
            chat,
            model: find_model("claude-sonnet-4-20250514").unwrap(),
        }
    }

    fn openrouter_request() -> RelayRequest {
        let chat: ChatRequest = serde_json::from_value(serde_json::json!({
            "model": "openai/gpt-4.1",
            "max_tokens": 1000,
            "messages": [{"role": "user", "content": "say hi"}]
        }))
        .unwrap();
        RelayRequest {
            chat,
            model: find_model("openai/gpt-4.1").unwrap(),
        }
    }

    fn claude_text(text: &str) -> RawEvent {
        RawEvent::data(
            serde_json::json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "text_delta", "text": text}
            })
            .to_string(),
            200,
        )
    }

    fn claude_thinking(text: &str) -> RawEvent {
        RawEvent::data(
            serde_json::json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": {"type": "thinking_delta", "thinking": text}
            })
            .to_string(),
            200,
        )
    }

    fn claude_stop() -> RawEvent {
        RawEvent::data(r#"{"type":"message_stop"}"#, 200)
    }

    fn success(text: &str) -> Reply {
        Reply::Events(vec![claude_text(text), claude_stop()])
    }

    fn rejection(body: &str, status: u16) -> Reply {
        Reply::Events(vec![RawEvent::terminal(body, status)])
    }

    fn rate_limited() -> Reply {
        rejection(r#"{"error":{"message":"Rate limit exceeded"}}"#, 429)
    }

    fn not_logged_in() -> Reply {
        rejection(r#"{"error":"User not logged in"}"#, 401)
    }

    fn usage_limit() -> Reply {
        rejection(r#"{"error":{"message":"You have exceeded your usage limit"}}"#, 402)
    }

    async fn health(pool: &CookiePool) -> (u64, u64, u64) {
        let h = pool.health().await;
        (
            h["cookies_available"].as_u64().unwrap(),
            h["cookies_rate_limited"].as_u64().unwrap(),
            h["cookies_evicted"].as_u64().unwrap(),
        )
    }

    async fn stream_events(orch: &Orchestrator, request: &RelayRequest) -> Vec<DeltaEvent> {
        let (tx, mut rx) = mpsc::channel(64);
        orch.stream(request, tx).await;
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    fn distinct(keys: &[String]) -> usize {
        keys.iter().collect::<HashSet<_>>().len()
    }

    #[tokio::test]
    async fn first_attempt_success_leaves_pool_untouched() {
        let pool = Arc::new(CookiePool::new(cookies(3)));
        let transport = ScriptedTransport::new(vec![success("hello world")]);
        let orch = orchestrator(pool.clone(), transport.clone(), None);

        let completion = orch.complete(&claude_request()).await.unwrap();

        assert_eq!(completion.content, "hello world");
        assert_eq!(completion.finish_reason, "stop");
        assert_eq!(completion.usage, Usage::new(2, 2));
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(health(&pool).await, (3, 0, 0));
    }

    #[tokio::test]
    async fn rate_limited_attempts_rotate_until_success() {
        let pool = Arc::new(CookiePool::new(cookies(4)));
        let transport = ScriptedTransport::new(vec![
            rate_limited(),
            rate_limited(),
            rate_limited(),
            success("final answer"),
        ]);
        let orch = orchestrator(pool.clone(), transport.clone(), None);

        let completion = orch.complete(&claude_request()).await.unwrap();

        assert_eq!(completion.content, "final answer");
        let calls = transport.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(distinct(&calls), 4);
        assert_eq!(health(&pool).await, (1, 3, 0));
    }

    #[tokio::test]
    async fn abandoned_attempt_content_is_discarded() {
        let pool = Arc::new(CookiePool::new(cookies(2)));
        let transport = ScriptedTransport::new(vec![
            Reply::Events(vec![
                claude_text("partial"),
                RawEvent::data(
                    r#"{"type":"error","error":{"type":"rate_limit_error","message":"rate limit"}}"#,
                    200,
                ),
            ]),
            success("winner"),
        ]);
        let orch = orchestrator(pool.clone(), transport, None);

        let completion = orch.complete(&claude_request()).await.unwrap();

        assert_eq!(completion.content, "winner");
        assert_eq!(health(&pool).await, (1, 1, 0));
    }

    #[tokio::test]
    async fn exhaustion_forwards_no_partial_content() {
        let pool = Arc::new(CookiePool::new(cookies(3)));
        let transport =
            ScriptedTransport::new(vec![rate_limited(), not_logged_in(), rate_limited()]);
        let orch = orchestrator(pool.clone(), transport.clone(), None);

        let events = stream_events(&orch, &claude_request()).await;

        assert_eq!(
            events,
            vec![DeltaEvent::Error(RelayError::AllCredentialsExhausted {
                attempts: 3
            })]
        );
        assert_eq!(distinct(&transport.calls()), 3);
        assert_eq!(health(&pool).await, (1, 2, 0));
    }

    #[tokio::test]
    async fn forbidden_stops_without_trying_other_cookies() {
        let pool = Arc::new(CookiePool::new(cookies(3)));
        let transport = ScriptedTransport::new(vec![rejection("Access denied", 403)]);
        let orch = orchestrator(pool.clone(), transport.clone(), None);

        let err = orch.complete(&claude_request()).await.unwrap_err();

        assert!(matches!(
            err,
            RelayError::Rejected {
                kind: RejectionKind::Forbidden,
                ..
            }
        ));
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(health(&pool).await, (3, 0, 0));
    }

    #[tokio::test]
    async fn server_error_is_fatal() {
        let pool = Arc::new(CookiePool::new(cookies(2)));
        let transport = ScriptedTransport::new(vec![rejection(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
            529,
        )]);
        let orch = orchestrator(pool, transport.clone(), None);

        let err = orch.complete(&claude_request()).await.unwrap_err();

        assert!(matches!(
            err,
            RelayError::Rejected {
                kind: RejectionKind::UpstreamServerError,
                ..
            }
        ));
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn unclassified_payload_is_surfaced_verbatim() {
        let pool = Arc::new(CookiePool::new(cookies(2)));
        let transport = ScriptedTransport::new(vec![rejection("teapot", 418)]);
        let orch = orchestrator(pool, transport.clone(), None);

        let err = orch.complete(&claude_request()).await.unwrap_err();

        assert_eq!(
            err,
            RelayError::Rejected {
                kind: RejectionKind::Unclassified,
                message: "teapot".into()
            }
        );
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn not_logged_in_rotates_without_blaming_cookie() {
        let pool = Arc::new(CookiePool::new(cookies(2)));
        let transport = ScriptedTransport::new(vec![not_logged_in(), success("ok")]);
        let orch = orchestrator(pool.clone(), transport, None);

        orch.complete(&claude_request()).await.unwrap();

        assert_eq!(health(&pool).await, (2, 0, 0));
    }

    #[tokio::test]
    async fn reactivation_retries_same_cookie_for_free() {
        let pool = Arc::new(CookiePool::new(cookies(1)));
        let transport = ScriptedTransport::new(vec![usage_limit(), success("back again")]);
        let reactivator = ScriptedReactivator::new(vec![Ok(ReactivationOutcome::Reactivated)]);
        let orch = orchestrator(pool.clone(), transport.clone(), Some(reactivator.clone()));

        let completion = orch.complete(&claude_request()).await.unwrap();

        assert_eq!(completion.content, "back again");
        let calls = transport.calls();
        assert_eq!(calls, vec!["session-key-000", "session-key-000"]);
        assert_eq!(*reactivator.calls.lock().unwrap(), vec!["session-key-000"]);
        assert_eq!(health(&pool).await, (1, 0, 0));
    }

    #[tokio::test]
    async fn second_usage_limit_after_reactivation_evicts() {
        let pool = Arc::new(CookiePool::new(cookies(1)));
        let transport = ScriptedTransport::new(vec![usage_limit(), usage_limit()]);
        let reactivator = ScriptedReactivator::new(vec![Ok(ReactivationOutcome::Reactivated)]);
        let orch = orchestrator(pool.clone(), transport.clone(), Some(reactivator));

        let err = orch.complete(&claude_request()).await.unwrap_err();

        assert_eq!(err, RelayError::AllCredentialsExhausted { attempts: 2 });
        assert_eq!(health(&pool).await, (0, 0, 1));
    }

    #[tokio::test]
    async fn payment_required_evicts_and_rotates() {
        let pool = Arc::new(CookiePool::new(cookies(2)));
        let transport = ScriptedTransport::new(vec![usage_limit(), success("ok")]);
        let reactivator = ScriptedReactivator::new(vec![Ok(ReactivationOutcome::PaymentRequired)]);
        let orch = orchestrator(pool.clone(), transport.clone(), Some(reactivator));

        orch.complete(&claude_request()).await.unwrap();

        assert_eq!(distinct(&transport.calls()), 2);
        assert_eq!(health(&pool).await, (1, 0, 1));
    }

    #[tokio::test]
    async fn reactivation_transport_error_is_fatal() {
        let pool = Arc::new(CookiePool::new(cookies(2)));
        let transport = ScriptedTransport::new(vec![usage_limit()]);
        let reactivator =
            ScriptedReactivator::new(vec![Err(TransportError::Request("connection reset".into()))]);
        let orch = orchestrator(pool.clone(), transport.clone(), Some(reactivator));

        let err = orch.complete(&claude_request()).await.unwrap_err();

        assert!(matches!(err, RelayError::Reactivation(ref m) if m.contains("connection reset")));
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(health(&pool).await, (2, 0, 0));
    }

    #[tokio::test]
    async fn reactivation_other_failure_is_fatal() {
        let pool = Arc::new(CookiePool::new(cookies(2)));
        let transport = ScriptedTransport::new(vec![usage_limit()]);
        let reactivator = ScriptedReactivator::new(vec![Ok(ReactivationOutcome::OtherFailure(
            "500: oops".into(),
        ))]);
        let orch = orchestrator(pool, transport, Some(reactivator));

        let err = orch.complete(&claude_request()).await.unwrap_err();

        assert_eq!(err, RelayError::Reactivation("500: oops".into()));
    }

    #[tokio::test]
    async fn usage_limit_without_reactivator_evicts() {
        let pool = Arc::new(CookiePool::new(cookies(2)));
        let transport = ScriptedTransport::new(vec![usage_limit(), success("ok")]);
        let orch = orchestrator(pool.clone(), transport, None);

        orch.complete(&claude_request()).await.unwrap();

        assert_eq!(health(&pool).await, (1, 0, 1));
        // Evicted cookie is gone for later requests too.
        assert_eq!(pool.candidates().await.len(), 1);
    }

    #[tokio::test]
    async fn empty_pool_fails_without_calling_upstream() {
        let pool = Arc::new(CookiePool::new(Vec::<String>::new()));
        let transport = ScriptedTransport::new(vec![]);
        let orch = orchestrator(pool, transport.clone(), None);

        let err = orch.complete(&claude_request()).await.unwrap_err();

        assert_eq!(err, RelayError::NoCredentialsAvailable);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn malformed_event_is_fatal() {
        let pool = Arc::new(CookiePool::new(cookies(2)));
        let transport =
            ScriptedTransport::new(vec![Reply::Events(vec![RawEvent::data("{oops", 200)])]);
        let orch = orchestrator(pool, transport.clone(), None);

        let err = orch.complete(&claude_request()).await.unwrap_err();

        assert!(matches!(err, RelayError::MalformedEvent(_)));
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn transport_failure_is_fatal() {
        let pool = Arc::new(CookiePool::new(cookies(2)));
        let transport = ScriptedTransport::new(vec![Reply::Fail("dns error".into())]);
        let orch = orchestrator(pool, transport.clone(), None);

        let err = orch.complete(&claude_request()).await.unwrap_err();

        assert!(matches!(err, RelayError::Transport(ref m) if m.contains("dns error")));
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn stream_without_content_is_empty_response() {
        let pool = Arc::new(CookiePool::new(cookies(1)));
        let transport = ScriptedTransport::new(vec![Reply::Events(vec![])]);
        let orch = orchestrator(pool, transport, None);

        let err = orch.complete(&claude_request()).await.unwrap_err();

        assert_eq!(err, RelayError::EmptyResponse);
    }

    #[tokio::test]
    async fn done_after_content_is_success() {
        let pool = Arc::new(CookiePool::new(cookies(1)));
        let transport = ScriptedTransport::new(vec![Reply::Events(vec![
            claude_text("x"),
            RawEvent::data("[DONE]", 200),
        ])]);
        let orch = orchestrator(pool, transport, None);

        let completion = orch.complete(&claude_request()).await.unwrap();

        assert_eq!(completion.content, "x");
        assert_eq!(completion.finish_reason, "stop");
    }

    #[tokio::test]
    async fn streaming_reconstructs_thinking_boundary() {
        let pool = Arc::new(CookiePool::new(cookies(1)));
        let transport = ScriptedTransport::new(vec![Reply::Events(vec![
            claude_thinking("a"),
            claude_thinking("b"),
            claude_text("c"),
            claude_text("d"),
            claude_stop(),
        ])]);
        let orch = orchestrator(pool, transport, None);

        let events = stream_events(&orch, &claude_request()).await;

        assert_eq!(
            events[..4],
            [
                DeltaEvent::Content("<think>\n\na".into()),
                DeltaEvent::Content("b".into()),
                DeltaEvent::Content("</think>\n\nc".into()),
                DeltaEvent::Content("d".into()),
            ]
        );
        assert!(matches!(
            &events[4],
            DeltaEvent::Finish { reason, .. } if reason == "stop"
        ));
        assert_eq!(events.len(), 5);
    }

    #[tokio::test]
    async fn streaming_openrouter_concatenates_to_buffered_answer() {
        let chunk = |content: &str, finish: Option<&str>| {
            RawEvent::data(
                serde_json::json!({
                    "choices": [{"delta": {"content": content}, "finish_reason": finish}]
                })
                .to_string(),
                200,
            )
        };
        let script = || {
            Reply::Events(vec![
                chunk("Hel", None),
                chunk("lo ", None),
                chunk("there", Some("stop")),
                RawEvent::data(r#"{"choices":[],"usage":{"prompt_tokens":3}}"#, 200),
                RawEvent::data("[DONE]", 200),
            ])
        };
        let pool = Arc::new(CookiePool::new(cookies(1)));
        let orch = orchestrator(pool, ScriptedTransport::new(vec![script(), script()]), None);

        let events = stream_events(&orch, &openrouter_request()).await;
        let buffered = orch.complete(&openrouter_request()).await.unwrap();

        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                DeltaEvent::Content(c) => Some(c.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(streamed, "Hello there");
        assert_eq!(streamed, buffered.content);
        let last = events.last().unwrap();
        assert!(matches!(last, DeltaEvent::Finish { reason, .. } if reason == "stop"));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn rejection_after_streamed_content_is_fatal() {
        let pool = Arc::new(CookiePool::new(cookies(2)));
        let transport = ScriptedTransport::new(vec![Reply::Events(vec![
            claude_text("partial"),
            RawEvent::data(
                r#"{"type":"error","error":{"type":"rate_limit_error","message":"rate limit"}}"#,
                200,
            ),
        ])]);
        let orch = orchestrator(pool.clone(), transport.clone(), None);

        let events = stream_events(&orch, &claude_request()).await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], DeltaEvent::Content("partial".into()));
        assert!(matches!(
            &events[1],
            DeltaEvent::Error(RelayError::Rejected {
                kind: RejectionKind::RateLimited,
                ..
            })
        ));
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(health(&pool).await, (1, 1, 0));
    }

    #[tokio::test]
    async fn usage_limit_after_streamed_content_evicts_without_reactivating() {
        let pool = Arc::new(CookiePool::new(cookies(2)));
        let transport = ScriptedTransport::new(vec![Reply::Events(vec![
            claude_text("partial"),
            RawEvent::data(
                r#"{"type":"error","error":{"message":"You have exceeded your usage limit"}}"#,
                200,
            ),
        ])]);
        let reactivator = ScriptedReactivator::new(vec![]);
        let orch = orchestrator(pool.clone(), transport.clone(), Some(reactivator.clone()));

        let events = stream_events(&orch, &claude_request()).await;

        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            DeltaEvent::Error(RelayError::Rejected {
                kind: RejectionKind::UsageLimitExceeded,
                ..
            })
        ));
        assert!(reactivator.calls.lock().unwrap().is_empty());
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(health(&pool).await, (1, 0, 1));
    }

    #[tokio::test]
    async fn dropped_receiver_cancels_hanging_attempt() {
        let pool = Arc::new(CookiePool::new(cookies(2)));
        let transport = ScriptedTransport::new(vec![Reply::Hang]);
        let orch = Arc::new(orchestrator(pool, transport.clone(), None));
        let (tx, rx) = mpsc::channel(8);

        let task = tokio::spawn({
            let orch = orch.clone();
            async move { orch.run(&claude_request(), Some(&tx)).await }
        });
        tokio::task::yield_now().await;
        drop(rx);

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("orchestrator did not observe cancellation")
            .unwrap();
        assert_eq!(result, Err(RelayError::Cancelled));
        assert!(transport.calls().len() <= 1);
    }

    #[test]
    fn attempts_are_counted_by_outcome() {
        use metrics_exporter_prometheus::PrometheusBuilder;

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let pool = Arc::new(CookiePool::new(cookies(2)));
        let orch = orchestrator(
            pool,
            ScriptedTransport::new(vec![rate_limited(), success("ok")]),
            None,
        );

        metrics::with_local_recorder(&recorder, || {
            rt.block_on(async { orch.complete(&claude_request()).await.unwrap() })
        });

        let output = handle.render();
        assert!(output.contains(r#"relay_attempts_total{outcome="rate_limited"} 1"#));
        assert!(output.contains(r#"relay_attempts_total{outcome="success"} 1"#));
    }
}
