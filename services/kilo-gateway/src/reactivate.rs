//! Reactivation of billing-exhausted cookies

use std::future::Future;
use std::pin::Pin;

use reqwest::StatusCode;
use reqwest::header::{COOKIE, HeaderValue};
use tracing::debug;
use upstream::{ReactivationOutcome, Reactivator, TransportError};

/// Upstream error bodies can be whole HTML pages; keep logs bounded.
const MAX_BODY_CHARS: usize = 300;

/// Posts to the configured reactivation endpoint with the session cookie.
pub struct HttpReactivator {
    client: reqwest::Client,
    url: String,
}

impl HttpReactivator {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl Reactivator for HttpReactivator {
    fn reactivate<'a>(
        &'a self,
        session_key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ReactivationOutcome, TransportError>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut cookie = HeaderValue::from_str(session_key)
                .map_err(|_| TransportError::InvalidRequest("session key is not a valid header".into()))?;
            cookie.set_sensitive(true);

            let response = self
                .client
                .post(&self.url)
                .header(COOKIE, cookie)
                .send()
                .await
                .map_err(|e| TransportError::Request(format!("reactivation request failed: {e}")))?;

            let status = response.status();
            debug!(status = status.as_u16(), "reactivation endpoint answered");
            match status {
                StatusCode::OK => Ok(ReactivationOutcome::Reactivated),
                StatusCode::PAYMENT_REQUIRED => Ok(ReactivationOutcome::PaymentRequired),
                _ => {
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| String::from("<no body>"));
                    let body: String = body.chars().take(MAX_BODY_CHARS).collect();
                    Ok(ReactivationOutcome::OtherFailure(format!(
                        "reactivation returned {status}: {body}"
                    )))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use tokio::net::TcpListener;

    async fn start_endpoint(status: u16, body: &'static str) -> String {
        let router = axum::Router::new().route(
            "/reactivate",
            post(move |headers: axum::http::HeaderMap| async move {
                let cookie = headers
                    .get("cookie")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let status = axum::http::StatusCode::from_u16(status).unwrap();
                // Echo the cookie on failure so tests can see what was sent.
                if status == axum::http::StatusCode::OK {
                    (status, body.to_string())
                } else {
                    (status, format!("{body} cookie={cookie}"))
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/reactivate")
    }

    #[tokio::test]
    async fn ok_means_reactivated() {
        let url = start_endpoint(200, "{}").await;
        let reactivator = HttpReactivator::new(reqwest::Client::new(), url);
        let outcome = reactivator.reactivate("sess-1").await.unwrap();
        assert_eq!(outcome, ReactivationOutcome::Reactivated);
    }

    #[tokio::test]
    async fn payment_required_is_distinct() {
        let url = start_endpoint(402, "no card").await;
        let reactivator = HttpReactivator::new(reqwest::Client::new(), url);
        let outcome = reactivator.reactivate("sess-1").await.unwrap();
        assert_eq!(outcome, ReactivationOutcome::PaymentRequired);
    }

    #[tokio::test]
    async fn other_status_carries_status_and_body() {
        let url = start_endpoint(500, "boom").await;
        let reactivator = HttpReactivator::new(reqwest::Client::new(), url);
        match reactivator.reactivate("sess-xyz").await.unwrap() {
            ReactivationOutcome::OtherFailure(message) => {
                assert!(message.contains("500"), "got: {message}");
                assert!(message.contains("boom"), "got: {message}");
                assert!(message.contains("cookie=sess-xyz"), "got: {message}");
            }
            other => panic!("expected OtherFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        let reactivator =
            HttpReactivator::new(reqwest::Client::new(), "http://127.0.0.1:1/reactivate");
        let result = reactivator.reactivate("sess-1").await;
        assert!(matches!(result, Err(TransportError::Request(_))));
    }

    #[tokio::test]
    async fn invalid_session_key_is_rejected_locally() {
        let reactivator = HttpReactivator::new(reqwest::Client::new(), "http://127.0.0.1:1/x");
        let result = reactivator.reactivate("bad\nkey").await;
        assert!(matches!(result, Err(TransportError::InvalidRequest(_))));
    }
}
