//! reqwest-backed upstream transport
//!
//! Only a 2xx `text/event-stream` response is decoded as server-sent events.
//! Anything else is drained and handed to the relay as one terminal event so
//! the classifier sees the body the upstream chose to send.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;
use upstream::{EventStream, RawEvent, Transport, TransportError, UpstreamRequest};

/// Build the shared outbound client.
///
/// `timeout` bounds one whole attempt, stream included.
pub fn build_client(timeout: Duration, proxy_url: Option<&str>) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(proxy_url) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
    }
    builder.build()
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"))
}

impl Transport for HttpTransport {
    fn open<'a>(
        &'a self,
        request: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!("{}{}", self.base_url, request.source.endpoint_path());
            let response = self
                .client
                .post(&url)
                .headers(request.headers)
                .body(request.body)
                .send()
                .await
                .map_err(|e| TransportError::Request(e.to_string()))?;

            let status = response.status().as_u16();
            if !response.status().is_success() || !is_event_stream(&response) {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|e| format!("<unreadable body: {e}>"));
                debug!(status, body_len = body.len(), "upstream answered without a stream");
                let event = RawEvent::terminal(body, status);
                let stream: EventStream =
                    Box::pin(futures_util::stream::once(async move { Ok(event) }));
                return Ok(stream);
            }

            let events = response
                .bytes_stream()
                .eventsource()
                .filter_map(move |item| {
                    let mapped = match item {
                        Ok(event) if event.data.trim().is_empty() => None,
                        Ok(event) => Some(Ok(RawEvent::data(event.data, status))),
                        Err(e) => Some(Err(TransportError::Stream(e.to_string()))),
                    };
                    futures_util::future::ready(mapped)
                });
            let stream: EventStream = Box::pin(events);
            Ok(stream)
        })
    }
}
