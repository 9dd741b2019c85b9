//! Upstream provider transport.
//!
//! [`Upstream`] is the seam between the request pipeline and the network:
//! it takes a built [`UpstreamCall`] and returns a stream of plain text
//! deltas. [`HttpUpstream`] is the reqwest-backed implementation.

pub mod sse;

use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::error::GatewayError;
use crate::providers::{self, StreamEvent, UpstreamCall};
use sse::{SseDecoder, SseEvent};

/// Failure after the response has started streaming.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("provider reported a stream error: {0}")]
    Provider(String),
    #[error("upstream connection failed mid-stream: {0}")]
    Transport(String),
}

pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, StreamError>> + Send>>;

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send the call and return the text stream once the provider has
    /// accepted it. Refusals before streaming come back as [`GatewayError`].
    async fn send(&self, call: UpstreamCall) -> Result<TextStream, GatewayError>;
}

pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn send(&self, call: UpstreamCall) -> Result<TextStream, GatewayError> {
        let UpstreamCall {
            provider,
            url,
            headers,
            body,
        } = call;
        let mut request = self.client.post(&url).json(&body);
        for (name, value) in &headers {
            request = request.header(*name, value);
        }

        let response = request.send().await.map_err(|e| {
            GatewayError::UpstreamUnavailable(format!("{provider}: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let text = response.text().await.unwrap_or_default();
            tracing::warn!(%provider, status = status.as_u16(), "upstream refused request");
            return Err(classify_failure(status.as_u16(), retry_after, &text));
        }

        let parse_event = providers::spec(provider).parse_event;
        Ok(text_stream(response.bytes_stream(), parse_event))
    }
}

/// Map a non-success upstream status onto the gateway taxonomy.
pub fn classify_failure(status: u16, retry_after_secs: Option<u64>, body: &str) -> GatewayError {
    match status {
        401 | 403 => GatewayError::UpstreamUnauthorized,
        429 => GatewayError::UpstreamRateLimited { retry_after_secs },
        _ => GatewayError::Upstream {
            status,
            message: upstream_error_message(body),
        },
    }
}

const MAX_ERROR_MESSAGE_CHARS: usize = 500;

/// Best-effort human-readable message from a provider error body. All three
/// providers nest it at `error.message`.
pub fn upstream_error_message(body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let message = parsed.as_ref().and_then(|v| {
        v.pointer("/error/message")
            .or_else(|| v.get("message"))
            .and_then(Value::as_str)
    });
    let raw = message.unwrap_or(body).trim();
    if raw.is_empty() {
        "Upstream provider error".to_string()
    } else {
        raw.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
    }
}

struct DecodeState<S> {
    inner: Pin<Box<S>>,
    decoder: SseDecoder,
    pending: VecDeque<SseEvent>,
    finished: bool,
}

/// Turn a provider SSE byte stream into a stream of text deltas.
///
/// Non-text events are skipped. A provider error event or a transport error
/// yields one `Err` item and ends the stream. Dropping the returned stream
/// drops the underlying connection.
pub fn text_stream<S, E>(bytes: S, parse_event: fn(&Value) -> StreamEvent) -> TextStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = DecodeState {
        inner: Box::pin(bytes),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };
    let stream = futures::stream::unfold(state, move |mut st| async move {
        loop {
            while let Some(event) = st.pending.pop_front() {
                let data = match event {
                    SseEvent::Done => {
                        st.pending.clear();
                        return None;
                    }
                    SseEvent::Data(data) => data,
                };
                let value = match serde_json::from_str::<Value>(&data) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping unparseable stream event");
                        continue;
                    }
                };
                match parse_event(&value) {
                    StreamEvent::Text(text) if !text.is_empty() => return Some((Ok(text), st)),
                    StreamEvent::Text(_) | StreamEvent::Skip => {}
                    StreamEvent::Error(message) => {
                        tracing::warn!(error = %message, "upstream stream error");
                        st.pending.clear();
                        st.finished = true;
                        return Some((Err(StreamError::Provider(message)), st));
                    }
                }
            }
            if st.finished {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => st.pending.extend(st.decoder.feed(&chunk)),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "upstream stream interrupted");
                    st.finished = true;
                    return Some((Err(StreamError::Transport(e.to_string())), st));
                }
                None => {
                    st.finished = true;
                    st.pending.extend(st.decoder.flush());
                }
            }
        }
    });
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Provider;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
        let owned: Vec<Result<Bytes, std::io::Error>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        futures::stream::iter(owned)
    }

    #[tokio::test]
    async fn forwards_text_deltas_in_order() {
        let parse = providers::spec(Provider::OpenAi).parse_event;
        let stream = text_stream(
            chunks(&[
                "event: response.created\ndata: {\"type\":\"response.created\"}\n\n",
                "data: {\"type\":\"response.output_text.delta\",\"delta\":\"Hel\"}\n\ndata: {\"type\":\"response.output_",
                "text.delta\",\"delta\":\"lo\"}\n\n",
                "data: {\"type\":\"response.completed\"}\n\n",
            ]),
            parse,
        );
        let out: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(out, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn provider_error_ends_stream() {
        let parse = providers::spec(Provider::Anthropic).parse_event;
        let stream = text_stream(
            chunks(&[
                "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"a\"}}\n",
                "data: {\"type\":\"error\",\"error\":{\"message\":\"Overloaded\"}}\n",
                "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"b\"}}\n",
            ]),
            parse,
        );
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_deref().unwrap(), "a");
        assert!(matches!(&items[1], Err(StreamError::Provider(m)) if m == "Overloaded"));
    }

    #[tokio::test]
    async fn done_sentinel_stops_reading() {
        let parse = providers::spec(Provider::OpenAi).parse_event;
        let stream = text_stream(
            chunks(&[
                "data: {\"type\":\"response.output_text.delta\",\"delta\":\"x\"}\ndata: [DONE]\n",
                "data: {\"type\":\"response.output_text.delta\",\"delta\":\"y\"}\n",
            ]),
            parse,
        );
        let out: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(out, vec!["x"]);
    }

    #[tokio::test]
    async fn trailing_event_without_newline_is_delivered() {
        let parse = providers::spec(Provider::Google).parse_event;
        let stream = text_stream(
            chunks(&["data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"end\"}]}}]}"]),
            parse,
        );
        let out: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(out, vec!["end"]);
    }

    #[test]
    fn classifies_upstream_statuses() {
        assert!(matches!(
            classify_failure(401, None, ""),
            GatewayError::UpstreamUnauthorized
        ));
        assert!(matches!(
            classify_failure(403, None, "forbidden"),
            GatewayError::UpstreamUnauthorized
        ));
        assert!(matches!(
            classify_failure(429, Some(7), ""),
            GatewayError::UpstreamRateLimited {
                retry_after_secs: Some(7)
            }
        ));
        match classify_failure(400, None, r#"{"error":{"message":"max_tokens too large"}}"#) {
            GatewayError::Upstream { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "max_tokens too large");
            }
            other => panic!("unexpected {other:?}"),
        }
        match classify_failure(503, None, "") {
            GatewayError::Upstream { message, .. } => assert_eq!(message, "Upstream provider error"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
