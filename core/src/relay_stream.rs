//! Relay between the completion service and the chat client.
//!
//! [`ChatRelay`] owns the upstream credential and generation parameters. It
//! issues one streaming chat-completion request and re-emits the text deltas
//! as a flat byte stream, so callers never see the upstream wire format.

use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use futures::StreamExt;
use futures::TryStreamExt;
use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::DropGuard;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::config::RelayConfig;
use crate::error::RelayErr;
use crate::error::Result;
use crate::models::Message;
use crate::sse::EventRecord;
use crate::sse::decode_events;

/// Sentinel data payload that ends an upstream stream.
const DONE_SENTINEL: &str = "[DONE]";

/// Substituted for a frame whose payload could not be interpreted.
pub const FRAME_PLACEHOLDER: &str = "E";

/// Source of the opaque bearer token sent upstream.
pub trait TokenProvider: Send + Sync {
    /// `None` sends the request without an `Authorization` header.
    fn bearer_token(&self) -> Option<String>;
}

/// A token fixed at construction, e.g. taken from the caller's cookie.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl TokenProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

pub struct ChatRelay {
    client: reqwest::Client,
    config: RelayConfig,
    tokens: Arc<dyn TokenProvider>,
}

impl ChatRelay {
    pub fn new(config: RelayConfig, tokens: Arc<dyn TokenProvider>) -> Self {
        Self::with_client(reqwest::Client::new(), config, tokens)
    }

    /// Reuses an existing connection pool.
    pub fn with_client(
        client: reqwest::Client,
        config: RelayConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            client,
            config,
            tokens,
        }
    }

    /// Issues the upstream request for `messages` (already windowed) and
    /// returns the relayed byte stream.
    ///
    /// Fails with [`RelayErr::UpstreamRequest`] when the completion service
    /// does not answer with a success status; no stream is produced then.
    pub async fn open(&self, messages: &[Message]) -> Result<RelayStream> {
        let payload = self.build_payload(messages);
        let url = self.config.endpoint_url.as_str();

        debug!(url, messages = messages.len(), "POST (chat relay)");
        trace!("request payload: {}", payload);

        let mut req_builder = self.client.post(url);
        if let Some(token) = self.tokens.bearer_token() {
            req_builder = req_builder.bearer_auth(token);
        }
        let res = req_builder
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&payload)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "upstream completion request rejected");
            return Err(RelayErr::UpstreamRequest { status, body });
        }

        let abort = CancellationToken::new();
        let (tx_bytes, rx_bytes) = mpsc::channel::<Result<Bytes>>(16);
        let stream = res.bytes_stream().map_err(RelayErr::Reqwest);
        tokio::spawn(process_relay_sse(
            stream,
            tx_bytes,
            abort.clone(),
            self.config.stream_idle_timeout(),
        ));

        Ok(RelayStream {
            rx_bytes,
            abort: abort.clone(),
            _abort_on_drop: abort.drop_guard(),
        })
    }

    fn build_payload(&self, messages: &[Message]) -> Value {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        wire.push(json!({"role": "system", "content": self.config.system_prompt}));
        for message in messages {
            wire.push(json!({"role": message.role.as_str(), "content": message.content}));
        }

        let mut payload = json!({
            "messages": wire,
            "max_tokens": self.config.max_tokens,
            "stream": true,
        });
        if let Some(model) = &self.config.model {
            payload["model"] = json!(model);
        }
        payload
    }
}

/// Relayed reply: raw UTF-8 text fragments in arrival order.
///
/// Dropping the stream sets the abort signal, so the producer stops at the
/// next upstream event instead of draining the reply.
pub struct RelayStream {
    rx_bytes: mpsc::Receiver<Result<Bytes>>,
    abort: CancellationToken,
    _abort_on_drop: DropGuard,
}

impl RelayStream {
    /// Stops forwarding. The stream then ends without an error, dropping
    /// fragments that were already buffered.
    pub fn abort(&self) {
        self.abort.cancel();
    }
}

impl Stream for RelayStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.abort.is_cancelled() {
            return Poll::Ready(None);
        }
        self.rx_bytes.poll_recv(cx)
    }
}

/// What one upstream data payload turns into on the output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FrameAction {
    /// Forward the fragment and keep going.
    Emit(String),
    /// Forward the fragment, then close the output.
    EmitThenClose(String),
    /// Close the output without emitting anything.
    Close,
}

pub(crate) fn transform_event(data: &str) -> FrameAction {
    if data == DONE_SENTINEL {
        return FrameAction::Close;
    }

    match parse_delta(data) {
        Some((text, true)) => FrameAction::EmitThenClose(text),
        Some((text, false)) => FrameAction::Emit(text),
        None => {
            warn!("unparseable completion frame, substituting placeholder: {data}");
            FrameAction::Emit(FRAME_PLACEHOLDER.to_string())
        }
    }
}

/// Extracts `choices[0].delta.content` and whether `choices[0]` carries a
/// finish reason. `None` for anything that is not that shape. A missing or
/// `null` content is an empty fragment.
fn parse_delta(data: &str) -> Option<(String, bool)> {
    let chunk: Value = serde_json::from_str(data).ok()?;
    let choice = chunk.get("choices")?.get(0)?;
    let delta = choice.get("delta")?.as_object()?;

    let text = match delta.get("content") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(_) => return None,
    };
    let finished = match choice.get("finish_reason") {
        Some(Value::String(reason)) => !reason.is_empty(),
        _ => false,
    };
    Some((text, finished))
}

/// Drives the upstream byte stream through the event decoder and forwards
/// the text deltas to `tx_bytes` until a terminal signal.
async fn process_relay_sse<S>(
    stream: S,
    tx_bytes: mpsc::Sender<Result<Bytes>>,
    abort: CancellationToken,
    idle_timeout: Duration,
) where
    S: Stream<Item = Result<Bytes>> + Send + Unpin + 'static,
{
    let mut records = decode_events(stream);

    loop {
        let next = tokio::select! {
            biased;
            _ = abort.cancelled() => {
                debug!("relay aborted");
                return;
            }
            next = timeout(idle_timeout, records.next()) => next,
        };

        let record = match next {
            Ok(Some(Ok(record))) => record,
            Ok(Some(Err(e))) => {
                let _ = tx_bytes.send(Err(e)).await;
                return;
            }
            // Upstream closed without a sentinel; the reply is whatever
            // arrived.
            Ok(None) => return,
            Err(_) => {
                let _ = tx_bytes
                    .send(Err(RelayErr::Stream("idle timeout waiting for SSE".into())))
                    .await;
                return;
            }
        };

        let data = match record {
            EventRecord::Event { data } => data,
            EventRecord::ReconnectInterval { value } => {
                trace!("ignoring reconnect interval of {value}ms");
                continue;
            }
        };
        trace!("upstream SSE: {data:?}");

        let (text, close) = match transform_event(&data) {
            FrameAction::Close => return,
            FrameAction::Emit(text) => (text, false),
            FrameAction::EmitThenClose(text) => (text, true),
        };

        if tx_bytes.send(Ok(Bytes::from(text))).await.is_err() {
            debug!("relay receiver dropped");
            return;
        }
        if close {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio_test::io::Builder as IoBuilder;
    use tokio_util::io::ReaderStream;

    fn delta(text: &str) -> String {
        json!({"choices": [{"delta": {"content": text}, "finish_reason": null}]}).to_string()
    }

    fn frame(data: &str) -> String {
        format!("data: {data}\n\n")
    }

    /// Runs the relay processor over pre-chunked bytes and returns every item
    /// it forwarded, in order.
    async fn relay_chunks(chunks: &[&[u8]]) -> Vec<Result<Bytes>> {
        let mut builder = IoBuilder::new();
        for chunk in chunks {
            builder.read(chunk);
        }
        let stream = ReaderStream::new(builder.build()).map_err(RelayErr::Io);
        let (tx, mut rx) = mpsc::channel::<Result<Bytes>>(16);
        tokio::spawn(process_relay_sse(
            stream,
            tx,
            CancellationToken::new(),
            Duration::from_secs(5),
        ));

        let mut out = Vec::new();
        while let Some(item) = rx.recv().await {
            out.push(item);
        }
        out
    }

    fn texts(items: Vec<Result<Bytes>>) -> Vec<String> {
        items
            .into_iter()
            .map(|item| String::from_utf8(item.expect("relay error").to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn done_sentinel_closes() {
        assert_eq!(transform_event("[DONE]"), FrameAction::Close);
    }

    #[test]
    fn delta_content_is_emitted() {
        assert_eq!(
            transform_event(&delta("Hel")),
            FrameAction::Emit("Hel".to_string())
        );
    }

    #[test]
    fn finish_reason_closes_after_final_fragment() {
        let data = json!({"choices": [{"delta": {"content": "!"}, "finish_reason": "stop"}]});
        assert_eq!(
            transform_event(&data.to_string()),
            FrameAction::EmitThenClose("!".to_string())
        );
    }

    #[test]
    fn missing_content_emits_empty_fragment() {
        let data = json!({"choices": [{"delta": {"role": "assistant"}}]});
        assert_eq!(
            transform_event(&data.to_string()),
            FrameAction::Emit(String::new())
        );
    }

    #[test]
    fn malformed_payloads_become_placeholder() {
        let placeholder = FrameAction::Emit(FRAME_PLACEHOLDER.to_string());
        for data in [
            "not json",
            "{\"choices\": []}",
            "{\"choices\": [{}]}",
            "{\"error\": {\"message\": \"overloaded\"}}",
            "{\"choices\": [{\"delta\": {\"content\": 42}}]}",
        ] {
            assert_eq!(transform_event(data), placeholder, "payload {data}");
        }
    }

    #[tokio::test]
    async fn forwards_deltas_until_done() {
        let body = [frame(&delta("Hel")), frame(&delta("lo")), frame("[DONE]")].concat();
        let items = relay_chunks(&[body.as_bytes()]).await;
        assert_eq!(texts(items), vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn nothing_is_emitted_after_done() {
        let body = [frame(&delta("a")), frame("[DONE]"), frame(&delta("late"))].concat();
        let items = relay_chunks(&[body.as_bytes()]).await;
        assert_eq!(texts(items), vec!["a"]);
    }

    #[tokio::test]
    async fn done_first_closes_with_zero_bytes() {
        let body = [frame("[DONE]"), frame(&delta("ignored"))].concat();
        let items = relay_chunks(&[body.as_bytes()]).await;
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn malformed_frame_yields_placeholder_and_stream_continues() {
        let body = [frame(&delta("a")), frame("{oops"), frame(&delta("b")), frame("[DONE]")].concat();
        let items = relay_chunks(&[body.as_bytes()]).await;
        assert_eq!(texts(items), vec!["a", FRAME_PLACEHOLDER, "b"]);
    }

    #[tokio::test]
    async fn finish_reason_ends_stream() {
        let last = json!({"choices": [{"delta": {"content": "."}, "finish_reason": "length"}]});
        let body = [frame(&delta("a")), frame(&last.to_string()), frame(&delta("after"))].concat();
        let items = relay_chunks(&[body.as_bytes()]).await;
        assert_eq!(texts(items), vec!["a", "."]);
    }

    #[tokio::test]
    async fn frames_split_across_reads_are_reassembled() {
        let body = [frame(&delta("split")), frame("[DONE]")].concat();
        let (head, tail) = body.as_bytes().split_at(11);
        let items = relay_chunks(&[head, tail]).await;
        assert_eq!(texts(items), vec!["split"]);
    }

    #[tokio::test]
    async fn upstream_eof_without_sentinel_closes_normally() {
        let body = frame(&delta("partial"));
        let items = relay_chunks(&[body.as_bytes()]).await;
        assert_eq!(texts(items), vec!["partial"]);
    }

    #[tokio::test]
    async fn abort_stops_forwarding_without_error() {
        let (tx_up, rx_up) = mpsc::unbounded_channel::<Result<Bytes>>();
        let upstream = tokio_stream_from(rx_up);
        let (tx, mut rx) = mpsc::channel::<Result<Bytes>>(16);
        let abort = CancellationToken::new();
        let task = tokio::spawn(process_relay_sse(
            upstream,
            tx,
            abort.clone(),
            Duration::from_secs(5),
        ));

        tx_up.send(Ok(Bytes::from(frame(&delta("first"))))).unwrap();
        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first, Bytes::from("first"));

        abort.cancel();
        task.await.unwrap();
        let _ = tx_up.send(Ok(Bytes::from(frame(&delta("second")))));

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn idle_upstream_times_out() {
        let (_tx_up, rx_up) = mpsc::unbounded_channel::<Result<Bytes>>();
        let (tx, mut rx) = mpsc::channel::<Result<Bytes>>(16);
        tokio::spawn(process_relay_sse(
            tokio_stream_from(rx_up),
            tx,
            CancellationToken::new(),
            Duration::from_millis(20),
        ));

        let item = rx.recv().await.unwrap();
        assert!(matches!(item, Err(RelayErr::Stream(_))));
        assert!(rx.recv().await.is_none());
    }

    fn tokio_stream_from(
        rx: mpsc::UnboundedReceiver<Result<Bytes>>,
    ) -> impl Stream<Item = Result<Bytes>> + Send + Unpin + 'static {
        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed()
    }
}
