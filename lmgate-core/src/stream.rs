//! Upstream chunk streams.
//!
//! Contract for a [`ChunkStream`]:
//! - Items arrive in upstream order, each tagged with a `sequence_index` counting from 0.
//! - The stream is finite and cannot be restarted.
//! - An `Err` item is always the last item; the stream ends right after it.
//! - `data: [DONE]` from the backend ends the stream without an extra item.

use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;

use crate::error::{CoreResult, GatewayError};
use crate::http_client::SseStream;
use crate::model::{ChatCompletionChunk, StreamChunk};

/// Boxed stream of upstream chunks. Providers that support streaming return this.
pub type ChunkStream = BoxStream<'static, CoreResult<StreamChunk>>;

const DONE_MARKER: &str = "[DONE]";

enum Dispatch {
    Nothing,
    Done,
    Item(CoreResult<StreamChunk>),
}

struct DecodeState {
    lines: SseStream,
    data: Vec<String>,
    next_index: u64,
    done: bool,
}

impl DecodeState {
    /// Turn the buffered `data:` lines into one event.
    fn dispatch(&mut self) -> Dispatch {
        if self.data.is_empty() {
            return Dispatch::Nothing;
        }
        let payload = self.data.join("\n");
        self.data.clear();
        let payload = payload.trim();
        if payload == DONE_MARKER {
            return Dispatch::Done;
        }
        let item = parse_chunk(payload).map(|payload| {
            let chunk = StreamChunk {
                sequence_index: self.next_index,
                payload,
            };
            self.next_index += 1;
            chunk
        });
        Dispatch::Item(item)
    }
}

fn parse_chunk(payload: &str) -> CoreResult<ChatCompletionChunk> {
    let value: Value =
        serde_json::from_str(payload).map_err(|e| GatewayError::UpstreamProtocolError {
            message: format!("malformed chunk payload: {e}"),
        })?;
    // Backends report failures in-band once the stream has started.
    if let Some(err) = value.get("error").filter(|_| value.get("choices").is_none()) {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| err.to_string());
        return Err(GatewayError::UpstreamProtocolError {
            message: format!("backend aborted stream: {message}"),
        });
    }
    serde_json::from_value(value).map_err(|e| GatewayError::UpstreamProtocolError {
        message: format!("unexpected chunk shape: {e}"),
    })
}

/// Split an SSE line into field name and value (one leading space stripped).
fn split_field(line: &str) -> (&str, &str) {
    match line.split_once(':') {
        Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
        None => (line, ""),
    }
}

/// Decode an SSE line stream of OpenAI-style `chat.completion.chunk` events.
pub fn decode_sse_chunks(lines: SseStream) -> ChunkStream {
    let state = DecodeState {
        lines,
        data: Vec::new(),
        next_index: 0,
        done: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        loop {
            let dispatched = match st.lines.next().await {
                Some(Ok(sse)) => {
                    if sse.line.is_empty() {
                        st.dispatch()
                    } else {
                        if !sse.line.starts_with(':') {
                            let (field, value) = split_field(&sse.line);
                            if field == "data" {
                                st.data.push(value.to_string());
                            }
                        }
                        Dispatch::Nothing
                    }
                }
                Some(Err(e)) => Dispatch::Item(Err(e)),
                None => match st.dispatch() {
                    Dispatch::Nothing => Dispatch::Done,
                    other => {
                        // Flush a trailing event that had no blank line after it.
                        st.done = true;
                        other
                    }
                },
            };
            match dispatched {
                Dispatch::Nothing => continue,
                Dispatch::Done => return None,
                Dispatch::Item(item) => {
                    if item.is_err() {
                        st.done = true;
                    }
                    return Some((item, st));
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::SseLine;
    use crate::model::FinishReason;

    fn lines(raw: &[&str]) -> SseStream {
        let items: Vec<CoreResult<SseLine>> = raw
            .iter()
            .map(|l| {
                Ok(SseLine {
                    line: l.to_string(),
                })
            })
            .collect();
        Box::pin(futures::stream::iter(items))
    }

    fn content_event(id: &str, text: &str) -> String {
        format!(
            r#"data: {{"id":"{id}","object":"chat.completion.chunk","created":1,"model":"m","choices":[{{"index":0,"delta":{{"content":"{text}"}},"finish_reason":null}}]}}"#
        )
    }

    async fn collect(s: ChunkStream) -> Vec<CoreResult<StreamChunk>> {
        s.collect().await
    }

    #[tokio::test]
    async fn decodes_events_in_order_until_done() {
        let a = content_event("c", "Hel");
        let b = content_event("c", "lo");
        let out = collect(decode_sse_chunks(lines(&[
            ": keep-alive",
            &a,
            "",
            &b,
            "",
            "data: [DONE]",
            "",
            &content_event("c", "never"),
            "",
        ])))
        .await;
        assert_eq!(out.len(), 2);
        let first = out[0].as_ref().unwrap();
        let second = out[1].as_ref().unwrap();
        assert_eq!(first.sequence_index, 0);
        assert_eq!(first.delta_content(), Some("Hel"));
        assert_eq!(second.sequence_index, 1);
        assert_eq!(second.delta_content(), Some("lo"));
    }

    #[tokio::test]
    async fn trailing_event_without_blank_line_is_flushed() {
        let out = collect(decode_sse_chunks(lines(&[&content_event("c", "x")]))).await;
        assert_eq!(out.len(), 1);
        assert!(out[0].is_ok());
    }

    #[tokio::test]
    async fn multi_line_data_is_joined() {
        let out = collect(decode_sse_chunks(lines(&[
            "event: message",
            r#"data: {"id":"c","choices":[{"delta":{"content":"a"},"#,
            r#"data: "finish_reason":"stop"}]}"#,
            "",
        ])))
        .await;
        let chunk = out[0].as_ref().unwrap();
        assert_eq!(chunk.finish_reason(), Some(FinishReason::Stop));
        assert_eq!(chunk.payload.object, "chat.completion.chunk");
    }

    #[tokio::test]
    async fn malformed_payload_ends_stream_with_error() {
        let out = collect(decode_sse_chunks(lines(&[
            &content_event("c", "ok"),
            "",
            "data: {not json",
            "",
            &content_event("c", "after"),
            "",
        ])))
        .await;
        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        assert!(matches!(
            out[1],
            Err(GatewayError::UpstreamProtocolError { .. })
        ));
    }

    #[tokio::test]
    async fn in_band_backend_error_is_surfaced() {
        let out = collect(decode_sse_chunks(lines(&[
            r#"data: {"error":{"message":"model crashed"}}"#,
            "",
        ])))
        .await;
        match &out[0] {
            Err(GatewayError::UpstreamProtocolError { message }) => {
                assert!(message.contains("model crashed"))
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_error_is_last_item() {
        let items: Vec<CoreResult<SseLine>> = vec![
            Ok(SseLine {
                line: content_event("c", "a"),
            }),
            Ok(SseLine {
                line: String::new(),
            }),
            Err(GatewayError::UpstreamTimeout),
            Ok(SseLine {
                line: content_event("c", "b"),
            }),
        ];
        let out = collect(decode_sse_chunks(Box::pin(futures::stream::iter(items)))).await;
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], Err(GatewayError::UpstreamTimeout)));
    }

    #[test]
    fn split_field_handles_missing_space_and_colon() {
        assert_eq!(split_field("data:x"), ("data", "x"));
        assert_eq!(split_field("data: x"), ("data", "x"));
        assert_eq!(split_field("data"), ("data", ""));
    }
}
