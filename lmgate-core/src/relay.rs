//! Streaming relay: upstream [`ChunkStream`] in, client SSE frames out.
//!
//! Guarantees, per session:
//! - frames leave in upstream arrival order, one frame per forwarded chunk;
//! - exactly one `data: [DONE]` frame, always last, also after failures;
//! - an upstream failure becomes one in-band error frame before the sentinel;
//! - the next upstream chunk is pulled only when the transport asks for the
//!   next frame, so a slow client throttles the backend read.
//!
//! Dropping the relay stream (client went away) drops the upstream stream and
//! with it the backend connection.

use std::time::Instant;

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde_json::json;
use tracing::{debug, field, info, info_span, trace, warn, Span};
use tracing_futures::Instrument;

use crate::config::RelayCfg;
use crate::error::GatewayError;
use crate::model::{ChatCompletionChunk, FinishReason, StreamChunk};
use crate::stream::ChunkStream;
use crate::telemetry::{emit_completion, CompletionLog};

/// Outbound frames, already encoded as `data: ...\n\n`.
pub type RelayStream = BoxStream<'static, Bytes>;

pub const SENTINEL_FRAME: &[u8] = b"data: [DONE]\n\n";

/// One client-visible event.
#[derive(Debug)]
pub enum RelayEvent {
    Chunk(ChatCompletionChunk),
    Error { kind: &'static str, message: String },
    Done,
}

impl RelayEvent {
    pub fn error(err: &GatewayError) -> Self {
        Self::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Self::Chunk(chunk) => match serde_json::to_string(chunk) {
                Ok(json) => Bytes::from(format!("data: {json}\n\n")),
                Err(e) => Self::Error {
                    kind: "internal_error",
                    message: format!("failed to encode chunk: {e}"),
                }
                .encode(),
            },
            Self::Error { kind, message } => {
                let body = json!({
                    "error": {
                        "message": message,
                        "type": kind,
                        "code": null,
                    }
                });
                Bytes::from(format!("data: {body}\n\n"))
            }
            Self::Done => Bytes::from_static(SENTINEL_FRAME),
        }
    }
}

/// Per-connection relay state. Lives inside the relay stream; dropped when the
/// sentinel has been handed out or when the client disconnects.
pub struct RelaySession {
    request_id: String,
    backend: String,
    model: String,
    started: Instant,
    chunks_emitted: u64,
    bytes_emitted: u64,
    dropped: u64,
    seen_id: bool,
    seen_model: bool,
    seen_role: bool,
    finish_reason: Option<FinishReason>,
    error: Option<(&'static str, String)>,
    terminated: bool,
    span: Span,
}

impl RelaySession {
    pub fn new(request_id: &str, backend: &str, model: &str) -> Self {
        let span = info_span!(
            "relay",
            request_id = %request_id,
            backend = %backend,
            model = %model,
            chunks = field::Empty,
            bytes = field::Empty,
            dropped = field::Empty,
            outcome = field::Empty,
        );
        Self {
            request_id: request_id.to_string(),
            backend: backend.to_string(),
            model: model.to_string(),
            started: Instant::now(),
            chunks_emitted: 0,
            bytes_emitted: 0,
            dropped: 0,
            seen_id: false,
            seen_model: false,
            seen_role: false,
            finish_reason: None,
            error: None,
            terminated: false,
            span,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn chunks_emitted(&self) -> u64 {
        self.chunks_emitted
    }

    pub fn bytes_emitted(&self) -> u64 {
        self.bytes_emitted
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Note the chunk's metadata; true when it established something not seen before.
    fn observe_metadata(&mut self, chunk: &StreamChunk) -> bool {
        let mut changed = false;
        if !self.seen_id && !chunk.id().is_empty() {
            self.seen_id = true;
            changed = true;
        }
        if !self.seen_model && !chunk.payload.model.is_empty() {
            self.seen_model = true;
            changed = true;
        }
        if !self.seen_role && chunk.delta_role().is_some() {
            self.seen_role = true;
            changed = true;
        }
        changed
    }

    fn record_chunk(&mut self, len: usize) {
        self.chunks_emitted += 1;
        self.bytes_emitted += len as u64;
    }

    fn record_error(&mut self, err: &GatewayError, len: usize) {
        self.error = Some((err.kind(), err.to_string()));
        self.chunks_emitted += 1;
        self.bytes_emitted += len as u64;
    }

    fn terminate(&mut self, sentinel_len: usize) {
        self.bytes_emitted += sentinel_len as u64;
        self.terminated = true;
        let outcome = if self.error.is_some() { "error" } else { "complete" };
        self.finish(outcome);
        info!(
            request_id = %self.request_id,
            chunks = self.chunks_emitted,
            bytes = self.bytes_emitted,
            dropped = self.dropped,
            latency_ms = self.started.elapsed().as_millis() as u64,
            outcome,
            "stream relay finished"
        );
    }

    fn finish(&self, outcome: &str) {
        self.span.record("chunks", self.chunks_emitted);
        self.span.record("bytes", self.bytes_emitted);
        self.span.record("dropped", self.dropped);
        self.span.record("outcome", outcome);

        let finish = self.finish_reason.map(FinishReason::as_str);
        let mut log = CompletionLog::new()
            .backend(&self.backend)
            .model(&self.model)
            .request_id(&self.request_id)
            .streaming(true)
            .latency_ms(self.started.elapsed().as_millis() as u64)
            .finish_reason_opt(finish)
            .relay_counts(self.chunks_emitted, self.bytes_emitted, self.dropped);
        if let Some((kind, message)) = &self.error {
            log = log.error(kind, message);
        } else if outcome == "client_disconnected" {
            log = log.error(outcome, "client disconnected before the stream completed");
        }
        emit_completion(log);
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        if !self.terminated {
            warn!(
                request_id = %self.request_id,
                chunks = self.chunks_emitted,
                "client disconnected before stream completed; releasing upstream"
            );
            self.finish("client_disconnected");
        }
    }
}

enum Phase {
    Streaming,
    Sentinel,
    Finished,
}

struct RelayState {
    upstream: Option<ChunkStream>,
    session: RelaySession,
    forward_metadata_chunks: bool,
    phase: Phase,
}

/// Relay `upstream` as SSE frames for one client connection.
pub fn relay(upstream: ChunkStream, session: RelaySession, cfg: &RelayCfg) -> RelayStream {
    let span = session.span.clone();
    debug!(parent: &span, "stream relay opened");
    let state = RelayState {
        upstream: Some(upstream),
        session,
        forward_metadata_chunks: cfg.forward_metadata_chunks,
        phase: Phase::Streaming,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            match st.phase {
                Phase::Finished => return None,
                Phase::Sentinel => {
                    let frame = RelayEvent::Done.encode();
                    st.session.terminate(frame.len());
                    st.phase = Phase::Finished;
                    return Some((frame, st));
                }
                Phase::Streaming => {
                    let next = match st.upstream.as_mut() {
                        Some(upstream) => upstream.next().await,
                        None => None,
                    };
                    match next {
                        Some(Ok(chunk)) => {
                            let new_metadata = st.session.observe_metadata(&chunk);
                            let finish = chunk.finish_reason();
                            let forward = finish.is_some()
                                || chunk.has_content()
                                || (st.forward_metadata_chunks && new_metadata);
                            if !forward {
                                st.session.dropped += 1;
                                trace!(seq = chunk.sequence_index, "dropping chunk without visible content");
                                continue;
                            }
                            if let Some(reason) = finish {
                                // Nothing after a finishing chunk reaches the client.
                                st.session.finish_reason = Some(reason);
                                st.upstream = None;
                                st.phase = Phase::Sentinel;
                            }
                            let frame = RelayEvent::Chunk(chunk.payload).encode();
                            st.session.record_chunk(frame.len());
                            return Some((frame, st));
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, kind = err.kind(), "upstream failed mid-stream");
                            st.upstream = None;
                            st.phase = Phase::Sentinel;
                            let frame = RelayEvent::error(&err).encode();
                            st.session.record_error(&err, frame.len());
                            return Some((frame, st));
                        }
                        None => {
                            debug!("upstream ended without a finish reason");
                            st.upstream = None;
                            st.phase = Phase::Sentinel;
                        }
                    }
                }
            }
        }
    })
    .instrument(span)
    .boxed()
}
