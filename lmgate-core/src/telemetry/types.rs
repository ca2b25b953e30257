use serde::Serialize;

/// Structured log event for one finished completion.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CompletionLog {
    pub backend: Option<String>,
    pub model: Option<String>,
    pub request_id: Option<String>,
    pub stream: bool,
    pub latency_ms: Option<u64>,

    pub finish_reason: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,

    /// Streaming only: events forwarded to the client, sentinel excluded.
    pub chunks: Option<u64>,
    /// Streaming only: bytes written to the client, sentinel included.
    pub bytes: Option<u64>,
    /// Streaming only: upstream chunks dropped as carrying nothing visible.
    pub dropped: Option<u64>,

    pub tokens_prompt: Option<u32>,
    pub tokens_completion: Option<u32>,
    pub tokens_total: Option<u32>,
}

impl CompletionLog {
    pub fn new() -> Self { Self::default() }
    pub fn backend(mut self, v: &str) -> Self { self.backend = Some(v.to_string()); self }
    pub fn model(mut self, v: &str) -> Self { self.model = Some(v.to_string()); self }
    pub fn request_id(mut self, v: &str) -> Self { self.request_id = Some(v.to_string()); self }
    pub fn streaming(mut self, v: bool) -> Self { self.stream = v; self }
    pub fn latency_ms(mut self, v: u64) -> Self { self.latency_ms = Some(v); self }
    pub fn finish_reason_opt(mut self, v: Option<&str>) -> Self { self.finish_reason = v.map(|s| s.to_string()); self }
    pub fn error(mut self, kind: &str, message: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self.error_message = Some(message.to_string());
        self
    }
    pub fn relay_counts(mut self, chunks: u64, bytes: u64, dropped: u64) -> Self {
        self.chunks = Some(chunks); self.bytes = Some(bytes); self.dropped = Some(dropped); self
    }
    pub fn tokens(mut self, p: Option<u32>, c: Option<u32>, t: Option<u32>) -> Self {
        self.tokens_prompt = p; self.tokens_completion = c; self.tokens_total = t; self
    }
}
