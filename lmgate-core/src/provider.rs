use async_trait::async_trait;
use serde::Serialize;

use crate::error::CoreResult;
use crate::http_client::RequestCtx;
use crate::model::{CompletionRequest, CompletionResult};
use crate::stream::ChunkStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Result of a backend health probe, rendered as the `/health` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn healthy(backend: &str, detail: &str) -> Self {
        Self {
            status: HealthStatus::Healthy,
            backend: backend.to_string(),
            detail: Some(detail.to_string()),
            error: None,
        }
    }

    pub fn unhealthy(backend: &str, error: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            backend: backend.to_string(),
            detail: None,
            error: Some(error.into()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// A backend that can answer chat completions, one call per request, no retries.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, req: &CompletionRequest, ctx: &RequestCtx<'_>)
    -> CoreResult<CompletionResult>;

    /// Open a streaming completion. Failures before the first chunk are returned
    /// here; later failures arrive as the stream's last item.
    async fn chat_stream(
        &self,
        req: &CompletionRequest,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<ChunkStream>;

    /// Upstream model list, passed through as-is.
    async fn list_models(&self) -> CoreResult<serde_json::Value>;

    async fn health(&self) -> HealthReport;
}
