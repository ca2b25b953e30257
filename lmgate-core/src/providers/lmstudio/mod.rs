use std::time::Instant;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{debug, warn};

use crate::assembler::{assemble, UpstreamCompletion};
use crate::config::UpstreamCfg;
use crate::error::CoreResult;
use crate::http_client::{HttpClient, RequestCtx};
use crate::model::{ChatMessage, CompletionRequest, CompletionResult};
use crate::provider::{ChatProvider, HealthReport};
use crate::stream::{decode_sse_chunks, ChunkStream};
use crate::telemetry::{emit_completion, CompletionLog};

/// Key sent when no environment variable is configured. Local servers accept anything.
const PLACEHOLDER_KEY: &str = "lm-studio";

/// OpenAI-compatible local backend (LM Studio, llama.cpp server, vLLM, ...).
#[derive(Debug, Clone)]
pub struct LmStudio {
    http: HttpClient,
    base: String,
    name: String,
    api_key: SecretString,
}

impl LmStudio {
    pub fn new(http: HttpClient, api_key: SecretString, base: &str) -> Self {
        Self {
            http,
            api_key,
            base: base.trim_end_matches('/').to_string(),
            name: "lmstudio".into(),
        }
    }

    pub fn from_cfg(http: HttpClient, cfg: &UpstreamCfg) -> Self {
        let key = cfg
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| PLACEHOLDER_KEY.to_string());
        Self::new(http, SecretString::new(key.into()), &cfg.base_url)
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str) -> Self {
        LmStudio::new(
            HttpClient::new_default().unwrap(),
            SecretString::new("test-key".into()),
            &format!("{server_base}/v1"),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            (
                "Authorization".to_string(),
                format!("Bearer {}", self.api_key.expose_secret()),
            ),
            ("Content-Type".to_string(), "application/json".to_string()),
        ]
    }
}

#[derive(Serialize)]
struct WireChatReq<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    top_p: f32,
    stream: bool,
}

impl<'a> WireChatReq<'a> {
    fn from_request(req: &'a CompletionRequest, stream: bool) -> Self {
        Self {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            top_p: req.top_p,
            stream,
        }
    }
}

#[async_trait]
impl ChatProvider for LmStudio {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        req: &CompletionRequest,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<CompletionResult> {
        let payload = WireChatReq::from_request(req, false);
        let url = format!("{}/chat/completions", self.base);
        let owned_headers = self.headers();
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let started = Instant::now();
        let outcome = match self
            .http
            .post_json::<_, UpstreamCompletion>(&url, &payload, &hdrs, ctx)
            .await
        {
            Ok((raw, _latency)) => assemble(raw),
            Err(e) => Err(e),
        };

        let mut clog = CompletionLog::new()
            .backend(&self.name)
            .model(&req.model)
            .streaming(false)
            .latency_ms(started.elapsed().as_millis() as u64);
        if let Some(rid) = ctx.request_id {
            clog = clog.request_id(rid);
        }
        match &outcome {
            Ok(res) => {
                let finish = res
                    .choices
                    .first()
                    .and_then(|c| c.finish_reason)
                    .map(|f| f.as_str());
                clog = clog.finish_reason_opt(finish).tokens(
                    Some(res.usage.prompt_tokens),
                    Some(res.usage.completion_tokens),
                    Some(res.usage.total_tokens),
                );
                debug!(id = %res.id, choices = res.choices.len(), "completion assembled");
            }
            Err(e) => {
                warn!(error = %e, kind = e.kind(), "upstream completion failed");
                clog = clog.error(e.kind(), &e.to_string());
            }
        }
        emit_completion(clog);
        outcome
    }

    async fn chat_stream(
        &self,
        req: &CompletionRequest,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<ChunkStream> {
        let payload = WireChatReq::from_request(req, true);
        let url = format!("{}/chat/completions", self.base);
        let owned_headers = self.headers();
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let lines = self.http.post_sse_lines(&url, &payload, &hdrs, ctx).await?;
        debug!(%url, "upstream stream opened");
        Ok(decode_sse_chunks(lines))
    }

    async fn list_models(&self) -> CoreResult<serde_json::Value> {
        let url = format!("{}/models", self.base);
        let owned_headers = self.headers();
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let (models, _latency) = self
            .http
            .get_json::<serde_json::Value>(&url, &hdrs, &RequestCtx::default())
            .await?;
        Ok(models)
    }

    async fn health(&self) -> HealthReport {
        match self.list_models().await {
            Ok(_) => HealthReport::healthy(&self.name, "connected"),
            Err(e) => HealthReport::unhealthy(&self.name, e.to_string()),
        }
    }
}
