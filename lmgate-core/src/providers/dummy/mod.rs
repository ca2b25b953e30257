//! Canned backend for exercising clients without a model loaded.
//!
//! Streams a fixed poem line by line, then echoes the last message back.
//! Non-streaming calls always answer `pong.`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::stream::StreamExt;
use serde_json::json;
use tracing::info;

use crate::config::DummyCfg;
use crate::error::CoreResult;
use crate::http_client::RequestCtx;
use crate::model::{
    ChatCompletionChunk, ChatMessage, Choice, CompletionRequest, CompletionResult, FinishReason,
    Role, StreamChunk, Usage,
};
use crate::provider::{ChatProvider, HealthReport};
use crate::stream::ChunkStream;

const POEM: [&str; 13] = [
    "君不见，黄河之水天上来，奔流到海不复回。",
    "君不见，高堂明镜悲白发，朝如青丝暮成雪。",
    "人生得意须尽欢，莫使金樽空对月。",
    "天生我材必有用，千金散尽还复来。",
    "烹羊宰牛且为乐，会须一饮三百杯。",
    "岑夫子，丹丘生，将进酒，杯莫停。",
    "与君歌一曲，请君为我倾耳听。",
    "钟鼓馔玉不足贵，但愿长醉不复醒。",
    "古来圣贤皆寂寞，惟有饮者留其名。",
    "陈王昔时宴平乐，斗酒十千恣欢谑。",
    "主人何为言少钱，径须沽取对君酌。",
    "五花马，千金裘，呼儿将出换美酒，",
    "与尔同销万古愁。",
];

const ECHO_PREFIX: &str = "\n\n您刚才输入的内容是: ";

#[derive(Debug, Clone)]
pub struct Dummy {
    name: String,
    model: String,
    chunk_delay: Duration,
}

impl Dummy {
    pub fn new(cfg: &DummyCfg) -> Self {
        Self {
            name: "dummy".into(),
            model: cfg.model.clone(),
            chunk_delay: Duration::from_millis(cfg.chunk_delay_ms),
        }
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    fn completion_id(ctx: &RequestCtx<'_>) -> String {
        match ctx.request_id {
            Some(rid) => format!("chatcmpl-{rid}"),
            None => format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        }
    }
}

/// Rough prompt size: characters in the serialized message list.
fn prompt_size(messages: &[ChatMessage]) -> u32 {
    serde_json::to_string(messages)
        .map(|s| s.chars().count() as u32)
        .unwrap_or(0)
}

struct PoemState {
    id: String,
    model: String,
    echo: String,
    delay: Duration,
    next: usize,
}

#[async_trait]
impl ChatProvider for Dummy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        req: &CompletionRequest,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<CompletionResult> {
        let prompt_tokens = prompt_size(&req.messages);
        info!(request_id = ctx.request_id.unwrap_or(""), "returning pong");
        Ok(CompletionResult {
            id: Self::completion_id(ctx),
            object: "chat.completion".into(),
            created: Self::now_secs(),
            model: req.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage {
                    role: Role::Assistant,
                    content: "pong.".into(),
                },
                finish_reason: Some(FinishReason::Stop),
            }],
            usage: Usage {
                prompt_tokens,
                completion_tokens: 1,
                total_tokens: prompt_tokens + 1,
            },
        })
    }

    async fn chat_stream(
        &self,
        req: &CompletionRequest,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<ChunkStream> {
        info!(
            request_id = ctx.request_id.unwrap_or(""),
            lines = POEM.len(),
            "starting poem stream"
        );
        let state = PoemState {
            id: Self::completion_id(ctx),
            model: self.model.clone(),
            echo: format!("{ECHO_PREFIX}{}", req.last_message_content()),
            delay: self.chunk_delay,
            next: 0,
        };

        let stream = futures::stream::unfold(state, |mut st| async move {
            let i = st.next;
            // Every poem line is followed by a pause, the last one included.
            if (1..=POEM.len()).contains(&i) && !st.delay.is_zero() {
                tokio::time::sleep(st.delay).await;
            }
            let (content, finish) = match i {
                i if i < POEM.len() => (Some(format!("{}\n", POEM[i])), None),
                i if i == POEM.len() => (Some(st.echo.clone()), Some(FinishReason::Stop)),
                i if i == POEM.len() + 1 => (None, Some(FinishReason::Stop)),
                _ => return None,
            };
            st.next += 1;
            let chunk = StreamChunk {
                sequence_index: i as u64,
                payload: ChatCompletionChunk::single(
                    st.id.clone(),
                    Dummy::now_secs(),
                    st.model.clone(),
                    content,
                    finish,
                ),
            };
            Some((Ok(chunk), st))
        });
        Ok(stream.boxed())
    }

    async fn list_models(&self) -> CoreResult<serde_json::Value> {
        Ok(json!({
            "object": "list",
            "data": [{"id": self.model, "object": "model", "owned_by": "lmgate"}]
        }))
    }

    async fn health(&self) -> HealthReport {
        HealthReport::healthy(&self.name, "running")
    }
}
