//! Maps one complete upstream `chat.completion` into [`CompletionResult`].
//!
//! The wire types here accept anything shaped roughly right; `assemble` decides
//! which absences are fatal. Pure, no I/O.

use serde::Deserialize;

use crate::error::{CoreResult, GatewayError};
use crate::model::{ChatMessage, Choice, CompletionResult, FinishReason, Role, Usage};

#[derive(Debug, Deserialize, Default)]
pub struct UpstreamCompletion {
    pub id: Option<String>,
    pub object: Option<String>,
    pub created: Option<u64>,
    pub model: Option<String>,
    pub choices: Option<Vec<UpstreamChoice>>,
    pub usage: Option<UpstreamUsage>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpstreamChoice {
    pub index: Option<u32>,
    pub message: Option<UpstreamMessage>,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpstreamMessage {
    pub role: Option<Role>,
    pub content: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpstreamUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

fn missing(field: impl Into<String>) -> GatewayError {
    GatewayError::MalformedUpstreamResponse {
        field: field.into(),
    }
}

pub fn assemble(upstream: UpstreamCompletion) -> CoreResult<CompletionResult> {
    let id = upstream.id.ok_or_else(|| missing("id"))?;
    let created = upstream.created.ok_or_else(|| missing("created"))?;
    let model = upstream.model.ok_or_else(|| missing("model"))?;
    let raw_choices = upstream.choices.ok_or_else(|| missing("choices"))?;

    let choices = raw_choices
        .into_iter()
        .enumerate()
        .map(|(pos, c)| {
            let message = c
                .message
                .ok_or_else(|| missing(format!("choices[{pos}].message")))?;
            let content = message
                .content
                .ok_or_else(|| missing(format!("choices[{pos}].message.content")))?;
            Ok(Choice {
                index: c.index.unwrap_or(pos as u32),
                message: ChatMessage {
                    role: message.role.unwrap_or(Role::Assistant),
                    content,
                },
                finish_reason: c.finish_reason,
            })
        })
        .collect::<CoreResult<Vec<_>>>()?;

    let usage = upstream
        .usage
        .map(|u| {
            let prompt = u.prompt_tokens.unwrap_or(0);
            let completion = u.completion_tokens.unwrap_or(0);
            Usage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: u
                    .total_tokens
                    .unwrap_or_else(|| prompt.saturating_add(completion)),
            }
        })
        .unwrap_or_default();

    Ok(CompletionResult {
        id,
        object: upstream.object.unwrap_or_else(|| "chat.completion".into()),
        created,
        model,
        choices,
        usage,
    })
}
