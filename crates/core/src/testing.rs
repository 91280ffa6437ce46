//! Scripted provider for exercising the loop, validator, and executor
//! without a network.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use maestro_provider::{
    ChatRequest, ChatResponse, Message, Provider, ProviderError, StreamEvent, ToolCall, Usage,
};

/// One scripted assistant turn.
pub enum Reply {
    Text(String),
    ToolCalls(Vec<(String, serde_json::Value)>),
    RateLimited,
    ToolsUnsupported,
    Timeout,
    AuthFailed,
    ContextOverflow,
}

pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Reply>>,
    pub calls: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.calls.lock().unwrap().push(request.clone());
        let reply = self.replies.lock().unwrap().pop_front();
        let usage = Some(Usage {
            input_tokens: 100,
            output_tokens: 20,
        });

        match reply {
            None => Ok(ChatResponse {
                message: Message::assistant("(script exhausted)"),
                tool_calls: vec![],
                usage,
                finish_reason: Some("stop".into()),
            }),
            Some(Reply::Text(text)) => Ok(ChatResponse {
                message: Message::assistant(text),
                tool_calls: vec![],
                usage,
                finish_reason: Some("stop".into()),
            }),
            Some(Reply::ToolCalls(calls)) => Ok(ChatResponse {
                message: Message::assistant(""),
                tool_calls: calls
                    .into_iter()
                    .enumerate()
                    .map(|(i, (name, arguments))| ToolCall {
                        id: format!("call_{i}"),
                        name,
                        arguments,
                    })
                    .collect(),
                usage,
                finish_reason: Some("tool_calls".into()),
            }),
            Some(Reply::RateLimited) => {
                Err(ProviderError::RateLimited { retry_after_ms: 10 }.into())
            }
            Some(Reply::ToolsUnsupported) => {
                Err(ProviderError::ToolsUnsupported("no tools".into()).into())
            }
            Some(Reply::Timeout) => Err(ProviderError::Timeout("deadline".into()).into()),
            Some(Reply::AuthFailed) => Err(ProviderError::AuthFailed("bad key".into()).into()),
            Some(Reply::ContextOverflow) => {
                Err(ProviderError::ContextOverflow("too long".into()).into())
            }
        }
    }

    async fn chat_stream(
        &self,
        _request: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        anyhow::bail!("scripted provider is not streaming")
    }
}
