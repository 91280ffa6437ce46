use anyhow::Result;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{BoxStream, StreamExt};
use serde_json::json;

use crate::types::*;
use crate::{Provider, ProviderError};

const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Generic chat-completions client for any OpenAI-compatible backend,
/// including a local ollama server. This is the one concrete transport the
/// core ships; everything above it sees only the `Provider` trait.
pub struct OpenAICompatProvider {
    client: reqwest::Client,
    backend_id: String,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAICompatProvider {
    pub fn new(backend_id: String, base_url: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            backend_id,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn post(&self, request: &ChatRequest) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(url);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        if let Some(timeout) = request.timeout {
            req = req.timeout(timeout);
        }
        req
    }

    fn build_body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        let mut body = json!({
            "model": request.model,
            "messages": build_messages(request),
        });
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        if request.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        body
    }
}

fn build_messages(request: &ChatRequest) -> Vec<serde_json::Value> {
    let mut msgs = Vec::new();

    if let Some(system) = &request.system {
        msgs.push(json!({"role": "system", "content": system}));
    }

    for msg in &request.messages {
        match &msg.content {
            MessageContent::Text(text) => {
                msgs.push(json!({"role": role_str(msg.role), "content": text}));
            }
            MessageContent::Parts(parts) => {
                // Tool-use parts collapse into one assistant message with
                // `tool_calls`; tool results become individual `tool` messages.
                let mut tool_calls = Vec::new();
                let mut text = String::new();
                for part in parts {
                    match part {
                        ContentPart::Text { text: t } => text.push_str(t),
                        ContentPart::ToolUse { id, name, input } => tool_calls.push(json!({
                            "id": id,
                            "type": "function",
                            "function": {"name": name, "arguments": input.to_string()},
                        })),
                        ContentPart::ToolResult {
                            tool_use_id,
                            content,
                        } => msgs.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": content,
                        })),
                    }
                }
                if !tool_calls.is_empty() {
                    msgs.push(json!({
                        "role": "assistant",
                        "content": text,
                        "tool_calls": tool_calls,
                    }));
                } else if !text.is_empty() {
                    msgs.push(json!({"role": role_str(msg.role), "content": text}));
                }
            }
        }
    }

    msgs
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn parse_usage(usage: &serde_json::Value) -> Usage {
    Usage {
        input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
    }
}

async fn error_from_response(resp: reqwest::Response) -> ProviderError {
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let body = resp.text().await.unwrap_or_default();
    ProviderError::from_http(status, body, retry_after.as_deref())
}

#[async_trait]
impl Provider for OpenAICompatProvider {
    fn name(&self) -> &str {
        &self.backend_id
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let body = self.build_body(request, false);
        let resp = self
            .post(request)
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from)?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await.into());
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Deserialization(e.to_string()))?;

        let choice = &data["choices"][0];
        let content = choice["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();

        let mut tool_calls = Vec::new();
        if let Some(calls) = choice["message"]["tool_calls"].as_array() {
            for tc in calls {
                let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
                let raw_args = tc["function"]["arguments"].as_str().unwrap_or("{}");
                let arguments: serde_json::Value =
                    serde_json::from_str(raw_args).unwrap_or(serde_json::Value::Null);
                tool_calls.push(ToolCall {
                    id: tc["id"].as_str().unwrap_or("").to_string(),
                    name,
                    arguments,
                });
            }
        }

        Ok(ChatResponse {
            message: Message {
                role: Role::Assistant,
                content: MessageContent::Text(content),
            },
            tool_calls,
            usage: data.get("usage").map(parse_usage),
            finish_reason: choice["finish_reason"].as_str().map(String::from),
        })
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let body = self.build_body(request, true);
        let resp = self
            .post(request)
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::from)?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await.into());
        }

        let events = resp.bytes_stream().eventsource().filter_map(|result| {
            futures::future::ready(match result {
                Ok(event) => {
                    if event.data == "[DONE]" {
                        Some(Ok(StreamEvent::Done))
                    } else {
                        Some(parse_stream_chunk(&event.data))
                    }
                }
                Err(e) => Some(Err(ProviderError::Stream(e.to_string()).into())),
            })
        });

        Ok(Box::pin(events))
    }
}

fn parse_stream_chunk(data: &str) -> Result<StreamEvent> {
    let chunk: serde_json::Value =
        serde_json::from_str(data).map_err(|e| ProviderError::Deserialization(e.to_string()))?;

    if let Some(usage) = chunk.get("usage").filter(|u| u.is_object()) {
        return Ok(StreamEvent::Usage(parse_usage(usage)));
    }

    let delta = &chunk["choices"][0]["delta"];

    if let Some(tool_calls) = delta["tool_calls"].as_array() {
        for tc in tool_calls {
            let index = tc["index"].as_u64().unwrap_or(0) as u32;
            if let Some(name) = tc["function"]["name"].as_str() {
                return Ok(StreamEvent::ToolCallStart {
                    index,
                    id: tc["id"].as_str().unwrap_or("").to_string(),
                    name: name.to_string(),
                });
            }
            if let Some(args) = tc["function"]["arguments"].as_str() {
                return Ok(StreamEvent::ToolCallDelta {
                    index,
                    arguments_delta: args.to_string(),
                });
            }
        }
    }

    if chunk["choices"][0]["finish_reason"].is_string() {
        return Ok(StreamEvent::Done);
    }

    if let Some(content) = delta["content"].as_str() {
        return Ok(StreamEvent::TextDelta(content.to_string()));
    }

    Ok(StreamEvent::TextDelta(String::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_parts_collapse_into_tool_calls_message() {
        let request = ChatRequest {
            messages: vec![Message {
                role: Role::Assistant,
                content: MessageContent::Parts(vec![ContentPart::ToolUse {
                    id: "c1".into(),
                    name: "read_file".into(),
                    input: json!({"path": "a.txt"}),
                }]),
            }],
            ..Default::default()
        };
        let msgs = build_messages(&request);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0]["role"], "assistant");
        assert_eq!(msgs[0]["tool_calls"][0]["function"]["name"], "read_file");
    }

    #[test]
    fn tool_results_become_tool_messages() {
        let request = ChatRequest {
            messages: vec![Message {
                role: Role::User,
                content: MessageContent::Parts(vec![ContentPart::ToolResult {
                    tool_use_id: "c1".into(),
                    content: "ok".into(),
                }]),
            }],
            ..Default::default()
        };
        let msgs = build_messages(&request);
        assert_eq!(msgs[0]["role"], "tool");
        assert_eq!(msgs[0]["tool_call_id"], "c1");
    }

    #[test]
    fn stream_chunk_parses_tool_call_start() {
        let data = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c9","function":{"name":"run_shell"}}]}}]}"#;
        match parse_stream_chunk(data).unwrap() {
            StreamEvent::ToolCallStart { index, id, name } => {
                assert_eq!(index, 0);
                assert_eq!(id, "c9");
                assert_eq!(name, "run_shell");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
