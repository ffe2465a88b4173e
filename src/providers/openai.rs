use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{
    error::LLMError,
    functions::{Tool, ToolChoice},
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, CompletionResponse, TokenUsage},
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub base_url: String,
    /// Transport-level ceiling; the runner applies its own per-call timeout.
    pub request_timeout: Duration,
}

impl OpenAIConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// Chat-completions adapter for OpenAI and compatible servers (vLLM,
/// llama.cpp, Ollama's OpenAI endpoint).
#[derive(Debug, Clone)]
pub struct OpenAI {
    client: Client,
    config: OpenAIConfig,
}

impl OpenAI {
    pub fn from_config(config: OpenAIConfig) -> Result<Self, LLMError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Serialize)]
struct RequestBody {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>,
}

impl From<CompletionRequest> for RequestBody {
    fn from(request: CompletionRequest) -> Self {
        // Servers reject tool_choice without tools.
        let tool_choice = if request.tools.is_empty() { None } else { request.tool_choice };
        Self {
            model: request.model,
            messages: request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            seed: request.seed,
            tools: request.tools,
            tool_choice,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponseBody {
    choices: Vec<ResponseChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Maps a raw HTTP reply onto the adapter contract. Non-2xx statuses are
/// classified by [`LLMError::from_status`]; an unparseable body, including
/// tool-call arguments that are not JSON, is a malformed response.
fn parse_reply(status: u16, body: &str) -> Result<CompletionResponse, LLMError> {
    if !(200..300).contains(&status) {
        let message = serde_json::from_str::<ErrorEnvelope>(body)
            .map(|envelope| envelope.error.message)
            .unwrap_or_else(|_| body.to_string());
        return Err(LLMError::from_status(status, message));
    }

    let parsed: ResponseBody =
        serde_json::from_str(body).map_err(|err| LLMError::MalformedResponse(err.to_string()))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or(LLMError::InvalidResponse("response did not contain any choices"))?;

    Ok(CompletionResponse {
        message: choice.message,
        usage: parsed.usage,
    })
}

#[async_trait]
impl LLMProvider for OpenAI {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.config.api_key)
            .json(&RequestBody::from(request))
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        parse_reply(status, &body)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::FailureClass, MessageRole};
    use serde_json::json;

    #[test]
    fn tool_calls_and_usage_are_decoded() {
        let body = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "calculator", "arguments": "{\"expression\":\"1+1\"}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17}
        });
        let reply = parse_reply(200, &body.to_string()).expect("reply");
        assert_eq!(reply.message.role, MessageRole::Assistant);
        assert_eq!(reply.message.tool_calls[0].function.arguments, json!({"expression": "1+1"}));
        assert_eq!(reply.usage.map(|u| u.total_tokens), Some(17));
    }

    #[test]
    fn non_json_arguments_are_malformed() {
        let body = r#"{"choices":[{"message":{"role":"assistant","tool_calls":[
            {"id":"c","type":"function","function":{"name":"search","arguments":"{oops"}}]}}]}"#;
        let err = parse_reply(200, body).expect_err("malformed");
        assert_eq!(err.class(), FailureClass::Malformed);
    }

    #[test]
    fn error_statuses_are_classified() {
        let rate_limited = parse_reply(429, r#"{"error":{"message":"slow down"}}"#).expect_err("429");
        assert!(rate_limited.is_transient());
        assert!(rate_limited.to_string().contains("slow down"));

        let unauthorized = parse_reply(401, "nope").expect_err("401");
        assert_eq!(unauthorized.class(), FailureClass::Fatal);

        let empty = parse_reply(200, r#"{"choices":[]}"#).expect_err("empty");
        assert_eq!(empty.class(), FailureClass::Malformed);
    }

    #[test]
    fn tool_choice_is_dropped_without_tools() {
        let request = CompletionRequest::new("m", vec![ChatMessage::user("hi")]).with_tool_choice(ToolChoice::Auto);
        let body = serde_json::to_value(RequestBody::from(request)).expect("encode");
        assert!(body.get("tool_choice").is_none());
        assert!(body.get("tools").is_none());
    }
}
