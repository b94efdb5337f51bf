//! Model client over HTTP for the Anthropic messages API and OpenAI-style
//! chat completions.
//!
//! Body construction and response parsing are plain functions over JSON so
//! the wire formats can be tested without a server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{Message, ModelClient, ModelRequest, ModelResponse, Provider, ToolCall, Usage};
use crate::error::{Error, Result};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct HttpModelClient {
    provider: Provider,
    api_key: SecretString,
    base_url: String,
    default_model: String,
    client: Client,
}

impl HttpModelClient {
    pub fn new(
        provider: Provider,
        api_key: SecretString,
        default_model: impl Into<String>,
        base_url: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url
            .unwrap_or_else(|| match provider {
                Provider::Anthropic => ANTHROPIC_BASE_URL.to_string(),
                Provider::OpenAi => OPENAI_BASE_URL.to_string(),
            })
            .trim_end_matches('/')
            .to_string();
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            provider,
            api_key,
            base_url,
            default_model: default_model.into(),
            client,
        })
    }

    fn endpoint(&self) -> String {
        match self.provider {
            Provider::Anthropic => format!("{}/messages", self.base_url),
            Provider::OpenAi => format!("{}/chat/completions", self.base_url),
        }
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn send(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let body = match self.provider {
            Provider::Anthropic => anthropic_body(request),
            Provider::OpenAi => openai_body(request),
        };

        let mut http = self.client.post(self.endpoint()).json(&body);
        http = match self.provider {
            Provider::Anthropic => http
                .header("x-api-key", self.api_key.expose_secret())
                .header("anthropic-version", ANTHROPIC_VERSION),
            Provider::OpenAi => http.bearer_auth(self.api_key.expose_secret()),
        };

        let res = http
            .send()
            .await
            .map_err(|e| Error::ModelUnavailable(format!("{} transport: {e}", self.provider)))?;
        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| Error::ModelUnavailable(format!("{} body: {e}", self.provider)))?;

        if !status.is_success() {
            warn!(provider = %self.provider, %status, "model request failed");
            return Err(classify_status(self.provider, status, &text));
        }

        let value: Value = serde_json::from_str(&text)?;
        let response = match self.provider {
            Provider::Anthropic => parse_anthropic(&value)?,
            Provider::OpenAi => parse_openai(&value)?,
        };
        debug!(
            provider = %self.provider,
            tool_calls = response.tool_calls.len(),
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "model responded"
        );
        Ok(response)
    }
}

/// Throttling and server-side errors are transient; anything else is a
/// request the provider will keep rejecting.
fn classify_status(provider: Provider, status: StatusCode, body: &str) -> Error {
    let snippet: String = body.chars().take(500).collect();
    let message = format!("{provider} returned {status}: {snippet}");
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Error::ModelUnavailable(message)
    } else {
        Error::Other(message)
    }
}

// ── Anthropic ──

pub fn anthropic_body(request: &ModelRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|message| match message {
            Message::User { text } => json!({"role": "user", "content": text}),
            Message::Assistant { text, tool_calls } => {
                let mut blocks = Vec::new();
                if let Some(text) = text.as_deref().filter(|t| !t.is_empty()) {
                    blocks.push(json!({"type": "text", "text": text}));
                }
                for call in tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                json!({"role": "assistant", "content": blocks})
            }
            Message::ToolResults { results } => {
                let blocks: Vec<Value> = results
                    .iter()
                    .map(|r| {
                        json!({
                            "type": "tool_result",
                            "tool_use_id": r.call_id,
                            "content": r.content,
                            "is_error": r.is_error,
                        })
                    })
                    .collect();
                json!({"role": "user", "content": blocks})
            }
        })
        .collect();

    let mut body = json!({
        "model": request.model,
        "max_tokens": request.max_tokens,
        "system": request.system,
        "messages": messages,
    });
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(request.tools.clone());
    }
    body
}

pub fn parse_anthropic(value: &Value) -> Result<ModelResponse> {
    let blocks = value["content"]
        .as_array()
        .ok_or_else(|| Error::Other("anthropic response has no content array".to_string()))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block["type"].as_str() {
            Some("text") => text.push_str(block["text"].as_str().unwrap_or_default()),
            Some("tool_use") => tool_calls.push(ToolCall {
                id: block["id"].as_str().unwrap_or_default().to_string(),
                name: block["name"].as_str().unwrap_or_default().to_string(),
                arguments: block["input"].clone(),
            }),
            _ => {}
        }
    }

    Ok(ModelResponse {
        text: (!text.is_empty()).then_some(text),
        tool_calls,
        usage: Usage {
            input_tokens: value["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: value["usage"]["output_tokens"].as_u64().unwrap_or(0),
        },
    })
}

// ── OpenAI ──

pub fn openai_body(request: &ModelRequest) -> Value {
    let mut messages = vec![json!({"role": "system", "content": request.system})];
    for message in &request.messages {
        match message {
            Message::User { text } => messages.push(json!({"role": "user", "content": text})),
            Message::Assistant { text, tool_calls } => {
                let mut entry = json!({"role": "assistant", "content": text});
                if !tool_calls.is_empty() {
                    let calls: Vec<Value> = tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": call.arguments.to_string(),
                                },
                            })
                        })
                        .collect();
                    entry["tool_calls"] = Value::Array(calls);
                }
                messages.push(entry);
            }
            Message::ToolResults { results } => {
                for r in results {
                    messages.push(json!({
                        "role": "tool",
                        "tool_call_id": r.call_id,
                        "content": r.content,
                    }));
                }
            }
        }
    }

    let mut body = json!({
        "model": request.model,
        "max_tokens": request.max_tokens,
        "messages": messages,
    });
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(request.tools.clone());
    }
    body
}

pub fn parse_openai(value: &Value) -> Result<ModelResponse> {
    let message = value["choices"]
        .get(0)
        .map(|choice| &choice["message"])
        .ok_or_else(|| Error::Other("openai response has no choices".to_string()))?;

    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .map(|call| {
                    let raw = call["function"]["arguments"].as_str().unwrap_or("{}");
                    // Malformed argument JSON is passed through as a string so
                    // the tool layer can report it back to the model.
                    let arguments = serde_json::from_str(raw)
                        .unwrap_or_else(|_| Value::String(raw.to_string()));
                    ToolCall {
                        id: call["id"].as_str().unwrap_or_default().to_string(),
                        name: call["function"]["name"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                        arguments,
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ModelResponse {
        text: message["content"]
            .as_str()
            .filter(|t| !t.is_empty())
            .map(str::to_string),
        tool_calls,
        usage: Usage {
            input_tokens: value["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: value["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(classify_status(Provider::OpenAi, StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
        assert!(classify_status(Provider::OpenAi, StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(!classify_status(Provider::Anthropic, StatusCode::BAD_REQUEST, "").is_retryable());
    }

    #[test]
    fn openai_bad_arguments_pass_through_as_string() {
        let value = json!({
            "choices": [{"message": {"content": null, "tool_calls": [
                {"id": "c1", "type": "function", "function": {"name": "read_files", "arguments": "{not json"}}
            ]}}]
        });
        let parsed = parse_openai(&value).unwrap();
        assert_eq!(parsed.tool_calls[0].arguments, json!("{not json"));
        assert!(parsed.text.is_none());
    }
}
