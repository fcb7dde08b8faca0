//! OpenAI-compatible chat completions backend.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::llm::{CompletionRequest, LlmClient, LlmError};

/// Error bodies are clipped before they reach logs or error messages.
const MAX_ERROR_BODY: usize = 500;

pub struct OpenAiClient {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl OpenAiClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Http(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            client,
            timeout,
        })
    }

    fn build_body(&self, request: &CompletionRequest) -> Value {
        let user_content = if request.images.is_empty() {
            Value::String(request.prompt.clone())
        } else {
            let mut parts = vec![json!({ "type": "text", "text": request.prompt })];
            parts.extend(request.images.iter().map(|image| {
                json!({ "type": "image_url", "image_url": { "url": image.data_url() } })
            }));
            Value::Array(parts)
        };

        let mut body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": user_content },
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if request.json_output {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn supports_images(&self) -> bool {
        true
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.build_body(request))
            .send()
            .await
            .map_err(|e| map_transport_error(e, &self.base_url, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body: clip(&body),
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ResponseParsing(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }
}

pub(crate) fn map_transport_error(
    e: reqwest::Error,
    base_url: &str,
    timeout: Duration,
) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout(timeout)
    } else if e.is_connect() {
        LlmError::Connection(base_url.to_string())
    } else {
        LlmError::Http(e.to_string())
    }
}

pub(crate) fn clip(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}…", &body[..idx]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::documents::ImageAttachment;
    use crate::test_support::serve;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured {
        body: Arc<Mutex<Option<Value>>>,
        auth: Arc<Mutex<Option<String>>>,
    }

    async fn completions_server(reply: Value, status: StatusCode) -> (String, Captured) {
        let captured = Captured::default();
        let router = Router::new()
            .route(
                "/v1/chat/completions",
                post(
                    move |State(captured): State<Captured>,
                          headers: HeaderMap,
                          Json(body): Json<Value>| {
                        let reply = reply.clone();
                        async move {
                            *captured.body.lock().unwrap() = Some(body);
                            *captured.auth.lock().unwrap() = headers
                                .get("authorization")
                                .and_then(|v| v.to_str().ok())
                                .map(str::to_string);
                            (status, Json(reply))
                        }
                    },
                ),
            )
            .with_state(captured.clone());
        (format!("{}/v1", serve(router).await), captured)
    }

    fn reply(content: &str) -> Value {
        json!({ "choices": [ { "message": { "role": "assistant", "content": content } } ] })
    }

    #[tokio::test]
    async fn sends_system_user_and_json_mode() {
        let (base, captured) = completions_server(reply("{\"ok\":true}"), StatusCode::OK).await;
        let client = OpenAiClient::new(&base, "sk-test", "gpt-4o", Duration::from_secs(5)).unwrap();

        let out = client
            .complete(&CompletionRequest::new("be terse", "summarize").json())
            .await
            .unwrap();
        assert_eq!(out, "{\"ok\":true}");

        let body = captured.body.lock().unwrap().clone().unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be terse");
        assert_eq!(body["messages"][1]["content"], "summarize");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(captured.auth.lock().unwrap().as_deref(), Some("Bearer sk-test"));
    }

    #[tokio::test]
    async fn images_become_image_url_parts() {
        let (base, captured) = completions_server(reply("facts"), StatusCode::OK).await;
        let client = OpenAiClient::new(&base, "k", "gpt-4o", Duration::from_secs(5)).unwrap();
        let image = ImageAttachment::from_bytes(b"\x89PNG", "image/png");

        client
            .complete(&CompletionRequest::new("s", "look").with_images(vec![image]))
            .await
            .unwrap();

        let body = captured.body.lock().unwrap().clone().unwrap();
        let parts = body["messages"][1]["content"].as_array().unwrap();
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert!(parts[1]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
        assert!(body.get("response_format").is_none());
    }

    #[tokio::test]
    async fn server_error_is_retryable_api_error() {
        let (base, _) = completions_server(
            json!({"error": "overloaded"}),
            StatusCode::SERVICE_UNAVAILABLE,
        )
        .await;
        let client = OpenAiClient::new(&base, "k", "gpt-4o", Duration::from_secs(5)).unwrap();

        let err = client.complete(&CompletionRequest::new("s", "p")).await.unwrap_err();
        assert!(matches!(err, LlmError::Api { status: 503, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn blank_content_is_empty_response() {
        let (base, _) = completions_server(reply("   "), StatusCode::OK).await;
        let client = OpenAiClient::new(&base, "k", "gpt-4o", Duration::from_secs(5)).unwrap();
        let err = client.complete(&CompletionRequest::new("s", "p")).await.unwrap_err();
        assert!(matches!(err, LlmError::EmptyResponse));
    }

    #[test]
    fn clip_limits_error_bodies() {
        let long = "x".repeat(2_000);
        assert_eq!(clip(&long).chars().count(), MAX_ERROR_BODY + 1);
        assert_eq!(clip("short"), "short");
    }
}
