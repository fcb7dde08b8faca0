use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::pipeline::documents::ImageAttachment;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Cannot connect to LLM backend at {0}")]
    Connection(String),

    #[error("LLM request timed out after {0:?}")]
    Timeout(Duration),

    #[error("LLM backend returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("Unexpected LLM response shape: {0}")]
    ResponseParsing(String),

    #[error("LLM returned an empty completion")]
    EmptyResponse,
}

impl LlmError {
    /// Transient failures worth a second attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout(_) | Self::Http(_) | Self::EmptyResponse => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::ResponseParsing(_) => false,
        }
    }
}

/// One completion call: instruction, context and optional images.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub images: Vec<ImageAttachment>,
    /// Ask the backend to constrain output to a JSON object.
    pub json_output: bool,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            images: Vec::new(),
            json_output: false,
            temperature: 0.2,
            max_tokens: 4096,
        }
    }

    pub fn with_images(mut self, images: Vec<ImageAttachment>) -> Self {
        self.images = images;
        self
    }

    pub fn json(mut self) -> Self {
        self.json_output = true;
        self
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn model(&self) -> &str;

    /// Whether image attachments are forwarded to the model.
    fn supports_images(&self) -> bool;

    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;
}

/// Scripted LLM for tests: replays queued results in order, then repeats
/// the fallback, recording every request it receives.
pub struct MockLlmClient {
    queued: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Option<String>,
    requests: Mutex<Vec<CompletionRequest>>,
    vision: bool,
}

impl MockLlmClient {
    pub fn new(responses: Vec<Result<String, LlmError>>) -> Self {
        Self {
            queued: Mutex::new(responses.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
            vision: true,
        }
    }

    /// Always answers with `response`.
    pub fn always(response: &str) -> Self {
        Self::new(Vec::new()).with_fallback(response)
    }

    pub fn with_fallback(mut self, response: &str) -> Self {
        self.fallback = Some(response.to_string());
        self
    }

    pub fn without_vision(mut self) -> Self {
        self.vision = false;
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn model(&self) -> &str {
        "mock"
    }

    fn supports_images(&self) -> bool {
        self.vision
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self.queued.lock().ok().and_then(|mut q| q.pop_front());
        match next {
            Some(result) => result,
            None => self.fallback.clone().ok_or(LlmError::EmptyResponse),
        }
    }
}
