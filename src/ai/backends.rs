use crate::error::AnalysisError;
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Trait for root-cause-analysis backends
///
/// A backend turns a prompt into free text that should contain an `RcaResult`
/// JSON object. It must fail loudly rather than return partial output.
pub trait RcaBackend: Send + Sync {
    fn generate<'a>(
        &'a self,
        prompt: &'a str,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<String, AnalysisError>> + Send + 'a>>;

    /// Short name for log lines
    fn name(&self) -> &str;
}

fn build_client() -> Result<Client, AnalysisError> {
    Client::builder()
        .no_proxy()
        .build()
        .map_err(|e| AnalysisError::BackendError(format!("Failed to create HTTP client: {}", e)))
}

/// Turn a non-2xx response into a backend error carrying the body
async fn check_status(
    response: reqwest::Response,
    backend: &str,
) -> Result<reqwest::Response, AnalysisError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(AnalysisError::BackendError(format!(
        "{} API returned error {}: {}",
        backend, status, body
    )))
}

/// Ollama backend for local inference
pub struct OllamaBackend {
    client: Client,
    endpoint: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    format: &'a str,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaBackend {
    /// Create a backend talking to `endpoint` (e.g. `http://localhost:11434`)
    pub fn new(endpoint: String, model: String) -> Result<Self, AnalysisError> {
        Ok(Self {
            client: build_client()?,
            endpoint,
            model,
        })
    }

    fn api_url(&self) -> String {
        format!("{}/api/generate", self.endpoint.trim_end_matches('/'))
    }
}

impl RcaBackend for OllamaBackend {
    fn generate<'a>(
        &'a self,
        prompt: &'a str,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<String, AnalysisError>> + Send + 'a>> {
        Box::pin(async move {
            let request = OllamaRequest {
                model: &self.model,
                prompt,
                stream: false,
                format: "json",
                options: OllamaOptions { temperature: 0.0 },
            };

            debug!("Sending prompt to Ollama model {}", self.model);
            let response = self
                .client
                .post(self.api_url())
                .timeout(timeout)
                .json(&request)
                .send()
                .await?;
            let response = check_status(response, "Ollama").await?;

            let body: OllamaResponse = response.json().await.map_err(|e| {
                AnalysisError::InvalidResponse(format!("Failed to parse Ollama response: {}", e))
            })?;

            if let Some(error) = body.error {
                return Err(AnalysisError::BackendError(format!("Ollama error: {}", error)));
            }
            if body.response.trim().is_empty() {
                return Err(AnalysisError::InvalidResponse(
                    "Ollama returned an empty response".to_string(),
                ));
            }
            Ok(body.response)
        })
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

/// System message for chat-completion backends
pub const OPENAI_SYSTEM_PROMPT: &str =
    "Respond with **only** valid JSON per schema below; no prose.";

/// OpenAI-compatible chat completions backend
pub struct OpenAIBackend {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAIMessage<'a>>,
    temperature: f32,
    response_format: OpenAIResponseFormat,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct OpenAIResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    error: Option<OpenAIError>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    message: String,
    #[serde(rename = "type", default)]
    error_type: Option<String>,
}

impl OpenAIBackend {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";

    /// Create a backend for the public OpenAI API
    ///
    /// # Arguments
    ///
    /// * `api_key` - OpenAI API key, must not be empty
    /// * `model` - Chat model name, e.g. `gpt-4o-mini`
    ///
    /// # Errors
    ///
    /// `BackendError` when the key is empty or the HTTP client cannot be built
    pub fn new(api_key: String, model: String) -> Result<Self, AnalysisError> {
        Self::with_base_url(api_key, model, Self::DEFAULT_BASE_URL.to_string())
    }

    /// Create a backend for an OpenAI-compatible API at `base_url`
    pub fn with_base_url(
        api_key: String,
        model: String,
        base_url: String,
    ) -> Result<Self, AnalysisError> {
        if api_key.trim().is_empty() {
            return Err(AnalysisError::BackendError(
                "OpenAI API key is not set".to_string(),
            ));
        }
        Ok(Self {
            client: build_client()?,
            api_key,
            model,
            base_url,
        })
    }

    fn api_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

impl RcaBackend for OpenAIBackend {
    fn generate<'a>(
        &'a self,
        prompt: &'a str,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<String, AnalysisError>> + Send + 'a>> {
        Box::pin(async move {
            let request = OpenAIRequest {
                model: &self.model,
                messages: vec![
                    OpenAIMessage {
                        role: "system",
                        content: OPENAI_SYSTEM_PROMPT,
                    },
                    OpenAIMessage {
                        role: "user",
                        content: prompt,
                    },
                ],
                temperature: 0.0,
                response_format: OpenAIResponseFormat {
                    format_type: "json_object",
                },
            };

            debug!("Sending prompt to OpenAI model {}", self.model);
            let response = self
                .client
                .post(self.api_url())
                .timeout(timeout)
                .bearer_auth(&self.api_key)
                .json(&request)
                .send()
                .await?;
            let response = check_status(response, "OpenAI").await?;

            let body: OpenAIResponse = response.json().await.map_err(|e| {
                AnalysisError::InvalidResponse(format!("Failed to parse OpenAI response: {}", e))
            })?;

            if let Some(error) = body.error {
                return Err(AnalysisError::BackendError(format!(
                    "OpenAI API error ({}): {}",
                    error.error_type.as_deref().unwrap_or("unknown"),
                    error.message
                )));
            }

            body.choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .ok_or_else(|| {
                    AnalysisError::InvalidResponse("No content in OpenAI response".to_string())
                })
        })
    }

    fn name(&self) -> &str {
        "openai"
    }
}

/// One recorded call to a [`MockBackend`]
#[derive(Debug, Clone)]
pub struct MockCall {
    pub prompt: String,
    pub at: tokio::time::Instant,
}

/// Mock backend for tests and offline runs
///
/// Replays canned responses in order, cycling back to the first after the
/// last, and records every prompt it receives. Clones share their call log.
#[derive(Debug, Clone)]
pub struct MockBackend {
    responses: Vec<Result<String, AnalysisError>>,
    next: Arc<AtomicUsize>,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::canned()
    }
}

impl MockBackend {
    /// A backend that answers every call with `response`
    pub fn with_response(response: Result<String, AnalysisError>) -> Self {
        Self::with_responses(vec![response])
    }

    /// A backend cycling through `responses` in order
    ///
    /// An empty list makes every call fail.
    pub fn with_responses(responses: Vec<Result<String, AnalysisError>>) -> Self {
        Self {
            responses,
            next: Arc::new(AtomicUsize::new(0)),
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A backend returning a fixed, schema-conforming diagnosis
    pub fn canned() -> Self {
        let response = json!({
            "summary": "mock summary",
            "root_cause": "mock root cause",
            "impact": "mock impact",
            "confidence": 0.42,
            "candidate_actions": [{"action": "mock action", "rationale": "because tests"}],
            "risk": "low",
            "tests": ["test check"],
            "recurrence_pattern": "mock error"
        });
        Self::with_response(Ok(response.to_string()))
    }

    /// A backend whose diagnosis carries the given recurrence pattern
    pub fn with_pattern(pattern: &str) -> Self {
        let response = json!({
            "summary": format!("problem matching {}", pattern),
            "root_cause": "mock root cause",
            "impact": "mock impact",
            "confidence": 0.9,
            "risk": "low",
            "recurrence_pattern": pattern
        });
        Self::with_response(Ok(response.to_string()))
    }

    /// A backend that always fails with `BackendError(message)`
    pub fn error(message: &str) -> Self {
        Self::with_response(Err(AnalysisError::BackendError(message.to_string())))
    }

    /// Delay every response, e.g. to exercise timeouts
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn calls(&self) -> std::sync::MutexGuard<'_, Vec<MockCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of calls made, shared across clones
    pub fn call_count(&self) -> usize {
        self.calls().len()
    }

    /// Prompts received, oldest first
    pub fn prompts(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.prompt.clone()).collect()
    }

    /// When each call started
    pub fn call_instants(&self) -> Vec<tokio::time::Instant> {
        self.calls().iter().map(|c| c.at).collect()
    }

    /// Forget recorded calls and restart the response cycle
    pub fn reset(&self) {
        self.calls().clear();
        self.next.store(0, Ordering::SeqCst);
    }
}

impl RcaBackend for MockBackend {
    fn generate<'a>(
        &'a self,
        prompt: &'a str,
        _timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<String, AnalysisError>> + Send + 'a>> {
        Box::pin(async move {
            self.calls().push(MockCall {
                prompt: prompt.to_string(),
                at: tokio::time::Instant::now(),
            });

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            if self.responses.is_empty() {
                return Err(AnalysisError::BackendError(
                    "mock backend has no responses".to_string(),
                ));
            }
            let index = self.next.fetch_add(1, Ordering::SeqCst) % self.responses.len();
            self.responses[index].clone()
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}
