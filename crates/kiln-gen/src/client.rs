//! Streaming generation client.
//!
//! Opens one streaming chat-completion request, feeds every delta through
//! the [`StreamDecoder`] and the artifact extractor, and yields partial
//! artifacts as soon as the accumulated text parses.

use crate::artifact::GeneratedArtifact;
use crate::decoder::{StreamDecoder, StreamEvent};
use crate::error::{GenerationError, Result};
use crate::extract::{fallback_artifact, try_extract};
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Default chat-completions endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://api.x.ai/v1/chat/completions";

/// Default model.
pub const DEFAULT_MODEL: &str = "grok-code-fast-1";

const DEFAULT_TEMPERATURE: f32 = 0.1;
const DEFAULT_MAX_TOKENS: u32 = 2000;

/// Instruction sent as the system message of every request.
pub const SYSTEM_PROMPT: &str = "You are an expert React and TypeScript developer. \
Respond with exactly one JSON object and nothing else: \
{\"code\": \"...\", \"explanation\": \"...\", \"filename\": \"...\"}. \
\"code\" holds the complete source of one React component file, \
\"filename\" its file name (for example Counter.tsx), and \
\"explanation\" a short description. Do not add prose or markdown around the object.";

/// Configuration for [`GenerationClient`].
#[derive(Clone)]
pub struct GenerationConfig {
    /// Chat-completions endpoint URL.
    pub endpoint: String,
    /// Bearer credential.
    pub api_key: String,
    /// Model identifier.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token limit.
    pub max_tokens: u32,
    /// Hard deadline for one whole request, stream included.
    pub deadline: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            deadline: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl std::fmt::Debug for GenerationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl GenerationConfig {
    /// Create a new config builder.
    pub fn builder() -> GenerationConfigBuilder {
        GenerationConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(GenerationError::Config("api_key is required".into()));
        }
        if self.endpoint.is_empty() {
            return Err(GenerationError::Config("endpoint is required".into()));
        }
        if self.model.is_empty() {
            return Err(GenerationError::Config("model is required".into()));
        }
        if self.deadline.is_zero() {
            return Err(GenerationError::Config("deadline must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for GenerationConfig.
#[derive(Debug, Default)]
pub struct GenerationConfigBuilder {
    config: GenerationConfig,
}

impl GenerationConfigBuilder {
    /// Set the endpoint URL.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    /// Set the bearer credential.
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.config.api_key = api_key.into();
        self
    }

    /// Set the model.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    /// Set the sampling temperature.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.config.temperature = temperature;
        self
    }

    /// Set the completion token limit.
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.config.max_tokens = max_tokens;
        self
    }

    /// Set the hard request deadline.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.config.deadline = deadline;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<GenerationConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// One generation request.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    /// What to build.
    pub prompt: String,
    /// Extra context, e.g. the current contents of a file.
    pub context: Option<String>,
}

impl GenerationRequest {
    /// Create a request with no context.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            context: None,
        }
    }

    /// Attach context text.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    fn user_message(&self) -> String {
        format!(
            "Prompt: {}\nContext: {}",
            self.prompt,
            self.context.as_deref().unwrap_or("")
        )
    }
}

/// Progress of a generation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    /// The accumulated text parsed into a (possibly still growing) artifact.
    Partial(GeneratedArtifact),
    /// The stream ended; always the last event of a successful request.
    Complete(Completion),
}

/// The final outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// The artifact, or a diagnostic artifact if parsing failed.
    pub artifact: GeneratedArtifact,
    /// True if `artifact` is the diagnostic fallback.
    pub parse_failed: bool,
}

/// Per-request parse state.
#[derive(Debug, Default)]
pub struct StreamingParseState {
    accumulated: String,
    latest: Option<GeneratedArtifact>,
    finished: bool,
}

impl StreamingParseState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta and re-run extraction over the full text.
    ///
    /// Returns the artifact if it parsed and differs from the last one.
    pub fn push_delta(&mut self, delta: &str) -> Option<GeneratedArtifact> {
        self.accumulated.push_str(delta);
        let artifact = try_extract(&self.accumulated).ok()?;
        if self.latest.as_ref() == Some(&artifact) {
            return None;
        }
        self.latest = Some(artifact.clone());
        Some(artifact)
    }

    /// Mark the stream as terminated by its sentinel.
    pub fn mark_finished(&mut self) {
        self.finished = true;
    }

    /// True once the sentinel has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Raw text received so far.
    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    /// Run the final extraction.
    ///
    /// Falls back to the last partial artifact, then to a diagnostic one.
    pub fn complete(self) -> Completion {
        match try_extract(&self.accumulated) {
            Ok(artifact) => Completion {
                artifact,
                parse_failed: false,
            },
            Err(err) => match self.latest {
                Some(artifact) => {
                    tracing::debug!(error = %err, "Final parse failed, keeping last partial artifact");
                    Completion {
                        artifact,
                        parse_failed: false,
                    }
                }
                None => {
                    tracing::warn!(
                        error = %err,
                        len = self.accumulated.len(),
                        "Model output could not be parsed, using diagnostic artifact"
                    );
                    Completion {
                        artifact: fallback_artifact(&self.accumulated, &err),
                        parse_failed: true,
                    }
                }
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

/// What woke a suspended read.
enum Wake<T> {
    Value(T),
    Cancelled,
    Deadline,
}

/// Client for the model backend.
#[derive(Debug, Clone)]
pub struct GenerationClient {
    http: reqwest::Client,
    config: GenerationConfig,
}

impl GenerationClient {
    /// Create a client, validating the configuration.
    pub fn new(config: GenerationConfig) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        tracing::info!(endpoint = %config.endpoint, model = %config.model, "Creating generation client");
        Ok(Self { http, config })
    }

    /// Get the client configuration.
    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Start a streaming generation.
    ///
    /// Yields zero or more [`GenerationEvent::Partial`] followed by exactly
    /// one [`GenerationEvent::Complete`], or ends with an error. Dropping the
    /// stream, cancelling `cancel`, or reaching the deadline aborts the
    /// underlying HTTP transfer.
    pub fn generate(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<GenerationEvent>> + Send + 'static {
        let http = self.http.clone();
        let endpoint = self.config.endpoint.clone();
        let api_key = self.config.api_key.clone();
        let budget = self.config.deadline;
        let body = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: request.user_message(),
                },
            ],
            stream: true,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        async_stream::stream! {
            let deadline = Instant::now() + budget;
            let start = std::time::Instant::now();
            tracing::info!(model = %body.model, prompt_len = request.prompt.len(), "Starting generation");

            let send = http.post(&endpoint).bearer_auth(&api_key).json(&body).send();
            let wake = tokio::select! {
                biased;
                _ = cancel.cancelled() => Wake::Cancelled,
                _ = sleep_until(deadline) => Wake::Deadline,
                result = send => Wake::Value(result),
            };
            let response = match wake {
                Wake::Value(Ok(response)) => response,
                Wake::Value(Err(e)) => {
                    tracing::warn!(error = %e, "Generation request failed");
                    yield Err(GenerationError::Transport(e));
                    return;
                }
                Wake::Cancelled => {
                    yield Err(GenerationError::Cancelled);
                    return;
                }
                Wake::Deadline => {
                    tracing::warn!(timeout_secs = budget.as_secs(), "Generation timed out before response");
                    yield Err(GenerationError::Timeout(budget));
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = tokio::select! {
                    _ = sleep_until(deadline) => String::new(),
                    text = response.text() => text.unwrap_or_else(|_| "Unknown error".to_string()),
                };
                tracing::error!(status = status.as_u16(), body = %body, "Generation backend error");
                yield Err(GenerationError::Api { status: status.as_u16(), body });
                return;
            }

            let mut bytes = Box::pin(response.bytes_stream());
            let mut decoder = StreamDecoder::new();
            let mut state = StreamingParseState::new();

            loop {
                let wake = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Wake::Cancelled,
                    _ = sleep_until(deadline) => Wake::Deadline,
                    next = bytes.next() => Wake::Value(next),
                };
                let chunk = match wake {
                    Wake::Value(Some(Ok(chunk))) => chunk,
                    Wake::Value(Some(Err(e))) => {
                        tracing::warn!(error = %e, "Generation stream failed");
                        yield Err(GenerationError::Transport(e));
                        return;
                    }
                    Wake::Value(None) => break,
                    Wake::Cancelled => {
                        tracing::debug!("Generation cancelled by caller");
                        yield Err(GenerationError::Cancelled);
                        return;
                    }
                    Wake::Deadline => {
                        tracing::warn!(
                            timeout_secs = budget.as_secs(),
                            received = state.accumulated().len(),
                            "Generation timed out mid-stream"
                        );
                        yield Err(GenerationError::Timeout(budget));
                        return;
                    }
                };

                let events = match decoder.push(&chunk) {
                    Ok(events) => events,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                for event in events {
                    match event {
                        StreamEvent::Delta(text) => {
                            if let Some(artifact) = state.push_delta(&text) {
                                yield Ok(GenerationEvent::Partial(artifact));
                            }
                        }
                        StreamEvent::Done => state.mark_finished(),
                    }
                }
                if state.is_finished() {
                    break;
                }
            }

            if !state.is_finished() {
                let events = match decoder.finish() {
                    Ok(events) => events,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                for event in events {
                    if let StreamEvent::Delta(text) = event {
                        if let Some(artifact) = state.push_delta(&text) {
                            yield Ok(GenerationEvent::Partial(artifact));
                        }
                    }
                }
            }

            let completion = state.complete();
            tracing::info!(
                elapsed_ms = start.elapsed().as_millis() as u64,
                parse_failed = completion.parse_failed,
                code_len = completion.artifact.code.len(),
                "Generation complete"
            );
            yield Ok(GenerationEvent::Complete(completion));
        }
    }

    /// Run a generation to completion and return only the final outcome.
    pub async fn generate_artifact(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<Completion> {
        let stream = self.generate(request, cancel);
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            if let GenerationEvent::Complete(completion) = event? {
                return Ok(completion);
            }
        }
        Err(GenerationError::Stream(
            "stream ended without a completion".into(),
        ))
    }
}
