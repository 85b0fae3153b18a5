//! Gemini generator: `models/{model}:generateContent` over HTTPS.
//!
//! The API key travels in the `x-goog-api-key` header, never in the URL, so
//! transport errors (which may echo the URL) cannot leak it.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{Credential, GenerationError, GenerationRequest, Generator, Result};

/// Public Generative Language API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const API_KEY_HEADER: &str = "x-goog-api-key";

/// Upper bound on how much of a non-JSON error body ends up in error messages.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Error bodies are read up to this many bytes; the rest is discarded.
const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Default cap on a successful response body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// `Generator` backed by the Gemini REST API.
pub struct GeminiGenerator {
    client: reqwest::Client,
    base_url: String,
    max_body_bytes: usize,
}

impl GeminiGenerator {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Reject successful responses larger than `limit` bytes.
    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    fn endpoint(&self, model: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!(
            "{}/v1beta/models/{model}:generateContent",
            self.base_url.trim_end_matches('/')
        )
    }

    #[instrument(skip_all, fields(credential = %credential, model = request.model))]
    async fn call(&self, credential: &Credential, request: GenerationRequest<'_>) -> Result<String> {
        let mut key = HeaderValue::from_str(credential.expose()).map_err(|_| {
            GenerationError::Transport("credential is not a valid header value".into())
        })?;
        key.set_sensitive(true);

        let mut response = self
            .client
            .post(self.endpoint(request.model))
            .header(API_KEY_HEADER, key)
            .timeout(request.timeout)
            .json(&GenerateContentRequest::new(request.prompt, request.temperature))
            .send()
            .await
            .map_err(|e| transport_error(e, request.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let (body, _) = read_body(&mut response, MAX_ERROR_BODY_BYTES, request.timeout).await?;
            debug!(status = status.as_u16(), bytes = body.len(), "upstream rejected call");
            return Err(GenerationError::Status {
                status: status.as_u16(),
                message: upstream_message(&body),
            });
        }

        let (body, truncated) =
            read_body(&mut response, self.max_body_bytes, request.timeout).await?;
        if truncated {
            return Err(GenerationError::Decode(format!(
                "response body exceeds {} bytes",
                self.max_body_bytes
            )));
        }
        debug!(status = status.as_u16(), bytes = body.len(), "upstream responded");

        let parsed: GenerateContentResponse = serde_json::from_slice(&body)
            .map_err(|e| GenerationError::Decode(e.to_string()))?;
        parsed.into_text()
    }
}

impl Generator for GeminiGenerator {
    fn id(&self) -> &str {
        "gemini"
    }

    fn generate<'a>(
        &'a self,
        credential: &'a Credential,
        request: GenerationRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(self.call(credential, request))
    }
}

/// Read at most `limit` bytes of the body. The flag is set when the body was
/// longer and got cut short.
async fn read_body(
    response: &mut reqwest::Response,
    limit: usize,
    timeout: Duration,
) -> Result<(Vec<u8>, bool)> {
    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| transport_error(e, timeout))?
    {
        let room = limit - body.len();
        if chunk.len() > room {
            body.extend_from_slice(&chunk[..room]);
            return Ok((body, true));
        }
        body.extend_from_slice(&chunk);
    }
    Ok((body, false))
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> GenerationError {
    if e.is_timeout() {
        GenerationError::Timeout(timeout)
    } else {
        GenerationError::Transport(e.without_url().to_string())
    }
}

/// Pull `error.message` out of a Google error body, else a truncated raw body.
fn upstream_message(body: &[u8]) -> String {
    if let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(body) {
        return envelope.error.message;
    }
    let raw = String::from_utf8_lossy(body);
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "empty response body".into();
    }
    trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: [Content<'a>; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

impl<'a> GenerateContentRequest<'a> {
    fn new(prompt: &'a str, temperature: Option<f32>) -> Self {
        Self {
            contents: [Content {
                role: "user",
                parts: [Part { text: prompt }],
            }],
            generation_config: temperature.map(|temperature| GenerationConfig { temperature }),
        }
    }
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl GenerateContentResponse {
    /// Text of the first candidate, or the reason there is none.
    fn into_text(self) -> Result<String> {
        if let Some(reason) = self.prompt_feedback.and_then(|f| f.block_reason) {
            if self.candidates.is_empty() {
                return Err(GenerationError::Blocked { reason });
            }
        }

        let Some(candidate) = self.candidates.into_iter().next() else {
            return Err(GenerationError::EmptyResponse {
                finish_reason: "no candidates".into(),
            });
        };

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.is_empty() {
            return Err(GenerationError::EmptyResponse {
                finish_reason: candidate.finish_reason.unwrap_or_else(|| "unknown".into()),
            });
        }
        Ok(text)
    }
}
