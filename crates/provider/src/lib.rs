//! Text-generation provider abstraction
//!
//! Defines the `Generator` trait that decouples the retry logic from the
//! upstream API. `GeminiGenerator` talks to Google's Generative Language API;
//! tests substitute scripted generators behind the same trait.
//!
//! Every upstream failure surfaces as a `GenerationError`. Callers treat all
//! variants alike (retry with the next attempt), the variants exist for logs
//! and error messages only.

mod credential;
pub mod gemini;

pub use credential::Credential;
pub use gemini::GeminiGenerator;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Parameters for a single upstream generation call.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub prompt: &'a str,
    pub model: &'a str,
    /// Sampling temperature. `None` leaves the upstream default in place.
    pub temperature: Option<f32>,
    pub timeout: Duration,
}

/// Failure of one upstream call. Messages never contain the credential.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
    #[error("upstream timeout after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("upstream returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("prompt blocked by upstream: {reason}")]
    Blocked { reason: String },

    #[error("upstream returned no text (finish reason: {finish_reason})")]
    EmptyResponse { finish_reason: String },

    #[error("invalid upstream response: {0}")]
    Decode(String),
}

/// Result alias for generation calls.
pub type Result<T> = std::result::Result<T, GenerationError>;

/// Abstraction over the upstream text-generation call.
///
/// Uses `Pin<Box<dyn Future>>` return types so the orchestrator can hold an
/// `Arc<dyn Generator>`.
pub trait Generator: Send + Sync {
    /// Identifier for logging (e.g. "gemini").
    fn id(&self) -> &str;

    /// Generate text for `request.prompt` using `credential`.
    ///
    /// Implementations should honour `request.timeout`; the orchestrator
    /// enforces it as well.
    fn generate<'a>(
        &'a self,
        credential: &'a Credential,
        request: GenerationRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}
