//! Generate request handling
//!
//! Validates the JSON body, runs the requested attempt plan through its
//! orchestrator and maps the outcome to an HTTP response. Failures never
//! expose API keys: error messages come from `key_pool::Error`, which only
//! carries upstream messages and key labels.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use key_pool::RetryOrchestrator;
use tracing::{error, info, instrument, warn};

/// Request counters shared with the health endpoint.
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// Shared state for generate handlers: one orchestrator per named plan.
#[derive(Clone)]
pub struct GatewayState {
    pub plans: Arc<BTreeMap<String, Arc<RetryOrchestrator>>>,
    pub metrics: ServiceMetrics,
}

/// JSON error body: {"error":{"type":"...","message":"...","request_id":"req_..."}}
fn error_response(status: StatusCode, kind: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": kind,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Pull a non-empty string `prompt` out of the request body.
pub fn extract_prompt(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    match value.get("prompt")? {
        serde_json::Value::String(prompt) if !prompt.is_empty() => Some(prompt.clone()),
        _ => None,
    }
}

/// Run `plan` for the prompt in `body`.
#[instrument(skip_all, fields(request_id = %request_id, plan = %plan))]
pub async fn generate(state: &GatewayState, plan: &str, body: &[u8], request_id: String) -> Response {
    let started = Instant::now();
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let (status, plan_label, response) = run(state, plan, body, &request_id).await;

    if !status.is_success() {
        state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
    }
    crate::metrics::record_request(status.as_u16(), plan_label, started.elapsed().as_secs_f64());
    response
}

async fn run<'a>(
    state: &GatewayState,
    plan: &'a str,
    body: &[u8],
    request_id: &str,
) -> (StatusCode, &'a str, Response) {
    let Some(orchestrator) = state.plans.get(plan) else {
        warn!("unknown plan requested");
        let status = StatusCode::NOT_FOUND;
        let message = format!("unknown plan: {plan}");
        return (
            status,
            "unknown",
            error_response(status, "unknown_plan", &message, request_id),
        );
    };

    let Some(prompt) = extract_prompt(body) else {
        let status = StatusCode::BAD_REQUEST;
        return (
            status,
            plan,
            error_response(status, "invalid_request", "No prompt provided", request_id),
        );
    };

    match orchestrator.generate(&prompt).await {
        Ok(generation) => {
            info!(
                attempts = generation.attempts,
                model = %generation.model,
                chars = generation.text.len(),
                "generate request completed"
            );
            let body = serde_json::json!({
                "response": generation.text,
                "model": generation.model,
                "attempts": generation.attempts,
                "request_id": request_id,
            });
            let response = (
                StatusCode::OK,
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                body.to_string(),
            )
                .into_response();
            (StatusCode::OK, plan, response)
        }
        Err(e @ key_pool::Error::NoAttemptsConfigured) => {
            error!(error = %e, "plan has no attempts");
            let status = StatusCode::INTERNAL_SERVER_ERROR;
            (
                status,
                plan,
                error_response(status, "no_attempts_configured", &e.to_string(), request_id),
            )
        }
        Err(e) => {
            let status = StatusCode::BAD_GATEWAY;
            (
                status,
                plan,
                error_response(status, "generation_failed", &e.to_string(), request_id),
            )
        }
    }
}
