//! HTTP plumbing shared by the provider adapters.
//!
//! Every adapter reports failures as a classified [`LlmError`]; the
//! mapping from HTTP status (and a few well-known error codes in the body)
//! lives here so all providers classify the same way.

use std::time::Duration;

use reqwest::header::HeaderMap;

use relay_types::llm::LlmError;

/// Connect timeout for provider HTTP clients. Request timeouts are set per
/// call from the router's budget.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the HTTP client used by an adapter.
pub fn build_client() -> Result<reqwest::Client, LlmError> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| LlmError::Provider {
            message: format!("failed to create HTTP client: {e}"),
        })
}

/// Classify a non-success HTTP response.
pub fn classify_http_error(status: u16, retry_after_ms: Option<u64>, body: &str) -> LlmError {
    let lower = body.to_lowercase();
    let context_exceeded = lower.contains("context_length_exceeded")
        || lower.contains("maximum context length")
        || lower.contains("prompt is too long");

    match status {
        401 | 403 => LlmError::AuthenticationFailed,
        402 => LlmError::QuotaExceeded(body.to_string()),
        404 => LlmError::ModelNotFound(body.to_string()),
        413 => LlmError::ContextLengthExceeded {
            max: 0,
            requested: 0,
        },
        400 | 422 if context_exceeded => LlmError::ContextLengthExceeded {
            max: 0,
            requested: 0,
        },
        400 | 422 => LlmError::InvalidRequest(body.to_string()),
        429 if lower.contains("insufficient_quota") => LlmError::QuotaExceeded(body.to_string()),
        429 => LlmError::RateLimited { retry_after_ms },
        529 => LlmError::Overloaded(body.to_string()),
        503 if lower.contains("overloaded") => LlmError::Overloaded(body.to_string()),
        _ => LlmError::Provider {
            message: format!("HTTP {status}: {body}"),
        },
    }
}

/// Read a retry-after hint in milliseconds.
///
/// Prefers `retry-after-ms`, then `retry-after` in (possibly fractional)
/// seconds. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
    };

    if let Some(ms) = header("retry-after-ms").and_then(|v| v.parse::<f64>().ok()) {
        if ms.is_finite() && ms >= 0.0 {
            return Some(ms.ceil() as u64);
        }
    }
    header("retry-after")
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| (secs * 1000.0).ceil() as u64)
}

/// Turn a non-success response into a classified error.
pub async fn error_from_response(response: reqwest::Response) -> LlmError {
    let status = response.status().as_u16();
    let retry_after_ms = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    classify_http_error(status, retry_after_ms, &body)
}

/// Classify a failure to send the request or read the response.
pub fn map_send_error(err: reqwest::Error, timeout: Duration) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout {
            elapsed_ms: timeout.as_millis() as u64,
        }
    } else {
        LlmError::Provider {
            message: format!("HTTP request failed: {err}"),
        }
    }
}
