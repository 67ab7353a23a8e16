use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::time::Duration;

use crate::error::{ProviderError, ProviderErrorKind};

/// Longest `Retry-After` hint taken at face value.
pub(crate) const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

pub(crate) fn is_rate_limited(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    let code = status.as_u16();
    if code == 529 || code == 503 {
        return true;
    }
    let lower = body.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too many requests")
        || lower.contains("resource_exhausted")
        || lower.contains("overloaded")
}

/// Exhausted credit or quota on the account; no amount of waiting helps this key.
pub(crate) fn is_billing_failure(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("insufficient_quota")
        || lower.contains("exceeded your current quota")
        || lower.contains("billing")
        || lower.contains("credit balance")
        || lower.contains("quota exceeded")
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs).min(MAX_RETRY_AFTER));
    }
    let secs = value.parse::<f64>().ok().filter(|secs| secs.is_finite())?;
    if secs < 0.0 {
        return None;
    }
    Some(
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_RETRY_AFTER)
            .min(MAX_RETRY_AFTER),
    )
}

pub(crate) fn classify_status(status: StatusCode, body: &str) -> ProviderErrorKind {
    match status.as_u16() {
        401 | 403 => ProviderErrorKind::AuthError,
        _ if is_billing_failure(body) => ProviderErrorKind::AuthError,
        408 | 504 => ProviderErrorKind::Timeout,
        400 | 404 | 413 | 422 => ProviderErrorKind::InvalidRequest,
        _ if is_rate_limited(status, body) => ProviderErrorKind::RateLimited,
        _ => ProviderErrorKind::Unknown,
    }
}

pub(crate) fn http_error(
    provider: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    detail: Option<String>,
) -> ProviderError {
    let kind = classify_status(status, body);
    let message = format!(
        "{} API error ({}): {}",
        provider,
        status,
        detail.unwrap_or_else(|| body.trim().to_string())
    );
    ProviderError::new(kind, message).with_retry_after(retry_after(headers))
}

pub(crate) fn transport_error(provider: &str, err: reqwest::Error) -> ProviderError {
    let kind = if err.is_timeout() {
        ProviderErrorKind::Timeout
    } else {
        ProviderErrorKind::Unknown
    };
    ProviderError::new(kind, format!("{} request failed: {}", provider, err))
}

pub(crate) fn format_error_parts(
    message: Option<String>,
    kind: Option<String>,
    code: Option<String>,
) -> String {
    let mut parts = Vec::new();
    if let Some(message) = message
        && !message.trim().is_empty()
    {
        parts.push(message);
    }
    if let Some(kind) = kind
        && !kind.trim().is_empty()
    {
        parts.push(format!("type: {}", kind));
    }
    if let Some(code) = code
        && !code.trim().is_empty()
    {
        parts.push(format!("code: {}", code));
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(" | ")
    }
}
