//! Error mapping for provider responses
//!
//! Converts upstream HTTP statuses, error bodies and transport failures into
//! the transient/permanent split the retry policy depends on.

use reqwest::StatusCode;
use serde_json::Value;

use super::DispatchError;
use crate::util::{sanitize_for_logging, truncate_string};

const MAX_MESSAGE_LEN: usize = 256;

/// Whether an HTTP status is worth retrying
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.as_u16() == 425
}

/// Map a non-success provider response to a DispatchError
pub fn classify_status(status: StatusCode, body: &str) -> DispatchError {
    let message = format!("HTTP {}: {}", status.as_u16(), extract_message(body));

    if is_transient_status(status) {
        DispatchError::transient(message)
    } else {
        DispatchError::permanent(message)
    }
}

/// Map a transport-level failure to a DispatchError
pub fn classify_transport(err: &reqwest::Error) -> DispatchError {
    if let Some(status) = err.status() {
        return classify_status(status, &err.to_string());
    }

    if err.is_timeout() {
        DispatchError::transient(format!("Request timed out: {}", err))
    } else if err.is_connect() {
        DispatchError::transient(format!("Connection error: {}", err))
    } else if err.is_body() || err.is_decode() {
        // Body interrupted mid-transfer, typically a reset connection
        DispatchError::transient(format!("Response body error: {}", err))
    } else if err.is_builder() || err.is_request() {
        DispatchError::permanent(format!("Invalid request: {}", err))
    } else {
        DispatchError::transient(format!("HTTP client error: {}", err))
    }
}

/// Pull a human-readable message out of a provider error body
///
/// Platforms disagree on the field name (`error.message`, `message`, `msg`), so
/// each is tried in turn before falling back to the raw body.
fn extract_message(body: &str) -> String {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| {
            json.pointer("/error/message")
                .or_else(|| json.get("message"))
                .or_else(|| json.get("msg"))
                .or_else(|| json.get("error"))
                .and_then(|m| m.as_str().map(str::to_string))
        })
        .unwrap_or_else(|| body.trim().to_string());

    truncate_string(&sanitize_for_logging(&message), MAX_MESSAGE_LEN)
}
