//! Validation of the `{hasError, code, msg, data}` envelope every portal
//! endpoint wraps its answer in.

use crate::portal::error::PortalError;
use reqwest::StatusCode;
use serde_json::Value;

/// Envelope codes the portal uses when the token is missing or expired.
const AUTH_CODES: [&str; 2] = ["100001", "100002"];

/// Turns an HTTP status and body into the decoded payload, or a classified error.
///
/// The payload is returned as decoded, envelope included.
pub fn parse_response(url: &str, status: StatusCode, body: &str) -> Result<Value, PortalError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(PortalError::AuthExpired {
            url: url.to_string(),
            reason: format!("HTTP {}", status.as_u16()),
        });
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(PortalError::RateLimited {
            url: url.to_string(),
        });
    }
    if !status.is_success() {
        return Err(PortalError::HttpStatus {
            url: url.to_string(),
            status,
        });
    }

    let payload: Value = serde_json::from_str(body).map_err(|e| PortalError::Malformed {
        url: url.to_string(),
        message: format!("invalid JSON: {}", e),
    })?;
    check_envelope(url, &payload)?;
    Ok(payload)
}

/// Checks the application-level success flag of an already decoded payload.
pub fn check_envelope(url: &str, payload: &Value) -> Result<(), PortalError> {
    let Some(object) = payload.as_object() else {
        return Err(PortalError::Malformed {
            url: url.to_string(),
            message: "top-level JSON is not an object".to_string(),
        });
    };
    if !object.contains_key("hasError") && !object.contains_key("code") {
        return Err(PortalError::Malformed {
            url: url.to_string(),
            message: "no success indicator (hasError/code)".to_string(),
        });
    }

    let has_error = object
        .get("hasError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let code = envelope_code(payload);
    let success = !has_error && code.as_deref().map_or(true, |c| c == "0");
    if success {
        return Ok(());
    }

    let code = code.unwrap_or_else(|| "?".to_string());
    let message = object
        .get("msg")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if AUTH_CODES.contains(&code.as_str()) {
        return Err(PortalError::AuthExpired {
            url: url.to_string(),
            reason: format!("code {}: {}", code, message),
        });
    }
    Err(PortalError::Rejected { code, message })
}

/// The envelope `code`, which the portal sends either as a number or a string.
pub fn envelope_code(payload: &Value) -> Option<String> {
    match payload.get("code")? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
