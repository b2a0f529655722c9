// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Response envelope handling.
//!
//! Some endpoints wrap their payload as `{success, status, data}`. Callers of
//! business endpoints only ever see `data`.

use serde_json::Value;

use crate::credential::Credential;

/// Whether `value` is an envelope: an object with `data` plus `success`
/// and/or `status`.
pub fn is_envelope(value: &Value) -> bool {
    value.as_object().is_some_and(|obj| {
        obj.contains_key("data") && (obj.contains_key("success") || obj.contains_key("status"))
    })
}

/// Strip the envelope, returning the inner payload.
///
/// An object reporting `success: false` yields its message as the error.
/// Anything that is not an envelope is returned unchanged.
pub fn unwrap(value: Value) -> Result<Value, String> {
    if value.get("success").and_then(Value::as_bool) == Some(false) {
        return Err(message_of(&value).unwrap_or_else(|| "request failed".to_owned()));
    }
    if !is_envelope(&value) {
        return Ok(value);
    }
    match value {
        Value::Object(mut obj) => Ok(obj.remove("data").unwrap_or(Value::Null)),
        other => Ok(other),
    }
}

/// Human-readable message from an error body (`message`, `error`, or
/// `detail`; `error` may itself be an object with a `message`).
fn message_of(value: &Value) -> Option<String> {
    for key in ["message", "error", "detail"] {
        match value.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(nested @ Value::Object(_)) => {
                if let Some(s) = nested.get("message").and_then(Value::as_str) {
                    return Some(s.to_owned());
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract an error message from a raw response body, if it is JSON.
pub fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    message_of(&value)
}

/// Read `access_token` and `refresh_token` from an unwrapped auth payload,
/// either at the top level or under `tokens`.
pub fn token_pair(payload: &Value) -> Option<Credential> {
    let source = match payload.get("tokens") {
        Some(tokens @ Value::Object(_)) => tokens,
        _ => payload,
    };
    let access = source.get("access_token")?.as_str()?;
    let refresh = source.get("refresh_token")?.as_str()?;
    if access.is_empty() || refresh.trim().is_empty() {
        return None;
    }
    Some(Credential::new(access, refresh))
}

#[cfg(test)]
#[path = "envelope_tests.rs"]
mod tests;
