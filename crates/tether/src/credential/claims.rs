// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local, unverified decoding of the access token's expiry claim.
//!
//! Advisory only: used to refresh ahead of expiry. The server's 401 stays
//! the authoritative signal.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Decode the `exp` claim (epoch seconds) from a JWT-shaped token.
///
/// Returns `None` for anything that is not `header.payload.signature` with a
/// base64url JSON payload carrying a numeric `exp`.
pub fn expiry(token: &str) -> Option<SystemTime> {
    let mut parts = token.split('.');
    let (_header, payload, _signature) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    // Tolerate padded payloads from lenient issuers.
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?;
    let secs = exp.as_u64().or_else(|| exp.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))?;
    UNIX_EPOCH.checked_add(Duration::from_secs(secs))
}

/// Whether `token` expires within `threshold` of `now`.
///
/// Undecodable tokens count as expiring so the caller refreshes.
pub fn expires_within(token: &str, threshold: Duration, now: SystemTime) -> bool {
    match expiry(token) {
        Some(exp) => match exp.duration_since(now) {
            Ok(remaining) => remaining < threshold,
            Err(_) => true,
        },
        None => {
            tracing::debug!("access token expiry not decodable, treating as expiring");
            true
        }
    }
}

#[cfg(test)]
#[path = "claims_tests.rs"]
mod tests;
