/// Access token expiry inspection
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current time in epoch milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Whether the stored expiry, pulled forward by `buffer`, has passed.
///
/// A missing or unparseable timestamp says nothing about expiry.
pub fn stored_expiry_passed(expires_at: Option<&str>, buffer: Duration, now_ms: u64) -> bool {
    match expires_at.and_then(|raw| raw.trim().parse::<u64>().ok()) {
        Some(expires_at_ms) => {
            expires_at_ms.saturating_sub(buffer.as_millis() as u64) <= now_ms
        }
        None => false,
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<f64>,
}

/// Expiry embedded in a JWT access token, in epoch milliseconds.
///
/// The signature is not verified; only the payload's `exp` claim is read.
/// Opaque tokens yield `None`.
pub fn jwt_expiry_ms(token: &str) -> Option<u64> {
    let mut segments = token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }

    // Some issuers pad their segments despite RFC 7515
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.exp?;
    if !exp.is_finite() || exp < 0.0 {
        return None;
    }

    Some((exp * 1000.0) as u64)
}

/// Whether a JWT's own `exp` claim has passed.
pub fn jwt_expired(token: &str, now_ms: u64) -> bool {
    jwt_expiry_ms(token).is_some_and(|exp_ms| exp_ms <= now_ms)
}

/// Combined check used before attaching a token to a request
pub fn access_token_expired(
    token: &str,
    stored_expires_at: Option<&str>,
    buffer: Duration,
    now_ms: u64,
) -> bool {
    stored_expiry_passed(stored_expires_at, buffer, now_ms) || jwt_expired(token, now_ms)
}

#[cfg(test)]
pub(crate) fn fake_jwt(exp_secs: u64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"store-42","exp":{}}}"#, exp_secs));
    format!("{}.{}.signature", header, payload)
}
