//! Access token expiry
//!
//! Tokens are JWTs issued by the login flow. Only the `exp` claim of the
//! payload is inspected; the signature is never verified here.

use super::error::{ConfigError, ConfigResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};

/// Expiry time carried by the token, if it declares one
pub fn expiry(token: &str) -> ConfigResult<Option<DateTime<Utc>>> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_)) => payload,
        _ => {
            return Err(ConfigError::MalformedToken(
                "expected three dot-separated segments".to_string(),
            ))
        }
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| ConfigError::MalformedToken(format!("payload is not base64url: {e}")))?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| ConfigError::MalformedToken(format!("payload is not JSON: {e}")))?;

    let exp = match claims.get("exp") {
        Some(serde_json::Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(serde_json::Value::String(s)) => s.parse::<i64>().ok(),
        _ => None,
    };
    Ok(exp.and_then(|secs| DateTime::from_timestamp(secs, 0)))
}

/// A token without an `exp` claim counts as expired
pub fn is_expired(token: &str, now: DateTime<Utc>) -> ConfigResult<bool> {
    Ok(match expiry(token)? {
        Some(exp) => exp <= now,
        None => true,
    })
}

#[cfg(test)]
pub(crate) fn fake_token(exp: Option<i64>) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = match exp {
        Some(exp) => serde_json::json!({ "sub": "user", "exp": exp }),
        None => serde_json::json!({ "sub": "user" }),
    };
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.signature")
}
