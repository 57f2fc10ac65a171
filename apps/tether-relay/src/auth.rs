//! Request authentication for the relay surface.
//!
//! Who the caller *is* arrives as the opaque `X-Tether-Identity` header
//! (identity/role verification happens upstream of this service).
//! What the caller may touch is decided per session: the bearer token
//! minted at creation, or, for PIN-addressed support flows, the
//! one-time access code. Both are compared against stored hashes.

use axum::http::{HeaderMap, StatusCode};

use tether_core::registry::verify_secret;
use tether_proto::SessionRecord;

pub const IDENTITY_HEADER: &str = "x-tether-identity";
pub const PIN_HEADER: &str = "x-tether-pin";

pub fn identity(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn require_identity(headers: &HeaderMap) -> Result<String, StatusCode> {
    identity(headers).ok_or(StatusCode::UNAUTHORIZED)
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn pin(headers: &HeaderMap) -> Option<String> {
    headers
        .get(PIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// A caller may touch a session with its bearer token, with its
/// one-time PIN, or (for the sharer end) by being the session's
/// device.
pub fn authorize_session(headers: &HeaderMap, session: &SessionRecord) -> Result<(), StatusCode> {
    if let Some(token) = bearer_token(headers) {
        if verify_secret(&token, &session.token_hash) {
            return Ok(());
        }
    }
    if let Some(pin) = pin(headers) {
        if verify_secret(&pin, &session.pin_hash) {
            return Ok(());
        }
    }
    if let (Some(identity), Some(device_id)) = (identity(headers), &session.device_id) {
        if &identity == device_id {
            return Ok(());
        }
    }
    Err(StatusCode::FORBIDDEN)
}

/// Query-string fallbacks for websocket upgrades, where custom headers
/// are awkward for browser clients.
pub fn authorize_session_params(
    token: Option<&str>,
    pin: Option<&str>,
    session: &SessionRecord,
) -> Result<(), StatusCode> {
    if let Some(token) = token {
        if verify_secret(token, &session.token_hash) {
            return Ok(());
        }
    }
    if let Some(pin) = pin {
        if verify_secret(pin, &session.pin_hash) {
            return Ok(());
        }
    }
    Err(StatusCode::FORBIDDEN)
}
