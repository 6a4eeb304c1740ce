//! SASL payload handling for the AUTH command.
//!
//! Multi-step mechanisms park a [`Continuation`] on the connection; the
//! dispatcher feeds it the client's next line as a base64 payload before
//! any verb parsing happens. Credential verification itself belongs to
//! the `on_auth` hook.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error;

/// Base64 of `Username:`, the LOGIN mechanism's first challenge.
pub const LOGIN_USERNAME_CHALLENGE: &str = "VXNlcm5hbWU6";
/// Base64 of `Password:`, the LOGIN mechanism's second challenge.
pub const LOGIN_PASSWORD_CHALLENGE: &str = "UGFzc3dvcmQ6";

/// The client aborts a SASL exchange with a lone `*` (RFC 4954 §4).
pub const ABORT: &str = "*";

/// The one-shot continuation slot consumed by the next client line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    /// Awaiting the PLAIN initial response.
    Plain,
    /// Awaiting the LOGIN username.
    LoginUser,
    /// Awaiting the LOGIN password.
    LoginPass { username: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Error: invalid base64 payload")]
    Base64,

    #[error("Error: malformed PLAIN credentials")]
    Malformed,

    #[error("Error: credentials are not valid UTF-8")]
    Utf8,
}

/// Decode a base64 line into UTF-8 text.
pub fn decode_utf8(payload: &str) -> Result<String, AuthError> {
    let decoded = BASE64
        .decode(payload.trim())
        .map_err(|_| AuthError::Base64)?;

    String::from_utf8(decoded).map_err(|_| AuthError::Utf8)
}

/// Decode a PLAIN initial response: `authzid NUL authcid NUL passwd`.
///
/// The authorization identity is ignored; the authentication identity and
/// password are returned.
pub fn decode_plain(payload: &str) -> Result<(String, String), AuthError> {
    let decoded = BASE64
        .decode(payload.trim())
        .map_err(|_| AuthError::Base64)?;

    let mut parts = decoded.split(|&byte| byte == 0);

    let _authzid = parts.next().ok_or(AuthError::Malformed)?;
    let username = parts.next().ok_or(AuthError::Malformed)?;
    let password = parts.next().ok_or(AuthError::Malformed)?;

    if parts.next().is_some() {
        return Err(AuthError::Malformed);
    }

    let username = std::str::from_utf8(username).map_err(|_| AuthError::Utf8)?;
    let password = std::str::from_utf8(password).map_err(|_| AuthError::Utf8)?;

    Ok((username.to_string(), password.to_string()))
}
