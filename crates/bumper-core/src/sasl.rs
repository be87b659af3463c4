//! SASL PLAIN payload decoding.
//!
//! Firmware and apps disagree on where the resource and auth code go. Two
//! shapes are seen on the wire:
//!
//! - `\0user\0{x}/resource/authcode`, where `{x}` is empty or a placeholder
//! - `\0user\0resource/authcode` (or `\0`-separated instead of `/`)

use crate::error::{BumperError, BumperResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Credentials carried by a SASL PLAIN `auth` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainCredentials {
    pub user: String,
    pub resource: String,
    pub auth_code: String,
}

/// Decode the base64 text of a SASL PLAIN `auth` element.
pub fn decode_plain(encoded: &str) -> BumperResult<PlainCredentials> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let raw = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| BumperError::AuthFailed(format!("invalid base64: {e}")))?;
    let text = String::from_utf8(raw)
        .map_err(|e| BumperError::AuthFailed(format!("invalid utf-8: {e}")))?;
    parse_plain(&text)
}

/// Split a decoded PLAIN message into user, resource and auth code.
pub fn parse_plain(text: &str) -> BumperResult<PlainCredentials> {
    let mut fields = text.splitn(3, '\0');
    let _authzid = fields.next();
    let user = fields
        .next()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| BumperError::AuthFailed("missing authentication identity".into()))?;
    let rest = fields.next().unwrap_or("");

    let parts: Vec<&str> = if rest.contains('/') {
        rest.split('/').collect()
    } else {
        rest.split('\0').collect()
    };

    let (resource, auth_code) = match parts.as_slice() {
        [_, resource, code, ..] => (*resource, *code),
        [resource, code] => (*resource, *code),
        [resource] => (*resource, ""),
        [] => ("", ""),
    };

    Ok(PlainCredentials {
        user: user.to_string(),
        resource: resource.to_string(),
        auth_code: auth_code.to_string(),
    })
}
