use crate::claims::Claims;
use crate::error::{OAuth2Error, OAuth2Result};
use base64::{Engine as _, engine::general_purpose::URL_SAFE};

/// Decodes the payload segment of a compact JWT without verifying its
/// signature.
///
/// The token comes straight from the provider's token endpoint over TLS, so
/// only its shape is checked: exactly three `.` separated segments, a
/// base64url payload (re-padded to a multiple of four) holding a JSON object.
pub fn decode_jwt_payload(token: &str) -> OAuth2Result<Claims> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(OAuth2Error::JwtFormat(format!(
            "expected 3 segments, found {}",
            segments.len()
        )));
    }

    let payload = repad(segments[1]);
    let bytes = URL_SAFE
        .decode(payload.as_bytes())
        .map_err(|e| OAuth2Error::JwtFormat(format!("payload is not base64url: {e}")))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| OAuth2Error::JwtFormat(format!("payload is not a JSON object: {e}")))
}

fn repad(segment: &str) -> String {
    let mut padded = segment.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    padded
}
