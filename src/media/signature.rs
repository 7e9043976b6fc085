//! Webhook signature verification
//!
//! The provider signs the raw request body with HMAC-SHA256 under the shared
//! webhook secret and sends the hex digest in [`SIGNATURE_HEADER`], optionally
//! prefixed with `sha256=`. Comparison goes through `Mac::verify_slice`, which
//! is constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::MediaError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature
pub const SIGNATURE_HEADER: &str = "x-media-signature";

const PREFIX: &str = "sha256=";

fn mac_for(secret: &str) -> Result<HmacSha256, MediaError> {
    if secret.is_empty() {
        return Err(MediaError::SignatureNotConfigured);
    }
    HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| MediaError::SignatureNotConfigured)
}

/// Hex HMAC-SHA256 of `body` under `secret`
pub fn sign(secret: &str, body: &[u8]) -> Result<String, MediaError> {
    let mut mac = mac_for(secret)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify `header` against the body
///
/// Any malformed, missing or mismatching signature yields
/// [`MediaError::InvalidSignature`] without saying which.
pub fn verify(secret: &str, body: &[u8], header: Option<&str>) -> Result<(), MediaError> {
    let mut mac = mac_for(secret)?;
    let header = header.ok_or(MediaError::InvalidSignature)?.trim();
    let digest = header.strip_prefix(PREFIX).unwrap_or(header);
    let expected = hex::decode(digest).map_err(|_| MediaError::InvalidSignature)?;

    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| MediaError::InvalidSignature)
}
