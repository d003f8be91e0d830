//! HMAC-SHA256 webhook signatures.
//!
//! The signature covers the exact bytes sent on the wire and travels as
//! `X-Signature: sha256=<lowercase hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("signing key rejected: {0}")]
pub struct SigningError(String);

/// Header value for `body` signed with `secret`.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String, SigningError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| SigningError(e.to_string()))?;
    mac.update(body);
    Ok(format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes())))
}

/// Receiver-side check of an `X-Signature` header. Constant time in the
/// signature bytes.
pub fn verify_signature(secret: &[u8], body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.trim().strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}
