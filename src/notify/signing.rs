// SPDX-License-Identifier: MIT
//! Webhook signing.
//!
//! Receivers verify `X-CodeQ-Signature` by recomputing
//! `HMAC-SHA256(secret, "{timestamp}." + body)` with the value of
//! `X-CodeQ-Timestamp` and comparing hex digests.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "X-CodeQ-Timestamp";
pub const SIGNATURE_HEADER: &str = "X-CodeQ-Signature";

/// Hex HMAC-SHA256 over `"{timestamp}.{body}"`.
pub fn sign(secret: &str, timestamp: i64, body: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification counterpart of [`sign`].
pub fn verify(secret: &str, timestamp: i64, body: &str, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    mac.verify_slice(&expected).is_ok()
}
