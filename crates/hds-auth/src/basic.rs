//! HTTP Basic credential verification.
//!
//! Passwords are stored as unsalted SHA-256 hex digests, matching what the
//! settings UI writes. Digest comparison is constant-time.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq as _;

/// The stored digest for a plaintext password.
#[must_use]
pub fn password_digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Verify an `Authorization` header against configured credentials.
///
/// `expected_digest` is the SHA-256 hex digest of the configured password.
#[must_use]
pub fn verify_basic_header(header: &str, expected_username: &str, expected_digest: &str) -> bool {
    let Some((scheme, encoded)) = header.split_once(' ') else {
        return false;
    };
    if !scheme.eq_ignore_ascii_case("basic") {
        return false;
    }

    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((username, password)) = credentials.split_once(':') else {
        return false;
    };

    let digest = password_digest(password);
    let username_ok = username == expected_username;
    let digest_ok: bool = digest
        .as_bytes()
        .ct_eq(expected_digest.as_bytes())
        .into();

    username_ok && digest_ok
}
