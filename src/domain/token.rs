//! Bearer token format: generation, hashing, and validation.
//!
//! Plaintext tokens are `tmtk_` + 43 base64url chars (48 total) and are
//! returned to the caller exactly once. The server keeps only
//! `tmth_` + 64 lowercase hex chars of SHA-256(plaintext).

use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

pub const TOKEN_PREFIX: &str = "tmtk_";
pub const TOKEN_LEN: usize = 48;
pub const HASH_PREFIX: &str = "tmth_";
pub const HASH_LEN: usize = 69;

/// Generate a fresh token, returning `(plaintext, hash)`.
pub fn generate() -> (String, String) {
    let bytes: [u8; 32] = rand::rng().random();
    let body = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    let plaintext = format!("{TOKEN_PREFIX}{body}");
    let hash = compute_hash(&plaintext);
    (plaintext, hash)
}

/// SHA-256 the plaintext into the storage form.
pub fn compute_hash(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("{HASH_PREFIX}{digest:x}")
}

/// Constant-time comparison of a plaintext token against a stored hash.
pub fn verify_hash(token: &str, expected_hash: &str) -> bool {
    let computed = compute_hash(token);
    computed.as_bytes().ct_eq(expected_hash.as_bytes()).into()
}

/// Check prefix, length, and alphabet of a plaintext token.
pub fn validate_format(token: &str) -> Result<()> {
    if token.len() != TOKEN_LEN {
        return Err(Error::TokenMalformed);
    }
    let Some(body) = token.strip_prefix(TOKEN_PREFIX) else {
        return Err(Error::TokenMalformed);
    };
    if !body
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(Error::TokenMalformed);
    }
    Ok(())
}

/// Check prefix and shape of a stored token hash.
pub fn validate_hash_format(hash: &str) -> Result<()> {
    if hash.len() != HASH_LEN {
        return Err(Error::TokenMalformed);
    }
    let Some(body) = hash.strip_prefix(HASH_PREFIX) else {
        return Err(Error::TokenMalformed);
    };
    if !body.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
        return Err(Error::TokenMalformed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_have_documented_shape() {
        let (plaintext, hash) = generate();
        assert_eq!(plaintext.len(), 48);
        assert!(plaintext.starts_with("tmtk_"));
        assert_eq!(hash.len(), 69);
        assert!(hash.starts_with("tmth_"));
        validate_format(&plaintext).unwrap();
        validate_hash_format(&hash).unwrap();
    }

    #[test]
    fn hash_is_deterministic_and_discriminating() {
        let (t1, h1) = generate();
        let (t2, h2) = generate();
        assert_eq!(compute_hash(&t1), h1);
        assert_ne!(t1, t2);
        assert_ne!(h1, h2);
    }

    #[test]
    fn verify_accepts_only_the_original_plaintext() {
        let (plaintext, hash) = generate();
        assert!(verify_hash(&plaintext, &hash));
        let (other, _) = generate();
        assert!(!verify_hash(&other, &hash));
    }

    #[test]
    fn format_validation_rejects_bad_shapes() {
        assert!(validate_format("tmtk_short").is_err());
        assert!(validate_format("tmxx_AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").is_err());
        // '+' is standard base64, not base64url
        assert!(validate_format("tmtk_AAAAAAAAAAAAAAAAAAAAA+AAAAAAAAAAAAAAAAAAAAA").is_err());
        assert!(validate_format("tmtk_AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").is_ok());
    }

    #[test]
    fn hash_validation_rejects_uppercase_hex() {
        let (_, hash) = generate();
        let upper = hash.to_uppercase().replace("TMTH_", "tmth_");
        assert!(validate_hash_format(&upper).is_err());
        assert!(validate_hash_format(&hash).is_ok());
    }
}
