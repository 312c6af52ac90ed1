//! API-key secret hashing (Argon2id, PHC string format).
//!
//! Stored hashes look like
//! `$argon2id$v=19$m=16384,t=2,p=2$<salt-b64>$<hash-b64>` with raw
//! (unpadded) base64. Verification reads the parameters back out of the
//! PHC string; any parse failure is a non-match, never a success.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};

use crate::error::{Error, Result};

pub const ARGON2_MEMORY_KIB: u32 = 16384;
pub const ARGON2_ITERATIONS: u32 = 2;
pub const ARGON2_PARALLELISM: u32 = 2;

fn argon2() -> Argon2<'static> {
    let params = Params::new(ARGON2_MEMORY_KIB, ARGON2_ITERATIONS, ARGON2_PARALLELISM, None)
        .expect("static argon2 params are valid");
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
}

/// Hash a plaintext secret into a PHC string with a fresh random salt.
pub fn hash_secret(secret: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    argon2()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Internal(format!("argon2 hashing failed: {e}")))
}

/// Verify a plaintext secret against a stored PHC string.
///
/// Parameters and output length come from the stored string; the
/// underlying comparison is constant-time.
pub fn verify_secret(secret: &str, phc: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(phc) else {
        return false;
    };
    argon2().verify_password(secret.as_bytes(), &parsed).is_ok()
}
