//! Opaque token material.
//!
//! Tokens are 32 bytes of OS randomness, hex-encoded. Only the SHA-256
//! digest of a token is ever stored; the plaintext exists in the issuing
//! response and nowhere else.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Generate a fresh opaque token (64 hex chars)
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Storage digest of a token or password
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique_and_sized() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_is_stable_and_distinct_from_input() {
        let token = generate_token();
        assert_eq!(hash_token(&token), hash_token(&token));
        assert_ne!(hash_token(&token), token);
    }
}
