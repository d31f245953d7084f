//! Key material primitives for CertKeeper
//!
//! Generates and parses account/certificate private keys, produces JWKs and
//! RFC 7638 thumbprints, and signs flattened JWS objects for the ACME wire.

mod algorithm;
mod jws;
mod key;
pub mod pem;

pub use algorithm::KeyAlgorithm;
pub use jws::{sign_jws, Jws};
pub use key::PrivateKey;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use thiserror::Error;

/// Crypto errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("malformed pem: {0}")]
    MalformedPem(String),

    #[error("key does not match declared algorithm (expected {expected}, found {found})")]
    AlgorithmMismatch { expected: String, found: String },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("key encoding failed: {0}")]
    Encoding(String),
}

/// Generate an opaque high-entropy capability token (api key).
///
/// 32 random bytes, base64url without padding.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_api_key_length_and_charset() {
        let key = generate_api_key();
        // 32 bytes -> 43 base64url chars, no padding
        assert_eq!(key.len(), 43);
        assert!(!key.contains('+'));
        assert!(!key.contains('/'));
        assert!(!key.contains('='));
    }

    #[test]
    fn test_generate_api_key_unique() {
        assert_ne!(generate_api_key(), generate_api_key());
    }
}
