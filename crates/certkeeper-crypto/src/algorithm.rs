//! Supported private key algorithms

use serde::{Deserialize, Serialize};

use crate::CryptoError;

/// Key algorithms CertKeeper can generate and use for ACME accounts and
/// certificate keys. The string values are stable and stored in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    #[serde(rename = "rsa2048")]
    Rsa2048,
    #[serde(rename = "rsa3072")]
    Rsa3072,
    #[serde(rename = "rsa4096")]
    Rsa4096,
    #[serde(rename = "ecdsap256")]
    EcdsaP256,
    #[serde(rename = "ecdsap384")]
    EcdsaP384,
}

impl KeyAlgorithm {
    /// All supported algorithms, for listings and validation.
    pub fn all() -> &'static [KeyAlgorithm] {
        &[
            KeyAlgorithm::Rsa2048,
            KeyAlgorithm::Rsa3072,
            KeyAlgorithm::Rsa4096,
            KeyAlgorithm::EcdsaP256,
            KeyAlgorithm::EcdsaP384,
        ]
    }

    /// Stable storage value
    pub fn value(&self) -> &'static str {
        match self {
            KeyAlgorithm::Rsa2048 => "rsa2048",
            KeyAlgorithm::Rsa3072 => "rsa3072",
            KeyAlgorithm::Rsa4096 => "rsa4096",
            KeyAlgorithm::EcdsaP256 => "ecdsap256",
            KeyAlgorithm::EcdsaP384 => "ecdsap384",
        }
    }

    /// Parse a stable storage value
    pub fn from_value(value: &str) -> Result<Self, CryptoError> {
        match value {
            "rsa2048" => Ok(KeyAlgorithm::Rsa2048),
            "rsa3072" => Ok(KeyAlgorithm::Rsa3072),
            "rsa4096" => Ok(KeyAlgorithm::Rsa4096),
            "ecdsap256" => Ok(KeyAlgorithm::EcdsaP256),
            "ecdsap384" => Ok(KeyAlgorithm::EcdsaP384),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    /// Human friendly name for API listings
    pub fn display_name(&self) -> &'static str {
        match self {
            KeyAlgorithm::Rsa2048 => "RSA 2048-bit",
            KeyAlgorithm::Rsa3072 => "RSA 3072-bit",
            KeyAlgorithm::Rsa4096 => "RSA 4096-bit",
            KeyAlgorithm::EcdsaP256 => "ECDSA P-256",
            KeyAlgorithm::EcdsaP384 => "ECDSA P-384",
        }
    }

    /// JWS `alg` protected header value (RFC 7518)
    pub fn jws_alg(&self) -> &'static str {
        match self {
            KeyAlgorithm::Rsa2048 | KeyAlgorithm::Rsa3072 | KeyAlgorithm::Rsa4096 => "RS256",
            KeyAlgorithm::EcdsaP256 => "ES256",
            KeyAlgorithm::EcdsaP384 => "ES384",
        }
    }
}

impl std::fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.value())
    }
}
