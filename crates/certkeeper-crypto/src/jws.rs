//! Flattened JWS serialization (RFC 7515) for the ACME wire

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::{CryptoError, PrivateKey};

/// A signed request body in flattened JWS JSON serialization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

/// Sign a protected header and payload with the given key, producing the
/// flattened JWS object.
///
/// An empty payload slice produces `"payload": ""`, which is the ACME
/// POST-as-GET form. The caller is responsible for the protected header
/// contents (`alg`, `nonce`, `url`, and exactly one of `jwk`/`kid`).
pub fn sign_jws(
    key: &PrivateKey,
    protected: &serde_json::Value,
    payload: &[u8],
) -> Result<Jws, CryptoError> {
    let protected_b64 = URL_SAFE_NO_PAD.encode(protected.to_string());
    let payload_b64 = if payload.is_empty() {
        String::new()
    } else {
        URL_SAFE_NO_PAD.encode(payload)
    };

    let signing_input = format!("{protected_b64}.{payload_b64}");
    let signature = key.sign(signing_input.as_bytes())?;

    Ok(Jws {
        protected: protected_b64,
        payload: payload_b64,
        signature: URL_SAFE_NO_PAD.encode(signature),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyAlgorithm;

    #[test]
    fn test_sign_jws_post_as_get() {
        let key = PrivateKey::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let protected = serde_json::json!({
            "alg": "ES256",
            "kid": "https://acme.example/acct/1",
            "nonce": "abc",
            "url": "https://acme.example/order/1",
        });

        let jws = sign_jws(&key, &protected, b"").unwrap();
        assert_eq!(jws.payload, "");
        assert!(!jws.protected.is_empty());
        assert!(!jws.signature.is_empty());
    }

    #[test]
    fn test_sign_jws_protected_header_roundtrip() {
        let key = PrivateKey::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let protected = serde_json::json!({
            "alg": "ES256",
            "jwk": key.public_jwk().unwrap(),
            "nonce": "nonce-1",
            "url": "https://acme.example/new-acct",
        });

        let jws = sign_jws(&key, &protected, br#"{"termsOfServiceAgreed":true}"#).unwrap();

        let decoded = URL_SAFE_NO_PAD.decode(&jws.protected).unwrap();
        let header: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(header["alg"], "ES256");
        assert_eq!(header["nonce"], "nonce-1");
        assert!(header["jwk"].is_object());
        assert!(header.get("kid").is_none());

        let payload = URL_SAFE_NO_PAD.decode(&jws.payload).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(body["termsOfServiceAgreed"], true);
    }

    #[test]
    fn test_signature_verifies_over_signing_input() {
        use signature::Verifier;

        let key = PrivateKey::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let protected = serde_json::json!({ "alg": "ES256", "url": "https://x" });
        let jws = sign_jws(&key, &protected, b"payload-bytes").unwrap();

        let PrivateKey::P256(inner) = &key else {
            panic!("expected p256 key");
        };
        let verifying_key: p256::ecdsa::VerifyingKey = inner.public_key().into();
        let sig_bytes = URL_SAFE_NO_PAD.decode(&jws.signature).unwrap();
        let signature = p256::ecdsa::Signature::from_slice(&sig_bytes).unwrap();

        let signing_input = format!("{}.{}", jws.protected, jws.payload);
        verifying_key
            .verify(signing_input.as_bytes(), &signature)
            .unwrap();
    }
}
