//! Challenge solvers for CertKeeper
//!
//! A solver makes a challenge response externally observable before the ACME
//! server is told to validate: the HTTP-01 responder serves the key
//! authorization from an internal listener, the DNS-01 provider publishes a
//! TXT record through the Cloudflare API and waits for propagation.
//! `provision` must only return once the response is visible; `cleanup` is
//! invoked by the pipeline for every successful provision, error paths
//! included.

mod dns01;
mod http01;

pub use dns01::{CloudflareConfig, Dns01CloudflareSolver};
pub use http01::Http01Solver;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Challenge types CertKeeper can solve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Http01,
    Dns01,
}

impl ChallengeKind {
    /// The `type` value used on the ACME wire
    pub fn acme_type(&self) -> &'static str {
        match self {
            ChallengeKind::Http01 => "http-01",
            ChallengeKind::Dns01 => "dns-01",
        }
    }

    pub fn from_acme_type(value: &str) -> Option<Self> {
        match value {
            "http-01" => Some(ChallengeKind::Http01),
            "dns-01" => Some(ChallengeKind::Dns01),
            _ => None,
        }
    }
}

/// What a solver needs to undo its work later
#[derive(Debug, Clone)]
pub struct ProvisionReceipt {
    pub kind: ChallengeKind,
    pub identifier: String,
    pub token: String,
    pub dns_record: Option<DnsRecord>,
}

/// A TXT record created at the DNS provider
#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub zone_id: String,
    pub record_id: String,
    pub fqdn: String,
}

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("challenge provider error: {0}")]
    Provider(String),

    #[error("challenge provider transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no configured zone covers identifier {0}")]
    UnknownDomain(String),

    #[error("dns record for {0} did not propagate in time")]
    PropagationTimeout(String),

    #[error("shutdown requested")]
    Shutdown,
}

/// A pluggable challenge solver
#[async_trait::async_trait]
pub trait ChallengeSolver: Send + Sync {
    fn kind(&self) -> ChallengeKind;

    /// Make the challenge response externally observable. Returns only once
    /// it is (HTTP path live, or DNS TXT visible).
    async fn provision(
        &self,
        identifier: &str,
        token: &str,
        key_authorization: &str,
    ) -> Result<ProvisionReceipt, SolverError>;

    /// Undo a successful provision
    async fn cleanup(&self, receipt: &ProvisionReceipt) -> Result<(), SolverError>;
}

/// DNS-01 TXT record value: base64url(SHA-256(keyAuthorization)) per
/// RFC 8555 section 8.4
pub fn dns_txt_value(key_authorization: &str) -> String {
    let digest = Sha256::digest(key_authorization.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_kind_roundtrip() {
        assert_eq!(ChallengeKind::from_acme_type("http-01"), Some(ChallengeKind::Http01));
        assert_eq!(ChallengeKind::from_acme_type("dns-01"), Some(ChallengeKind::Dns01));
        assert_eq!(ChallengeKind::from_acme_type("tls-alpn-01"), None);
        assert_eq!(ChallengeKind::Dns01.acme_type(), "dns-01");
    }

    #[test]
    fn test_dns_txt_value_matches_manual_digest() {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;
        use sha2::{Digest, Sha256};

        let key_auth = "evaGxfADs6pSRb2LAv9IZf17Dt3juxGJ-PCt92wr-oA.nP1qzpXGymHBrUEepNY9HCsQk7K8KhOypzEt62jcerQ";
        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(key_auth.as_bytes()));
        assert_eq!(dns_txt_value(key_auth), expected);
        // base64url SHA-256 is always 43 chars, unpadded
        assert_eq!(dns_txt_value(key_auth).len(), 43);
    }
}
