//! ACME wire objects (RFC 8555 section 7.1)
//!
//! Timestamps stay RFC 3339 strings here; conversion to Unix seconds happens
//! at the storage boundary.

use serde::{Deserialize, Serialize};

use crate::problem::Problem;

/// The directory document, fetched once per client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    #[serde(default)]
    pub revoke_cert: Option<String>,
    #[serde(default)]
    pub key_change: Option<String>,
    #[serde(default)]
    pub meta: Option<DirectoryMeta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    #[serde(default)]
    pub terms_of_service: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub external_account_required: Option<bool>,
}

/// Account object returned by newAccount / account updates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub status: String,
    #[serde(default)]
    pub contact: Option<Vec<String>>,
    #[serde(default)]
    pub orders: Option<String>,
}

/// An identifier an order or authorization covers; always `type: "dns"` here
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            kind: "dns".to_string(),
            value: value.into(),
        }
    }
}

/// Order status per RFC 8555 section 7.1.6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderStatus {
    /// `valid` and `invalid` are terminal; nothing transitions out of them
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Valid | OrderStatus::Invalid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Ready => "ready",
            OrderStatus::Processing => "processing",
            OrderStatus::Valid => "valid",
            OrderStatus::Invalid => "invalid",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order object
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub status: OrderStatus,
    #[serde(default)]
    pub expires: Option<String>,
    pub identifiers: Vec<Identifier>,
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub error: Option<Problem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

/// Authorization object, fetched per order during processing (never persisted)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    #[serde(default)]
    pub expires: Option<String>,
    #[serde(default)]
    pub challenges: Vec<Challenge>,
    #[serde(default)]
    pub wildcard: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// Challenge object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub status: ChallengeStatus,
    pub token: String,
    #[serde(default)]
    pub error: Option<Problem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_decode() {
        let json = r#"{
            "newNonce": "https://acme.example/new-nonce",
            "newAccount": "https://acme.example/new-acct",
            "newOrder": "https://acme.example/new-order",
            "revokeCert": "https://acme.example/revoke-cert",
            "keyChange": "https://acme.example/key-change",
            "meta": {"termsOfService": "https://acme.example/tos"}
        }"#;
        let dir: Directory = serde_json::from_str(json).unwrap();
        assert_eq!(dir.new_nonce, "https://acme.example/new-nonce");
        assert_eq!(
            dir.key_change.as_deref(),
            Some("https://acme.example/key-change")
        );
        assert_eq!(
            dir.meta.unwrap().terms_of_service.as_deref(),
            Some("https://acme.example/tos")
        );
    }

    #[test]
    fn test_order_decode() {
        let json = r#"{
            "status": "pending",
            "expires": "2026-09-01T00:00:00Z",
            "identifiers": [{"type": "dns", "value": "example.com"}],
            "authorizations": ["https://acme.example/authz/1"],
            "finalize": "https://acme.example/order/1/finalize"
        }"#;
        let order: Order = serde_json::from_str(json).unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(!order.status.is_terminal());
        assert_eq!(order.identifiers[0], Identifier::dns("example.com"));
        assert!(order.certificate.is_none());
    }

    #[test]
    fn test_order_status_terminal() {
        assert!(OrderStatus::Valid.is_terminal());
        assert!(OrderStatus::Invalid.is_terminal());
        assert!(!OrderStatus::Processing.is_terminal());
        assert!(!OrderStatus::Ready.is_terminal());
    }

    #[test]
    fn test_authorization_decode() {
        let json = r#"{
            "identifier": {"type": "dns", "value": "example.com"},
            "status": "pending",
            "challenges": [
                {"type": "http-01", "url": "https://acme.example/chall/1", "status": "pending", "token": "tok-1"},
                {"type": "dns-01", "url": "https://acme.example/chall/2", "status": "pending", "token": "tok-2"}
            ]
        }"#;
        let authz: Authorization = serde_json::from_str(json).unwrap();
        assert_eq!(authz.status, AuthorizationStatus::Pending);
        assert_eq!(authz.challenges.len(), 2);
        assert_eq!(authz.challenges[1].kind, "dns-01");
    }

    #[test]
    fn test_challenge_with_error() {
        let json = r#"{
            "type": "http-01",
            "url": "https://acme.example/chall/1",
            "status": "invalid",
            "token": "tok",
            "error": {"type": "urn:ietf:params:acme:error:connection", "detail": "refused"}
        }"#;
        let challenge: Challenge = serde_json::from_str(json).unwrap();
        assert_eq!(challenge.status, ChallengeStatus::Invalid);
        assert!(challenge.error.unwrap().to_string().contains("connection"));
    }
}
