//! Request payloads for the admin API
//!
//! Entity responses serialize the storage models directly; only inbound
//! shapes live here. Create payloads carry no id: a row id exists only once
//! storage has assigned one.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Algorithm to generate with; required unless `pem` imports a key
    #[serde(default)]
    pub algorithm: Option<String>,
    /// Existing key material to import instead of generating
    #[serde(default)]
    pub pem: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateKeyRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub accept_tos: bool,
    pub private_key_id: i64,
    /// "prod" or "staging"
    pub directory: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAccountRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyChangeRequest {
    pub new_private_key_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCertificateRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub account_id: i64,
    pub private_key_id: i64,
    pub subject: String,
    #[serde(default)]
    pub subject_alts: Vec<String>,
    #[serde(default)]
    pub api_key_via_url: bool,
    #[serde(default)]
    pub post_processing_command: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCertificateRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub private_key_id: Option<i64>,
    #[serde(default)]
    pub subject_alts: Option<Vec<String>>,
    #[serde(default)]
    pub api_key_via_url: Option<bool>,
    /// `Some(None)` clears the command
    #[serde(default, with = "double_option")]
    pub post_processing_command: Option<Option<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeRequest {
    #[serde(default)]
    pub reason: u8,
}

/// Distinguishes an absent field from an explicit null
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Deserialize::deserialize(deserializer).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_key_generate_form() {
        let req: CreateKeyRequest =
            serde_json::from_str(r#"{"name": "k1", "algorithm": "ecdsap256"}"#).unwrap();
        assert_eq!(req.name, "k1");
        assert_eq!(req.algorithm.as_deref(), Some("ecdsap256"));
        assert!(req.pem.is_none());
    }

    #[test]
    fn test_update_certificate_clear_command() {
        let req: UpdateCertificateRequest =
            serde_json::from_str(r#"{"postProcessingCommand": null}"#).unwrap();
        assert_eq!(req.post_processing_command, Some(None));

        let req: UpdateCertificateRequest = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(req.post_processing_command, None);
    }

    #[test]
    fn test_revoke_defaults_to_unspecified() {
        let req: RevokeRequest = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(req.reason, 0);
    }
}
