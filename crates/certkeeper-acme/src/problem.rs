//! ACME problem documents (RFC 7807 / RFC 8555 section 6.7)

use serde::{Deserialize, Serialize};

use crate::types::Identifier;

/// A decoded `application/problem+json` error body from the ACME server.
///
/// Stored verbatim into an order's `error` column when a job fails.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub problem_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<Identifier>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subproblems: Vec<Problem>,
}

impl Problem {
    /// The error name with the `urn:ietf:params:acme:error:` prefix stripped
    pub fn error_name(&self) -> Option<&str> {
        let full = self.problem_type.as_deref()?;
        Some(full.rsplit(':').next().unwrap_or(full))
    }

    pub fn is_bad_nonce(&self) -> bool {
        self.error_name() == Some("badNonce")
    }

    /// Whether the pipeline should back off and retry this failure.
    /// Server-side 5xx conditions and rate limiting are transient; everything
    /// else reflects a problem with the order itself.
    pub fn is_retryable(&self) -> bool {
        if matches!(self.status, Some(status) if status >= 500) {
            return true;
        }
        matches!(self.error_name(), Some("rateLimited") | Some("serverInternal"))
    }
}

impl std::fmt::Display for Problem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.problem_type, &self.detail) {
            (Some(kind), Some(detail)) => write!(f, "{kind}: {detail}"),
            (Some(kind), None) => write!(f, "{kind}"),
            (None, Some(detail)) => write!(f, "{detail}"),
            (None, None) => write!(f, "unknown acme problem"),
        }
    }
}
