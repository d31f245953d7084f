//! ACME client error taxonomy

use thiserror::Error;

use crate::problem::Problem;

#[derive(Debug, Error)]
pub enum AcmeError {
    /// Typed error returned by the ACME server as a problem document
    #[error("acme server error: {0}")]
    Protocol(Problem),

    /// Network / TLS level failure; always worth a retry from the pipeline
    #[error("acme transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server rejected the nonce and the single fresh-nonce retry failed too
    #[error("acme server rejected nonce twice")]
    BadNonceExhausted,

    /// Response that does not match the RFC 8555 wire format
    #[error("malformed acme response: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    Crypto(#[from] certkeeper_crypto::CryptoError),
}

impl AcmeError {
    /// Whether the pipeline retry policy applies to this failure
    pub fn is_retryable(&self) -> bool {
        match self {
            AcmeError::Protocol(problem) => problem.is_retryable(),
            AcmeError::Transport(_) => true,
            AcmeError::BadNonceExhausted => true,
            AcmeError::MalformedResponse(_) => false,
            AcmeError::Crypto(_) => false,
        }
    }

    /// The problem document, when the server produced one
    pub fn problem(&self) -> Option<&Problem> {
        match self {
            AcmeError::Protocol(problem) => Some(problem),
            _ => None,
        }
    }
}
