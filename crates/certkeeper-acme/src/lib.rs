//! ACME v2 protocol client (RFC 8555)
//!
//! One [`AcmeClient`] exists per directory URL. The client caches the
//! directory document and a bounded pool of replay nonces; every request is
//! a JWS-signed POST (`application/jose+json`), including the POST-as-GET
//! reads. Application-level retry policy lives with the caller — the client
//! itself only recovers `badNonce` rejections, exactly once per request.

mod client;
mod error;
mod nonce;
mod problem;
mod types;

pub use client::{AccountSigner, AcmeClient};
pub use error::AcmeError;
pub use problem::Problem;
pub use types::{
    Account, Authorization, AuthorizationStatus, Challenge, ChallengeStatus, Directory,
    Identifier, Order, OrderStatus,
};
