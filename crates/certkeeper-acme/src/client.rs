//! The ACME client: directory discovery, nonce handling and signed requests

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};

use certkeeper_crypto::{sign_jws, PrivateKey};

use crate::error::AcmeError;
use crate::nonce::NoncePool;
use crate::problem::Problem;
use crate::types::{Account, Authorization, Challenge, Directory, Identifier, Order};

const REPLAY_NONCE: &str = "replay-nonce";
const JOSE_JSON: &str = "application/jose+json";
const PEM_CHAIN: &str = "application/pem-certificate-chain";

/// Identifies which key signs a request and how it is referenced in the
/// protected header: `jwk` for account creation / rollover inner JWS, `kid`
/// for everything else.
pub struct AccountSigner<'a> {
    key: &'a PrivateKey,
    kid: Option<&'a str>,
}

impl<'a> AccountSigner<'a> {
    /// Sign with the public JWK embedded (newAccount)
    pub fn with_jwk(key: &'a PrivateKey) -> Self {
        Self { key, kid: None }
    }

    /// Sign referencing the server-assigned account URL
    pub fn with_kid(key: &'a PrivateKey, kid: &'a str) -> Self {
        Self { key, kid: Some(kid) }
    }
}

/// One client per ACME directory URL
pub struct AcmeClient {
    http: reqwest::Client,
    directory_url: String,
    directory: Directory,
    nonces: NoncePool,
}

struct AcmeResponse {
    location: Option<String>,
    body: Vec<u8>,
}

impl AcmeResponse {
    fn json<T: DeserializeOwned>(&self) -> Result<T, AcmeError> {
        serde_json::from_slice(&self.body).map_err(|e| {
            AcmeError::MalformedResponse(format!("undecodable response body: {e}"))
        })
    }

    fn text(&self) -> Result<String, AcmeError> {
        String::from_utf8(self.body.clone())
            .map_err(|_| AcmeError::MalformedResponse("response body is not utf-8".to_string()))
    }
}

impl AcmeClient {
    /// Create a client and fetch the directory document
    pub async fn connect(directory_url: impl Into<String>) -> Result<Self, AcmeError> {
        let directory_url = directory_url.into();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let response = http.get(&directory_url).send().await?;
        if !response.status().is_success() {
            return Err(AcmeError::MalformedResponse(format!(
                "directory fetch returned http {}",
                response.status()
            )));
        }
        let directory: Directory = response.json().await?;

        debug!(directory = %directory_url, "acme directory fetched");

        Ok(Self {
            http,
            directory_url,
            directory,
            nonces: NoncePool::new(),
        })
    }

    /// Build a client over an already-fetched directory document. Used by
    /// tests and tooling that must not touch the network at construction.
    pub fn with_directory(
        directory_url: impl Into<String>,
        directory: Directory,
    ) -> Result<Self, AcmeError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            directory_url: directory_url.into(),
            directory,
            nonces: NoncePool::new(),
        })
    }

    /// The directory this client talks to
    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Register a new account (or fetch the existing one for this key).
    /// Returns the server-assigned account URL (`kid`) and the account body.
    pub async fn new_account(
        &self,
        key: &PrivateKey,
        contact_email: Option<&str>,
        accept_tos: bool,
    ) -> Result<(String, Account), AcmeError> {
        let mut payload = json!({ "termsOfServiceAgreed": accept_tos });
        if let Some(email) = contact_email.filter(|e| !e.is_empty()) {
            payload["contact"] = json!([format!("mailto:{email}")]);
        }

        // 201 = created, 200 = account already existed; both carry the kid
        let response = self
            .signed_post(
                &self.directory.new_account.clone(),
                Some(&payload),
                &AccountSigner::with_jwk(key),
                None,
            )
            .await?;

        let kid = response
            .location
            .clone()
            .ok_or_else(|| AcmeError::MalformedResponse("newAccount response missing Location".to_string()))?;
        let account = response.json()?;

        Ok((kid, account))
    }

    /// Update the account's contact list
    pub async fn update_account(
        &self,
        kid: &str,
        key: &PrivateKey,
        contact_email: Option<&str>,
    ) -> Result<Account, AcmeError> {
        let contact: Vec<String> = contact_email
            .filter(|e| !e.is_empty())
            .map(|e| vec![format!("mailto:{e}")])
            .unwrap_or_default();
        let payload = json!({ "contact": contact });

        let response = self
            .signed_post(kid, Some(&payload), &AccountSigner::with_kid(key, kid), None)
            .await?;
        response.json()
    }

    /// Deactivate the account; the server refuses all further requests for it
    pub async fn deactivate_account(
        &self,
        kid: &str,
        key: &PrivateKey,
    ) -> Result<Account, AcmeError> {
        let payload = json!({ "status": "deactivated" });
        let response = self
            .signed_post(kid, Some(&payload), &AccountSigner::with_kid(key, kid), None)
            .await?;
        response.json()
    }

    /// Account key rollover (RFC 8555 section 7.3.5): the inner JWS is signed
    /// by the new key (jwk, no nonce) over `{account, oldKey}`, the outer by
    /// the current account key.
    pub async fn rollover_key(
        &self,
        kid: &str,
        old_key: &PrivateKey,
        new_key: &PrivateKey,
    ) -> Result<(), AcmeError> {
        let url = self.directory.key_change.clone().ok_or_else(|| {
            AcmeError::MalformedResponse("directory has no keyChange endpoint".to_string())
        })?;

        let inner_protected = json!({
            "alg": new_key.algorithm()?.jws_alg(),
            "jwk": new_key.public_jwk()?,
            "url": url,
        });
        let inner_payload = json!({
            "account": kid,
            "oldKey": old_key.public_jwk()?,
        });
        let inner = sign_jws(new_key, &inner_protected, inner_payload.to_string().as_bytes())?;

        let outer_payload = serde_json::to_value(&inner)
            .map_err(|e| AcmeError::MalformedResponse(format!("inner jws serialization: {e}")))?;

        self.signed_post(
            &url,
            Some(&outer_payload),
            &AccountSigner::with_kid(old_key, kid),
            None,
        )
        .await?;

        Ok(())
    }

    /// Place a new order for the given dns identifiers. Returns the order URL
    /// (`Location`) and the order body.
    pub async fn new_order(
        &self,
        kid: &str,
        key: &PrivateKey,
        dns_identifiers: &[String],
    ) -> Result<(String, Order), AcmeError> {
        let identifiers: Vec<Identifier> = dns_identifiers
            .iter()
            .map(|value| Identifier::dns(value.clone()))
            .collect();
        let payload = json!({ "identifiers": identifiers });

        let response = self
            .signed_post(
                &self.directory.new_order.clone(),
                Some(&payload),
                &AccountSigner::with_kid(key, kid),
                None,
            )
            .await?;

        let location = response
            .location
            .clone()
            .ok_or_else(|| AcmeError::MalformedResponse("newOrder response missing Location".to_string()))?;
        let order = response.json()?;

        Ok((location, order))
    }

    /// Fetch an order by its URL (POST-as-GET)
    pub async fn get_order(
        &self,
        order_url: &str,
        kid: &str,
        key: &PrivateKey,
    ) -> Result<Order, AcmeError> {
        let response = self
            .signed_post(order_url, None, &AccountSigner::with_kid(key, kid), None)
            .await?;
        response.json()
    }

    /// Fetch an authorization by its URL (POST-as-GET)
    pub async fn get_authorization(
        &self,
        authz_url: &str,
        kid: &str,
        key: &PrivateKey,
    ) -> Result<Authorization, AcmeError> {
        let response = self
            .signed_post(authz_url, None, &AccountSigner::with_kid(key, kid), None)
            .await?;
        response.json()
    }

    /// Tell the server the challenge response is in place; the empty object
    /// payload triggers validation.
    pub async fn post_challenge(
        &self,
        challenge_url: &str,
        kid: &str,
        key: &PrivateKey,
    ) -> Result<Challenge, AcmeError> {
        let payload = json!({});
        let response = self
            .signed_post(
                challenge_url,
                Some(&payload),
                &AccountSigner::with_kid(key, kid),
                None,
            )
            .await?;
        response.json()
    }

    /// Submit the CSR to finalize a ready order
    pub async fn finalize(
        &self,
        finalize_url: &str,
        kid: &str,
        key: &PrivateKey,
        csr_der: &[u8],
    ) -> Result<Order, AcmeError> {
        let payload = json!({ "csr": URL_SAFE_NO_PAD.encode(csr_der) });
        let response = self
            .signed_post(
                finalize_url,
                Some(&payload),
                &AccountSigner::with_kid(key, kid),
                None,
            )
            .await?;
        response.json()
    }

    /// Download the issued certificate chain as PEM
    pub async fn download_certificate(
        &self,
        certificate_url: &str,
        kid: &str,
        key: &PrivateKey,
    ) -> Result<String, AcmeError> {
        let response = self
            .signed_post(
                certificate_url,
                None,
                &AccountSigner::with_kid(key, kid),
                Some(PEM_CHAIN),
            )
            .await?;
        response.text()
    }

    /// Revoke a certificate by DER, with an RFC 5280 reason code. The caller
    /// validates the reason code before this is reached.
    pub async fn revoke_certificate(
        &self,
        kid: &str,
        key: &PrivateKey,
        cert_der: &[u8],
        reason: u8,
    ) -> Result<(), AcmeError> {
        let url = self.directory.revoke_cert.clone().ok_or_else(|| {
            AcmeError::MalformedResponse("directory has no revokeCert endpoint".to_string())
        })?;

        let payload = json!({
            "certificate": URL_SAFE_NO_PAD.encode(cert_der),
            "reason": reason,
        });
        self.signed_post(&url, Some(&payload), &AccountSigner::with_kid(key, kid), None)
            .await?;
        Ok(())
    }

    /// Signed POST with the one-shot badNonce recovery: on a badNonce
    /// rejection, fetch a fresh nonce from `newNonce` and retry exactly once.
    async fn signed_post(
        &self,
        url: &str,
        payload: Option<&serde_json::Value>,
        signer: &AccountSigner<'_>,
        accept: Option<&str>,
    ) -> Result<AcmeResponse, AcmeError> {
        let nonce = match self.nonces.take() {
            Some(nonce) => nonce,
            None => self.fetch_new_nonce().await?,
        };

        match self.signed_post_once(url, payload, signer, nonce, accept).await {
            Err(AcmeError::Protocol(problem)) if problem.is_bad_nonce() => {
                warn!(url, "acme server rejected nonce, retrying with a fresh one");
                let fresh = self.fetch_new_nonce().await?;
                match self.signed_post_once(url, payload, signer, fresh, accept).await {
                    Err(AcmeError::Protocol(problem)) if problem.is_bad_nonce() => {
                        Err(AcmeError::BadNonceExhausted)
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn signed_post_once(
        &self,
        url: &str,
        payload: Option<&serde_json::Value>,
        signer: &AccountSigner<'_>,
        nonce: String,
        accept: Option<&str>,
    ) -> Result<AcmeResponse, AcmeError> {
        let mut protected = json!({
            "alg": signer.key.algorithm()?.jws_alg(),
            "nonce": nonce,
            "url": url,
        });
        match signer.kid {
            Some(kid) => protected["kid"] = json!(kid),
            None => protected["jwk"] = signer.key.public_jwk()?,
        }

        let payload_bytes = match payload {
            Some(value) => value.to_string().into_bytes(),
            None => Vec::new(),
        };
        let jws = sign_jws(signer.key, &protected, &payload_bytes)?;
        let body = serde_json::to_vec(&jws)
            .map_err(|e| AcmeError::MalformedResponse(format!("jws serialization: {e}")))?;

        let mut request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, JOSE_JSON)
            .body(body);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }

        let response = request.send().await?;

        // every response refills the pool, error responses included
        if let Some(nonce) = response
            .headers()
            .get(REPLAY_NONCE)
            .and_then(|v| v.to_str().ok())
        {
            self.nonces.store(nonce.to_string());
        }

        let status = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response.bytes().await?.to_vec();

        if status.is_success() {
            return Ok(AcmeResponse { location, body });
        }

        match serde_json::from_slice::<Problem>(&body) {
            Ok(mut problem) => {
                if problem.status.is_none() {
                    problem.status = Some(status.as_u16());
                }
                Err(AcmeError::Protocol(problem))
            }
            Err(_) => Err(AcmeError::MalformedResponse(format!(
                "http {} with undecodable problem body: {}",
                status,
                String::from_utf8_lossy(&body)
            ))),
        }
    }

    /// HEAD the newNonce endpoint for a fresh nonce
    async fn fetch_new_nonce(&self) -> Result<String, AcmeError> {
        let response = self.http.head(&self.directory.new_nonce).send().await?;
        response
            .headers()
            .get(REPLAY_NONCE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                AcmeError::MalformedResponse("newNonce response missing Replay-Nonce".to_string())
            })
    }
}
