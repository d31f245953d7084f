//! Credentialed PEM downloads
//!
//! Four retrieval modes keyed by name, each unlocked by a capability token
//! presented in the `X-API-Key` header (`apikey` as fallback) or — only for
//! certificates with `api_key_via_url` — as a trailing URL segment on the
//! legacy routes. Disclosure requires a TLS channel unless the process runs
//! in dev mode. All capability comparisons are constant-time and every
//! refusal is a uniform `Unauthorized`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;
use tracing::debug;

use certkeeper_crypto::pem::chain_without_leaf;

use crate::error::ApiError;
use crate::AppState;

const PEM_CHAIN: &str = "application/pem-certificate-chain";
const PEM_FILE: &str = "application/x-pem-file";

/// `X-API-Key` preferred, `apikey` accepted as a fallback
fn api_key_from_headers(headers: &HeaderMap) -> Option<String> {
    for name in ["x-api-key", "apikey"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Constant-time capability check against the current token and, during
/// rotation, the staged one
fn capability_matches(presented: &str, current: &str, staged: Option<&str>) -> bool {
    let mut ok = presented.as_bytes().ct_eq(current.as_bytes()).unwrap_u8() == 1;
    if let Some(staged) = staged {
        ok |= presented.as_bytes().ct_eq(staged.as_bytes()).unwrap_u8() == 1;
    }
    ok
}

fn pem_response(content_type: &'static str, filename: String, body: String) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={filename}"),
            ),
        ],
        body,
    )
        .into_response()
}

/// The HTTPS gate runs before anything else so nothing is disclosed (or
/// even looked up) over plain HTTP outside dev mode
fn ensure_secure_channel(state: &AppState) -> Result<(), ApiError> {
    if !state.is_https && !state.dev_mode {
        return Err(ApiError::UnavailableHttp);
    }
    Ok(())
}

/// Fetch the chain PEM for a named certificate after checking its
/// capability. Returns the pem and the finalized key id of the order that
/// produced it.
async fn authorized_cert_pem(
    state: &AppState,
    name: &str,
    api_key: Option<String>,
    via_url: bool,
) -> Result<(String, Option<i64>), ApiError> {
    ensure_secure_channel(state)?;

    let Some(api_key) = api_key else {
        debug!(name, "download refused: blank api key");
        return Err(ApiError::Unauthorized);
    };

    let cert = state.storage.get_certificate_by_name(name).await?;

    if via_url && !cert.api_key_via_url {
        debug!(name, "download refused: api key via url disallowed");
        return Err(ApiError::Unauthorized);
    }

    if !capability_matches(&api_key, &cert.api_key, cert.api_key_new.as_deref()) {
        debug!(name, "download refused: wrong api key");
        return Err(ApiError::Unauthorized);
    }

    let (_, pem, finalized_key_id) = state.storage.get_cert_pem_by_id(cert.id).await?;
    Ok((pem, finalized_key_id))
}

/// Fetch a named private key's PEM after checking its capability
async fn authorized_key_pem(
    state: &AppState,
    name: &str,
    api_key: Option<String>,
    via_url: bool,
) -> Result<String, ApiError> {
    ensure_secure_channel(state)?;

    let Some(api_key) = api_key else {
        debug!(name, "key download refused: blank api key");
        return Err(ApiError::Unauthorized);
    };

    // keys carry no via-url grant; the capability must travel in a header
    if via_url {
        debug!(name, "key download refused: api key via url disallowed");
        return Err(ApiError::Unauthorized);
    }

    let key = state.storage.get_key_by_name(name).await?;
    if !capability_matches(&api_key, &key.api_key, key.api_key_new.as_deref()) {
        debug!(name, "key download refused: wrong api key");
        return Err(ApiError::Unauthorized);
    }

    Ok(key.pem)
}

/// Chain + key bundle: the capability is `<certApiKey>.<keyApiKey>`, the key
/// part checked against the order's finalized key
async fn authorized_certkey_pem(
    state: &AppState,
    name: &str,
    api_keys: Option<String>,
    via_url: bool,
) -> Result<String, ApiError> {
    ensure_secure_channel(state)?;

    let Some(api_keys) = api_keys else {
        return Err(ApiError::Unauthorized);
    };
    let Some((cert_api_key, key_api_key)) = split_joined_keys(&api_keys) else {
        return Err(ApiError::Unauthorized);
    };

    let (chain_pem, finalized_key_id) =
        authorized_cert_pem(state, name, Some(cert_api_key), via_url).await?;

    // a deleted or never-recorded key makes the bundle unservable
    let key_id = finalized_key_id.ok_or(ApiError::StorageGeneric)?;
    let key = state.storage.get_key(key_id).await?;
    if !capability_matches(&key_api_key, &key.api_key, key.api_key_new.as_deref()) {
        debug!(name, "certkey download refused: wrong key api key");
        return Err(ApiError::Unauthorized);
    }

    Ok(format!("{}\n{}", key.pem, chain_pem))
}

/// Exactly two tokens separated by one dot
fn split_joined_keys(joined: &str) -> Option<(String, String)> {
    let mut parts = joined.split('.');
    let cert_key = parts.next()?.to_string();
    let key_key = parts.next()?.to_string();
    if parts.next().is_some() || cert_key.is_empty() || key_key.is_empty() {
        return None;
    }
    Some((cert_key, key_key))
}

// -- header-credentialed handlers

pub async fn download_cert(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let api_key = api_key_from_headers(&headers);
    let (pem, _) = authorized_cert_pem(&state, &name, api_key, false).await?;
    Ok(pem_response(PEM_CHAIN, format!("{name}.cert.pem"), pem))
}

pub async fn download_private_key(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let api_key = api_key_from_headers(&headers);
    let pem = authorized_key_pem(&state, &name, api_key, false).await?;
    Ok(pem_response(PEM_FILE, format!("{name}.key.pem"), pem))
}

pub async fn download_certkey(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let api_key = api_key_from_headers(&headers);
    let pem = authorized_certkey_pem(&state, &name, api_key, false).await?;
    Ok(pem_response(PEM_FILE, format!("{name}.certkey.pem"), pem))
}

pub async fn download_rootchain(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let api_key = api_key_from_headers(&headers);
    let (pem, _) = authorized_cert_pem(&state, &name, api_key, false).await?;
    let rootchain = chain_without_leaf(&pem).ok_or(ApiError::NotFound)?;
    Ok(pem_response(
        PEM_CHAIN,
        format!("{name}.rootchain.pem"),
        rootchain,
    ))
}

// -- legacy URL-credentialed handlers (apiKeyViaUrl only)

pub async fn legacy_download_cert(
    State(state): State<Arc<AppState>>,
    Path((name, api_key)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let (pem, _) = authorized_cert_pem(&state, &name, Some(api_key), true).await?;
    Ok(pem_response(PEM_CHAIN, format!("{name}.cert.pem"), pem))
}

pub async fn legacy_download_private_key(
    State(state): State<Arc<AppState>>,
    Path((name, api_key)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let pem = authorized_key_pem(&state, &name, Some(api_key), true).await?;
    Ok(pem_response(PEM_FILE, format!("{name}.key.pem"), pem))
}

pub async fn legacy_download_certkey(
    State(state): State<Arc<AppState>>,
    Path((name, api_key)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let pem = authorized_certkey_pem(&state, &name, Some(api_key), true).await?;
    Ok(pem_response(PEM_FILE, format!("{name}.certkey.pem"), pem))
}

pub async fn legacy_download_rootchain(
    State(state): State<Arc<AppState>>,
    Path((name, api_key)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let (pem, _) = authorized_cert_pem(&state, &name, Some(api_key), true).await?;
    let rootchain = chain_without_leaf(&pem).ok_or(ApiError::NotFound)?;
    Ok(pem_response(
        PEM_CHAIN,
        format!("{name}.rootchain.pem"),
        rootchain,
    ))
}
