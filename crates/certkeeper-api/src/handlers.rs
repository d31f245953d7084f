//! Admin API handlers: keys, accounts, certificates and order actions

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::info;

use certkeeper_acme::AcmeClient;
use certkeeper_crypto::{generate_api_key, KeyAlgorithm, PrivateKey};
use certkeeper_orders::Priority;
use certkeeper_storage::entities::{acme_account, acme_order, certificate, private_key};
use certkeeper_storage::{CertificateUpdate, NewAccount, NewCertificate, NewKey};

use crate::error::ApiError;
use crate::models::{
    CreateAccountRequest, CreateCertificateRequest, CreateKeyRequest, KeyChangeRequest,
    RevokeRequest, UpdateAccountRequest, UpdateCertificateRequest, UpdateKeyRequest,
};
use crate::validation;
use crate::AppState;

pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

fn client_for<'a>(state: &'a AppState, account: &acme_account::Model) -> &'a Arc<AcmeClient> {
    if account.directory == "staging" {
        &state.acme_staging
    } else {
        &state.acme_prod
    }
}

fn require_kid(account: &acme_account::Model) -> Result<String, ApiError> {
    account.kid.clone().ok_or_else(|| {
        ApiError::Validation("account is not registered with the acme server".to_string())
    })
}

// -- private keys

pub async fn list_keys(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<private_key::Model>>, ApiError> {
    Ok(Json(state.storage.list_keys().await?))
}

/// List key ids not yet bound to an account or certificate
pub async fn list_available_keys(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<i64>>, ApiError> {
    Ok(Json(state.storage.get_available_key_ids().await?))
}

pub async fn create_key(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<private_key::Model>), ApiError> {
    validation::valid_name(&payload.name)?;

    let (pem, algorithm) = match (payload.pem, payload.algorithm) {
        // import: detect the algorithm from the material, honoring a
        // declared one when present
        (Some(pem), declared) => {
            let key = match declared.as_deref() {
                Some(value) => {
                    let algorithm = KeyAlgorithm::from_value(value)?;
                    PrivateKey::from_pem_with_algorithm(&pem, algorithm)?
                }
                None => PrivateKey::from_pem(&pem)?,
            };
            (pem, key.algorithm()?)
        }
        // generate
        (None, Some(value)) => {
            let algorithm = KeyAlgorithm::from_value(&value)?;
            let key = PrivateKey::generate(algorithm)?;
            (key.to_pem()?, algorithm)
        }
        (None, None) => {
            return Err(ApiError::Validation(
                "either pem or algorithm is required".to_string(),
            ))
        }
    };

    let model = state
        .storage
        .create_key(NewKey {
            name: payload.name,
            description: payload.description,
            algorithm: algorithm.value().to_string(),
            pem,
            api_key: generate_api_key(),
        })
        .await?;

    info!(key = %model.name, algorithm = %model.algorithm, "private key created");
    Ok((StatusCode::CREATED, Json(model)))
}

pub async fn get_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<private_key::Model>, ApiError> {
    Ok(Json(state.storage.get_key(id).await?))
}

pub async fn update_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateKeyRequest>,
) -> Result<Json<private_key::Model>, ApiError> {
    if let Some(name) = &payload.name {
        validation::valid_name(name)?;
    }
    Ok(Json(
        state
            .storage
            .update_key_info(id, payload.name, payload.description)
            .await?,
    ))
}

pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.storage.delete_key(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn stage_key_api_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<private_key::Model>, ApiError> {
    Ok(Json(
        state
            .storage
            .stage_key_api_key(id, generate_api_key())
            .await?,
    ))
}

pub async fn promote_key_api_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<private_key::Model>, ApiError> {
    Ok(Json(state.storage.promote_key_api_key(id).await?))
}

// -- acme accounts

pub async fn list_accounts(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<acme_account::Model>>, ApiError> {
    Ok(Json(state.storage.list_accounts().await?))
}

pub async fn create_account(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateAccountRequest>,
) -> Result<(StatusCode, Json<acme_account::Model>), ApiError> {
    validation::valid_name(&payload.name)?;
    validation::valid_directory(&payload.directory)?;
    if let Some(email) = &payload.email {
        validation::valid_email_or_blank(email)?;
    }

    let model = state
        .storage
        .create_account(NewAccount {
            name: payload.name,
            description: payload.description,
            email: payload.email,
            accepted_tos: payload.accept_tos,
            private_key_id: payload.private_key_id,
            directory: payload.directory,
        })
        .await?;

    info!(account = %model.name, directory = %model.directory, "acme account created");
    Ok((StatusCode::CREATED, Json(model)))
}

pub async fn get_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<acme_account::Model>, ApiError> {
    Ok(Json(state.storage.get_account(id).await?))
}

pub async fn update_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateAccountRequest>,
) -> Result<Json<acme_account::Model>, ApiError> {
    if let Some(name) = &payload.name {
        validation::valid_name(name)?;
    }
    if let Some(email) = &payload.email {
        validation::valid_email_or_blank(email)?;
    }

    let account = state.storage.get_account(id).await?;

    // a registered account pushes contact changes to the server too
    if let (Some(kid), Some(email)) = (&account.kid, &payload.email) {
        let key_row = state.storage.get_key(account.private_key_id).await?;
        let key = PrivateKey::from_pem(&key_row.pem)?;
        client_for(&state, &account)
            .update_account(kid, &key, Some(email))
            .await?;
    }

    Ok(Json(
        state
            .storage
            .update_account_info(id, payload.name, payload.description, payload.email)
            .await?,
    ))
}

pub async fn delete_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.storage.delete_account(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Register the account with its ACME server; sets `kid` and status
pub async fn register_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<acme_account::Model>, ApiError> {
    let account = state.storage.get_account(id).await?;
    if !account.accepted_tos {
        return Err(ApiError::Validation(
            "terms of service must be accepted before registering".to_string(),
        ));
    }

    let key_row = state.storage.get_key(account.private_key_id).await?;
    let key = PrivateKey::from_pem(&key_row.pem)?;

    let (kid, remote) = client_for(&state, &account)
        .new_account(&key, account.email.as_deref(), account.accepted_tos)
        .await?;

    let model = state
        .storage
        .set_account_registration(id, &kid, &remote.status)
        .await?;
    info!(account = %model.name, %kid, "acme account registered");
    Ok(Json(model))
}

pub async fn deactivate_account(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<acme_account::Model>, ApiError> {
    let account = state.storage.get_account(id).await?;
    let kid = require_kid(&account)?;

    let key_row = state.storage.get_key(account.private_key_id).await?;
    let key = PrivateKey::from_pem(&key_row.pem)?;

    let remote = client_for(&state, &account)
        .deactivate_account(&kid, &key)
        .await?;

    Ok(Json(
        state.storage.set_account_status(id, &remote.status).await?,
    ))
}

/// RFC 8555 section 7.3.5 key rollover, then swap the stored key reference
pub async fn change_account_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<KeyChangeRequest>,
) -> Result<Json<acme_account::Model>, ApiError> {
    let account = state.storage.get_account(id).await?;
    let kid = require_kid(&account)?;

    let old_key_row = state.storage.get_key(account.private_key_id).await?;
    let old_key = PrivateKey::from_pem(&old_key_row.pem)?;
    let new_key_row = state.storage.get_key(payload.new_private_key_id).await?;
    let new_key = PrivateKey::from_pem(&new_key_row.pem)?;

    client_for(&state, &account)
        .rollover_key(&kid, &old_key, &new_key)
        .await?;

    let model = state
        .storage
        .set_account_key(id, payload.new_private_key_id)
        .await?;
    info!(account = %model.name, "acme account key rolled over");
    Ok(Json(model))
}

// -- certificates

pub async fn list_certificates(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<certificate::Model>>, ApiError> {
    Ok(Json(state.storage.list_certificates().await?))
}

pub async fn create_certificate(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateCertificateRequest>,
) -> Result<(StatusCode, Json<certificate::Model>), ApiError> {
    validation::valid_name(&payload.name)?;
    if payload.subject.is_empty() {
        return Err(ApiError::Validation("subject is required".to_string()));
    }

    let model = state
        .storage
        .create_certificate(NewCertificate {
            name: payload.name,
            description: payload.description,
            account_id: payload.account_id,
            private_key_id: payload.private_key_id,
            subject: payload.subject,
            subject_alts: payload.subject_alts,
            api_key: generate_api_key(),
            api_key_via_url: payload.api_key_via_url,
            post_processing_command: payload.post_processing_command,
        })
        .await?;

    info!(cert = %model.name, subject = %model.subject, "certificate created");
    Ok((StatusCode::CREATED, Json(model)))
}

pub async fn get_certificate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<certificate::Model>, ApiError> {
    Ok(Json(state.storage.get_certificate(id).await?))
}

pub async fn update_certificate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateCertificateRequest>,
) -> Result<Json<certificate::Model>, ApiError> {
    if let Some(name) = &payload.name {
        validation::valid_name(name)?;
    }

    Ok(Json(
        state
            .storage
            .update_certificate(
                id,
                CertificateUpdate {
                    name: payload.name,
                    description: payload.description,
                    private_key_id: payload.private_key_id,
                    subject_alts: payload.subject_alts,
                    api_key_via_url: payload.api_key_via_url,
                    post_processing_command: payload.post_processing_command,
                },
            )
            .await?,
    ))
}

pub async fn delete_certificate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.storage.delete_certificate(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn stage_certificate_api_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<certificate::Model>, ApiError> {
    Ok(Json(
        state
            .storage
            .stage_certificate_api_key(id, generate_api_key())
            .await?,
    ))
}

pub async fn promote_certificate_api_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<certificate::Model>, ApiError> {
    Ok(Json(state.storage.promote_certificate_api_key(id).await?))
}

// -- orders

pub async fn list_cert_orders(
    State(state): State<Arc<AppState>>,
    Path(cert_id): Path<i64>,
) -> Result<Json<Vec<acme_order::Model>>, ApiError> {
    // 404 for an unknown cert rather than an empty list
    state.storage.get_certificate(cert_id).await?;
    Ok(Json(state.storage.get_cert_orders(cert_id).await?))
}

/// Place a brand-new order for the certificate, at operator priority
pub async fn place_order(
    State(state): State<Arc<AppState>>,
    Path(cert_id): Path<i64>,
) -> Result<(StatusCode, Json<acme_order::Model>), ApiError> {
    let order_id = state.pipeline.place_new_order(cert_id, Priority::High).await?;
    let order = state.storage.get_order(order_id).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// Re-queue an existing, non-terminal order
pub async fn retry_order(
    State(state): State<Arc<AppState>>,
    Path((cert_id, order_id)): Path<(i64, i64)>,
) -> Result<StatusCode, ApiError> {
    let order = order_belonging_to_cert(&state, cert_id, order_id).await?;
    if order.is_terminal() {
        return Err(ApiError::Validation(
            "cannot retry an order in a final state".to_string(),
        ));
    }

    state.pipeline.submit(order_id, cert_id, Priority::High);
    Ok(StatusCode::ACCEPTED)
}

/// Revoke the order's certificate with the given RFC 5280 reason code.
/// Validation happens before any ACME traffic.
pub async fn revoke_order(
    State(state): State<Arc<AppState>>,
    Path((cert_id, order_id)): Path<(i64, i64)>,
    Json(payload): Json<RevokeRequest>,
) -> Result<Json<acme_order::Model>, ApiError> {
    validation::valid_revocation_reason(payload.reason)?;

    let order = order_belonging_to_cert(&state, cert_id, order_id).await?;

    // only a currently valid, unrevoked, unexpired order can be revoked
    let now = chrono::Utc::now().timestamp();
    let unexpired = order.valid_to.is_some_and(|valid_to| now < valid_to);
    if order.status != "valid" || order.known_revoked || !unexpired {
        return Err(ApiError::Validation(
            "order is not in a revocable state".to_string(),
        ));
    }
    let pem = order
        .pem
        .as_deref()
        .ok_or_else(|| ApiError::Validation("order has no certificate to revoke".to_string()))?;

    let cert = state.storage.get_certificate(cert_id).await?;
    let account = state.storage.get_account(cert.account_id).await?;
    let kid = require_kid(&account)?;
    let key_row = state.storage.get_key(account.private_key_id).await?;
    let key = PrivateKey::from_pem(&key_row.pem)?;

    let cert_der = leaf_der(pem)?;
    client_for(&state, &account)
        .revoke_certificate(&kid, &key, &cert_der, payload.reason)
        .await?;

    let model = state.storage.mark_order_revoked(order_id).await?;
    info!(order_id, cert = %cert.name, reason = payload.reason, "certificate revoked");
    Ok(Json(model))
}

async fn order_belonging_to_cert(
    state: &AppState,
    cert_id: i64,
    order_id: i64,
) -> Result<acme_order::Model, ApiError> {
    let order = state.storage.get_order(order_id).await?;
    if order.certificate_id != cert_id {
        return Err(ApiError::Validation(
            "order does not belong to this certificate".to_string(),
        ));
    }
    Ok(order)
}

/// DER bytes of the first certificate in a PEM chain
fn leaf_der(chain_pem: &str) -> Result<Vec<u8>, ApiError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(chain_pem.as_bytes())
        .map_err(|e| ApiError::Internal(format!("stored pem unreadable: {e}")))?;
    Ok(pem.contents)
}
