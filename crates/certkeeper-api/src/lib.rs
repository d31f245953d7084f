//! HTTP surface for CertKeeper
//!
//! Builds the axum router (admin CRUD + credentialed downloads), hosts it on
//! a TLS listener whose certificate hot-swaps via [`AppCert`], and falls
//! back to plain HTTP only in dev mode.

pub mod appcert;
pub mod download;
pub mod error;
pub mod handlers;
pub mod models;
pub mod validation;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use certkeeper_acme::AcmeClient;
use certkeeper_orders::OrderPipeline;
use certkeeper_storage::Storage;

pub use appcert::AppCert;
pub use error::ApiError;

/// Application state shared across handlers
pub struct AppState {
    pub storage: Storage,
    pub pipeline: Arc<OrderPipeline>,
    pub acme_prod: Arc<AcmeClient>,
    pub acme_staging: Arc<AcmeClient>,
    /// Loosens the HTTPS gate and permits the plain-HTTP listener
    pub dev_mode: bool,
    /// Whether the serving listener terminates TLS; downloads check this
    pub is_https: bool,
}

/// Build the full router
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/health", get(handlers::health_check))
        // private keys
        .route(
            "/api/v1/keys",
            get(handlers::list_keys).post(handlers::create_key),
        )
        .route("/api/v1/keys/available", get(handlers::list_available_keys))
        .route(
            "/api/v1/keys/{id}",
            get(handlers::get_key)
                .put(handlers::update_key)
                .delete(handlers::delete_key),
        )
        .route("/api/v1/keys/{id}/apikey", post(handlers::stage_key_api_key))
        .route(
            "/api/v1/keys/{id}/apikey/promote",
            post(handlers::promote_key_api_key),
        )
        // acme accounts
        .route(
            "/api/v1/accounts",
            get(handlers::list_accounts).post(handlers::create_account),
        )
        .route(
            "/api/v1/accounts/{id}",
            get(handlers::get_account)
                .put(handlers::update_account)
                .delete(handlers::delete_account),
        )
        .route(
            "/api/v1/accounts/{id}/register",
            post(handlers::register_account),
        )
        .route(
            "/api/v1/accounts/{id}/deactivate",
            post(handlers::deactivate_account),
        )
        .route(
            "/api/v1/accounts/{id}/key-change",
            post(handlers::change_account_key),
        )
        // certificates
        .route(
            "/api/v1/certificates",
            get(handlers::list_certificates).post(handlers::create_certificate),
        )
        .route(
            "/api/v1/certificates/{id}",
            get(handlers::get_certificate)
                .put(handlers::update_certificate)
                .delete(handlers::delete_certificate),
        )
        .route(
            "/api/v1/certificates/{id}/apikey",
            post(handlers::stage_certificate_api_key),
        )
        .route(
            "/api/v1/certificates/{id}/apikey/promote",
            post(handlers::promote_certificate_api_key),
        )
        // orders
        .route(
            "/api/v1/certificates/{id}/orders",
            get(handlers::list_cert_orders).post(handlers::place_order),
        )
        .route(
            "/api/v1/certificates/{certId}/orders/{orderId}/retry",
            post(handlers::retry_order),
        )
        .route(
            "/api/v1/certificates/{certId}/orders/{orderId}/revoke",
            post(handlers::revoke_order),
        )
        // credentialed downloads (header capability)
        .route("/api/v1/download/cert/{name}", get(download::download_cert))
        .route(
            "/api/v1/download/privatekey/{name}",
            get(download::download_private_key),
        )
        .route(
            "/api/v1/download/certkey/{name}",
            get(download::download_certkey),
        )
        .route(
            "/api/v1/download/rootchain/{name}",
            get(download::download_rootchain),
        )
        // legacy URL-capability downloads
        .route(
            "/legacy/cert/{name}/{apiKey}",
            get(download::legacy_download_cert),
        )
        .route(
            "/legacy/privatekey/{name}/{apiKey}",
            get(download::legacy_download_private_key),
        )
        .route(
            "/legacy/certkey/{name}/{apiKey}",
            get(download::legacy_download_certkey),
        )
        .route(
            "/legacy/rootchain/{name}/{apiKey}",
            get(download::legacy_download_rootchain),
        )
        .with_state(state);

    api.layer(TraceLayer::new_for_http())
}

/// Serve over TLS with the hot-swappable listener certificate
pub async fn serve_https(
    router: Router,
    addr: SocketAddr,
    rustls: axum_server::tls_rustls::RustlsConfig,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!("api listening on https://{addr}");

    let handle = axum_server::Handle::new();
    let drain_handle = handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        // drain in-flight requests with a bounded grace period
        drain_handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
    });

    axum_server::bind_rustls(addr, rustls)
        .handle(handle)
        .serve(router.into_make_service())
        .await
}

/// Plain HTTP listener; only reachable through dev mode
pub async fn serve_dev_http(
    router: Router,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!("api listening on http://{addr} (dev mode)");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}
