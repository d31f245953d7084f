//! Internal HTTP-01 challenge responder
//!
//! Keeps a shared `token -> keyAuthorization` map and serves it from a
//! lightweight listener at `/.well-known/acme-challenge/{token}`. The
//! listener lives for the life of the process and shuts down with the
//! process-wide cancellation token.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{ChallengeKind, ChallengeSolver, ProvisionReceipt, SolverError};

type TokenMap = Arc<RwLock<HashMap<String, String>>>;

/// HTTP-01 solver backed by the internal challenge listener
pub struct Http01Solver {
    tokens: TokenMap,
}

impl Http01Solver {
    pub fn new() -> Self {
        Self {
            tokens: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Bind the challenge listener and spawn its serve task. Returns the
    /// bound address (useful when the configured port is 0).
    pub async fn start(
        &self,
        port: u16,
        shutdown: CancellationToken,
    ) -> Result<SocketAddr, SolverError> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        let addr = listener.local_addr()?;

        let app = Router::new()
            .route("/.well-known/acme-challenge/{token}", get(serve_challenge))
            .with_state(self.tokens.clone());

        info!(%addr, "http-01 challenge responder listening");

        tokio::spawn(async move {
            let graceful = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned());
            if let Err(e) = graceful.await {
                error!("http-01 challenge responder failed: {e}");
            }
        });

        Ok(addr)
    }
}

impl Default for Http01Solver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ChallengeSolver for Http01Solver {
    fn kind(&self) -> ChallengeKind {
        ChallengeKind::Http01
    }

    async fn provision(
        &self,
        identifier: &str,
        token: &str,
        key_authorization: &str,
    ) -> Result<ProvisionReceipt, SolverError> {
        debug!(identifier, token, "provisioning http-01 challenge response");

        self.tokens
            .write()
            .map_err(|_| SolverError::Provider("http-01 token map poisoned".to_string()))?
            .insert(token.to_string(), key_authorization.to_string());

        // the listener is already live; insertion makes the response observable
        Ok(ProvisionReceipt {
            kind: ChallengeKind::Http01,
            identifier: identifier.to_string(),
            token: token.to_string(),
            dns_record: None,
        })
    }

    async fn cleanup(&self, receipt: &ProvisionReceipt) -> Result<(), SolverError> {
        debug!(token = %receipt.token, "removing http-01 challenge response");

        self.tokens
            .write()
            .map_err(|_| SolverError::Provider("http-01 token map poisoned".to_string()))?
            .remove(&receipt.token);

        Ok(())
    }
}

async fn serve_challenge(
    State(tokens): State<TokenMap>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    let key_authorization = tokens
        .read()
        .ok()
        .and_then(|map| map.get(&token).cloned());

    match key_authorization {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            body,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_provision_serve_cleanup() {
        let solver = Http01Solver::new();
        let shutdown = CancellationToken::new();
        let addr = solver.start(0, shutdown.clone()).await.unwrap();

        let receipt = solver
            .provision("example.com", "tok-123", "tok-123.thumb")
            .await
            .unwrap();

        let url = format!("http://{addr}/.well-known/acme-challenge/tok-123");
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .unwrap()
                .to_str()
                .unwrap(),
            "text/plain"
        );
        assert_eq!(response.text().await.unwrap(), "tok-123.thumb");

        solver.cleanup(&receipt).await.unwrap();
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), 404);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unknown_token_is_404() {
        let solver = Http01Solver::new();
        let shutdown = CancellationToken::new();
        let addr = solver.start(0, shutdown.clone()).await.unwrap();

        let url = format!("http://{addr}/.well-known/acme-challenge/nope");
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), 404);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_listener_stops_on_shutdown() {
        let solver = Http01Solver::new();
        let shutdown = CancellationToken::new();
        let addr = solver.start(0, shutdown.clone()).await.unwrap();

        shutdown.cancel();
        // give the serve task a moment to wind down
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let url = format!("http://{addr}/.well-known/acme-challenge/x");
        assert!(reqwest::get(&url).await.is_err());
    }
}
