//! Hot-swappable TLS certificate for the API listener
//!
//! The listener serves whatever pair is currently loaded into the shared
//! `RustlsConfig`; reads are unbounded and lock-free from the handshake
//! path, writes happen only when the refresher finds a newer pair in
//! storage. At startup a missing or broken stored pair falls back to a
//! self-signed ECDSA P-256 certificate so the API can always come up.

use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use certkeeper_orders::leaf_validity;
use certkeeper_storage::Storage;

const SELF_SIGNED_VALID_DAYS: i64 = 180;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum AppCertError {
    #[error("storage error while loading listener certificate: {0}")]
    Storage(#[from] certkeeper_storage::StorageError),

    #[error("listener certificate unusable: {0}")]
    BadPair(String),
}

pub struct AppCert {
    rustls: RustlsConfig,
    storage: Storage,
    key_name: String,
    cert_name: String,
    /// chain currently served; drives the refresh cadence
    current_chain: std::sync::Mutex<String>,
}

impl AppCert {
    /// Load the configured pair from storage, or synthesize a temporary
    /// self-signed certificate when that fails
    pub async fn load(
        storage: Storage,
        key_name: &str,
        cert_name: &str,
        hostname: &str,
    ) -> Result<Self, AppCertError> {
        let (chain, key) = match Self::pair_from_storage(&storage, key_name, cert_name).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("stored listener certificate unavailable ({e}); using a self-signed pair");
                self_signed_pair(hostname)?
            }
        };

        let rustls = RustlsConfig::from_pem(chain.clone().into_bytes(), key.into_bytes())
            .await
            .map_err(|e| AppCertError::BadPair(e.to_string()))?;

        Ok(Self {
            rustls,
            storage,
            key_name: key_name.to_string(),
            cert_name: cert_name.to_string(),
            current_chain: std::sync::Mutex::new(chain),
        })
    }

    /// Shared handle for the TLS listener; reloads through `self` become
    /// visible to it atomically
    pub fn rustls_config(&self) -> RustlsConfig {
        self.rustls.clone()
    }

    async fn pair_from_storage(
        storage: &Storage,
        key_name: &str,
        cert_name: &str,
    ) -> Result<(String, String), AppCertError> {
        let key = storage.get_key_by_name(key_name).await?;
        let chain = storage.get_cert_pem_by_name(cert_name).await?;
        Ok((chain, key.pem))
    }

    /// Background refresher: wakes on a cadence scaled by remaining
    /// validity and swaps in a newer stored pair when one exists
    pub fn spawn_refresher(self, shutdown: CancellationToken) {
        tokio::spawn(async move {
            loop {
                let sleep_for = self.refresh_interval();
                debug!(
                    sleep_days = sleep_for.as_secs() / 86_400,
                    "listener certificate refresher sleeping"
                );

                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(sleep_for) => {}
                }

                match Self::pair_from_storage(&self.storage, &self.key_name, &self.cert_name).await
                {
                    Ok((chain, key)) => {
                        match self
                            .rustls
                            .reload_from_pem(chain.clone().into_bytes(), key.into_bytes())
                            .await
                        {
                            Ok(()) => {
                                if let Ok(mut current) = self.current_chain.lock() {
                                    *current = chain;
                                }
                                info!("listener certificate refreshed from storage");
                            }
                            Err(e) => error!("failed to reload listener certificate: {e}"),
                        }
                    }
                    Err(e) => {
                        // keep serving the current pair
                        warn!("listener certificate refresh found nothing usable: {e}");
                    }
                }
            }
        });
    }

    /// >45 days left: weekly. 35-45 days: every other day. Less: daily.
    fn refresh_interval(&self) -> Duration {
        let chain = match self.current_chain.lock() {
            Ok(chain) => chain.clone(),
            Err(_) => return DAY,
        };

        let remaining_days = match leaf_validity(&chain) {
            Ok((_, not_after)) => {
                let now = chrono::Utc::now().timestamp();
                (not_after - now) / 86_400
            }
            Err(_) => 0,
        };

        if remaining_days > 45 {
            7 * DAY
        } else if remaining_days > 35 {
            2 * DAY
        } else {
            DAY
        }
    }
}

/// Temporary self-signed ECDSA P-256 pair, valid 180 days
fn self_signed_pair(hostname: &str) -> Result<(String, String), AppCertError> {
    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| AppCertError::BadPair(e.to_string()))?;

    let mut names = vec!["localhost".to_string()];
    if !hostname.is_empty() && hostname != "localhost" {
        names.push(hostname.to_string());
    }

    let mut params = rcgen::CertificateParams::new(names)
        .map_err(|e| AppCertError::BadPair(e.to_string()))?;

    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, "CertKeeper");
    params.distinguished_name = dn;

    let now = chrono::Utc::now().timestamp();
    params.not_before = time::OffsetDateTime::from_unix_timestamp(now)
        .map_err(|e| AppCertError::BadPair(e.to_string()))?;
    params.not_after =
        time::OffsetDateTime::from_unix_timestamp(now + SELF_SIGNED_VALID_DAYS * 86_400)
            .map_err(|e| AppCertError::BadPair(e.to_string()))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| AppCertError::BadPair(e.to_string()))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install_crypto_provider() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }

    #[test]
    fn test_self_signed_pair_shape() {
        let (chain, key) = self_signed_pair("certs.example.com").unwrap();
        assert!(chain.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(key.contains("PRIVATE KEY"));

        let (not_before, not_after) = leaf_validity(&chain).unwrap();
        let lifetime_days = (not_after - not_before) / 86_400;
        assert_eq!(lifetime_days, SELF_SIGNED_VALID_DAYS);
    }

    #[tokio::test]
    async fn test_load_falls_back_to_self_signed() {
        install_crypto_provider();
        let storage = Storage::connect("sqlite::memory:").await.unwrap();
        // nothing seeded: storage lookup fails, fallback kicks in
        let appcert = AppCert::load(storage, "missing-key", "missing-cert", "localhost")
            .await
            .unwrap();
        // a usable rustls config exists either way
        let _ = appcert.rustls_config();
        assert!(appcert.refresh_interval() >= DAY);
    }

    #[tokio::test]
    async fn test_refresh_interval_scales_with_validity() {
        install_crypto_provider();
        let storage = Storage::connect("sqlite::memory:").await.unwrap();
        let appcert = AppCert::load(storage, "k", "c", "localhost").await.unwrap();

        // fresh self-signed pair has ~180 days left -> weekly cadence
        assert_eq!(appcert.refresh_interval(), 7 * DAY);
    }
}
