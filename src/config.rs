//! Configuration loading
//!
//! Settings live in a JSON file; a missing file yields the defaults so a
//! fresh install comes up in a usable (dev-leaning) state.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const LETS_ENCRYPT_PROD: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Lifts the HTTPS download gate and serves the API over plain HTTP
    pub dev_mode: bool,
    pub hostname: String,
    /// Plain-HTTP port (dev mode only)
    pub api_port: u16,
    /// TLS port for normal operation
    pub https_port: u16,
    pub db_file: String,
    /// Key and certificate names the API listener serves itself with
    pub private_key_name: String,
    pub certificate_name: String,
    pub acme: AcmeSection,
    pub http01_internal: Http01Section,
    pub dns01_cloudflare: Dns01Section,
    pub orders: OrdersSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dev_mode: false,
            hostname: "localhost".to_string(),
            api_port: 4050,
            https_port: 4055,
            db_file: "./data/certkeeper.db".to_string(),
            private_key_name: "certkeeper".to_string(),
            certificate_name: "certkeeper".to_string(),
            acme: AcmeSection::default(),
            http01_internal: Http01Section::default(),
            dns01_cloudflare: Dns01Section::default(),
            orders: OrdersSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AcmeSection {
    pub prod_dir_url: String,
    pub staging_dir_url: String,
}

impl Default for AcmeSection {
    fn default() -> Self {
        Self {
            prod_dir_url: LETS_ENCRYPT_PROD.to_string(),
            staging_dir_url: LETS_ENCRYPT_STAGING.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Http01Section {
    pub enable: bool,
    pub port: u16,
}

impl Default for Http01Section {
    fn default() -> Self {
        Self {
            enable: true,
            port: 4060,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Dns01Section {
    pub enable: bool,
    pub api_token: String,
    pub domains: Vec<String>,
}

impl Default for Dns01Section {
    fn default() -> Self {
        Self {
            enable: false,
            api_token: String::new(),
            domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrdersSection {
    pub automatic_ordering_enable: bool,
    pub valid_remaining_days_threshold: i64,
    pub refresh_time_hour: u32,
    pub refresh_time_minute: u32,
    pub worker_count: usize,
}

impl Default for OrdersSection {
    fn default() -> Self {
        Self {
            automatic_ordering_enable: true,
            valid_remaining_days_threshold: 40,
            refresh_time_hour: 3,
            refresh_time_minute: 12,
            worker_count: 4,
        }
    }
}

impl Config {
    /// Load from a JSON file; a missing file is the default config
    pub fn load(path: &Path) -> Result<Config> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path:?}"))?;
        serde_json::from_str(&json).with_context(|| format!("failed to parse config file {path:?}"))
    }

    /// sqlx SQLite URL, creating the database file on first run
    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.dev_mode);
        assert!(config.acme.prod_dir_url.contains("letsencrypt.org"));
        assert!(config.acme.staging_dir_url.contains("staging"));
        assert_eq!(config.orders.worker_count, 4);
        assert_eq!(config.orders.valid_remaining_days_threshold, 40);
        assert!(!config.dns01_cloudflare.enable);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let config = Config::load(Path::new("/nonexistent/certkeeper.json")).unwrap();
        assert_eq!(config.api_port, Config::default().api_port);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"devMode": true, "orders": {"workerCount": 2}}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert!(config.dev_mode);
        assert_eq!(config.orders.worker_count, 2);
        // untouched sections keep their defaults
        assert_eq!(config.orders.refresh_time_hour, 3);
        assert_eq!(config.https_port, 4055);
    }

    #[test]
    fn test_db_url() {
        let config = Config::default();
        assert_eq!(config.db_url(), "sqlite://./data/certkeeper.db?mode=rwc");
    }
}
