//! DNS-01 challenge provider for Cloudflare-hosted zones
//!
//! Zones are discovered once at startup from the Cloudflare API; a
//! configuration that matches no zone refuses to start. `provision` creates
//! the `_acme-challenge` TXT record, then polls DNS-over-HTTPS until the
//! record is visible (or the bounded timeout / shutdown fires). Concurrent
//! provisions for the same identifier are serialized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{dns_txt_value, ChallengeKind, ChallengeSolver, DnsRecord, ProvisionReceipt, SolverError};

const DEFAULT_API_URL: &str = "https://api.cloudflare.com/client/v4";
const DEFAULT_DOH_URL: &str = "https://cloudflare-dns.com/dns-query";

fn default_propagation_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_secs() -> u64 {
    10
}

/// Cloudflare provider configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudflareConfig {
    pub api_token: String,
    /// Domains this instance may answer challenges for
    pub domains: Vec<String>,
    /// Override for tests; defaults to the public Cloudflare API
    #[serde(default)]
    pub api_url: Option<String>,
    /// Override for tests; defaults to Cloudflare DoH
    #[serde(default)]
    pub doh_url: Option<String>,
    #[serde(default = "default_propagation_timeout_secs")]
    pub propagation_timeout_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

/// DNS-01 solver backed by the Cloudflare REST API
pub struct Dns01CloudflareSolver {
    api: CloudflareApi,
    /// configured domain -> zone id
    zones: HashMap<String, String>,
    /// serializes concurrent provisions per identifier
    name_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    doh_url: String,
    propagation_timeout: Duration,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl Dns01CloudflareSolver {
    /// Discover zones and build the solver. Fails when no configured domain
    /// is covered by an accessible Cloudflare zone — a config error that
    /// must abort startup.
    pub async fn connect(
        config: CloudflareConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, SolverError> {
        let api = CloudflareApi::new(
            config.api_url.unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            config.api_token,
        )?;

        let available = api.list_zones().await?;

        let mut zones = HashMap::new();
        for domain in &config.domains {
            let matched = available
                .iter()
                .filter(|zone| domain == &zone.name || domain.ends_with(&format!(".{}", zone.name)))
                .max_by_key(|zone| zone.name.len());
            if let Some(zone) = matched {
                zones.insert(domain.clone(), zone.id.clone());
            } else {
                warn!(%domain, "configured domain not covered by any cloudflare zone");
            }
        }

        if zones.is_empty() {
            return Err(SolverError::Provider(
                "cloudflare config error: no configured domains matched a zone".to_string(),
            ));
        }

        info!(domains = ?zones.keys().collect::<Vec<_>>(), "dns-01 cloudflare configured domains");

        Ok(Self {
            api,
            zones,
            name_locks: Mutex::new(HashMap::new()),
            doh_url: config.doh_url.unwrap_or_else(|| DEFAULT_DOH_URL.to_string()),
            propagation_timeout: Duration::from_secs(config.propagation_timeout_secs),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            shutdown,
        })
    }

    /// Longest configured domain that covers the identifier
    fn zone_for(&self, identifier: &str) -> Result<String, SolverError> {
        self.zones
            .iter()
            .filter(|(domain, _)| {
                identifier == domain.as_str() || identifier.ends_with(&format!(".{domain}"))
            })
            .max_by_key(|(domain, _)| domain.len())
            .map(|(_, zone_id)| zone_id.clone())
            .ok_or_else(|| SolverError::UnknownDomain(identifier.to_string()))
    }

    async fn lock_identifier(&self, identifier: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.name_locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks
                .entry(identifier.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Poll DoH until the TXT value is visible, honoring shutdown and the
    /// bounded timeout
    async fn wait_for_propagation(&self, fqdn: &str, value: &str) -> Result<(), SolverError> {
        let deadline = Instant::now() + self.propagation_timeout;

        loop {
            if self.query_txt(fqdn).await?.iter().any(|v| v == value) {
                debug!(fqdn, "dns-01 record propagated");
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(SolverError::PropagationTimeout(fqdn.to_string()));
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(SolverError::Shutdown),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn query_txt(&self, fqdn: &str) -> Result<Vec<String>, SolverError> {
        let response = self
            .api
            .http
            .get(&self.doh_url)
            .query(&[("name", fqdn), ("type", "TXT")])
            .header("accept", "application/dns-json")
            .send()
            .await?;

        let answer: DohResponse = response.json().await?;
        Ok(answer
            .answer
            .into_iter()
            .filter(|record| record.kind == 16)
            .map(|record| record.data.trim_matches('"').to_string())
            .collect())
    }
}

#[async_trait::async_trait]
impl ChallengeSolver for Dns01CloudflareSolver {
    fn kind(&self) -> ChallengeKind {
        ChallengeKind::Dns01
    }

    async fn provision(
        &self,
        identifier: &str,
        token: &str,
        key_authorization: &str,
    ) -> Result<ProvisionReceipt, SolverError> {
        let name = identifier.trim_start_matches("*.");
        let zone_id = self.zone_for(name)?;

        // one provision at a time per identifier
        let _guard = self.lock_identifier(name).await;

        let fqdn = format!("_acme-challenge.{name}");
        let value = dns_txt_value(key_authorization);

        let record_id = self.api.create_txt_record(&zone_id, &fqdn, &value).await?;
        debug!(%fqdn, %record_id, "dns-01 txt record created");

        let record = DnsRecord {
            zone_id,
            record_id,
            fqdn: fqdn.clone(),
        };

        if let Err(e) = self.wait_for_propagation(&fqdn, &value).await {
            // remove the record ourselves; the caller never saw a receipt
            if let Err(del) = self.api.delete_record(&record.zone_id, &record.record_id).await {
                warn!(%fqdn, "failed to remove unpropagated txt record: {del}");
            }
            return Err(e);
        }

        Ok(ProvisionReceipt {
            kind: ChallengeKind::Dns01,
            identifier: identifier.to_string(),
            token: token.to_string(),
            dns_record: Some(record),
        })
    }

    async fn cleanup(&self, receipt: &ProvisionReceipt) -> Result<(), SolverError> {
        let Some(record) = &receipt.dns_record else {
            return Ok(());
        };

        debug!(fqdn = %record.fqdn, "removing dns-01 txt record");
        self.api.delete_record(&record.zone_id, &record.record_id).await
    }
}

/// Thin bearer-token client for the Cloudflare v4 API
struct CloudflareApi {
    http: reqwest::Client,
    base_url: String,
}

impl CloudflareApi {
    fn new(base_url: String, api_token: String) -> Result<Self, SolverError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {api_token}"))
            .map_err(|_| SolverError::Provider("invalid cloudflare api token".to_string()))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(headers)
            .build()?;

        Ok(Self { http, base_url })
    }

    async fn list_zones(&self) -> Result<Vec<Zone>, SolverError> {
        let response = self
            .http
            .get(format!("{}/zones", self.base_url))
            .query(&[("per_page", "50")])
            .send()
            .await?;

        let body: ApiResponse<Vec<Zone>> = response.json().await?;
        body.into_result("zone listing")
    }

    async fn create_txt_record(
        &self,
        zone_id: &str,
        fqdn: &str,
        value: &str,
    ) -> Result<String, SolverError> {
        let response = self
            .http
            .post(format!("{}/zones/{zone_id}/dns_records", self.base_url))
            .json(&serde_json::json!({
                "type": "TXT",
                "name": fqdn,
                "content": value,
                "ttl": 60,
            }))
            .send()
            .await?;

        let body: ApiResponse<RecordRef> = response.json().await?;
        Ok(body.into_result("txt record creation")?.id)
    }

    async fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<(), SolverError> {
        let response = self
            .http
            .delete(format!(
                "{}/zones/{zone_id}/dns_records/{record_id}",
                self.base_url
            ))
            .send()
            .await?;

        let body: ApiResponse<RecordRef> = response.json().await?;
        if body.success {
            Ok(())
        } else {
            Err(SolverError::Provider(body.error_text("record deletion")))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    errors: Vec<ApiErrorItem>,
}

impl<T> ApiResponse<T> {
    fn into_result(self, what: &str) -> Result<T, SolverError> {
        if !self.success {
            return Err(SolverError::Provider(self.error_text(what)));
        }
        self.result
            .ok_or_else(|| SolverError::Provider(format!("cloudflare {what}: empty result")))
    }

    fn error_text(&self, what: &str) -> String {
        let details: Vec<String> = self
            .errors
            .iter()
            .map(|e| format!("{} ({})", e.message, e.code))
            .collect();
        format!("cloudflare {what} failed: {}", details.join("; "))
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorItem {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct RecordRef {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Answer", default)]
    answer: Vec<DohRecord>,
}

#[derive(Debug, Deserialize)]
struct DohRecord {
    #[serde(rename = "type")]
    kind: u16,
    data: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer, domains: Vec<String>) -> CloudflareConfig {
        CloudflareConfig {
            api_token: "cf-token".to_string(),
            domains,
            api_url: Some(server.uri()),
            doh_url: Some(format!("{}/dns-query", server.uri())),
            propagation_timeout_secs: 2,
            poll_interval_secs: 1,
        }
    }

    async fn mock_zones(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/zones"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "result": [
                    {"id": "zone-1", "name": "example.com"},
                    {"id": "zone-2", "name": "other.net"}
                ]
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_connect_refuses_zero_matching_zones() {
        let server = MockServer::start().await;
        mock_zones(&server).await;

        let result = Dns01CloudflareSolver::connect(
            config(&server, vec!["unrelated.org".to_string()]),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(SolverError::Provider(_))));
    }

    #[tokio::test]
    async fn test_connect_maps_subdomains_to_zone() {
        let server = MockServer::start().await;
        mock_zones(&server).await;

        let solver = Dns01CloudflareSolver::connect(
            config(&server, vec!["www.example.com".to_string(), "other.net".to_string()]),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(solver.zone_for("www.example.com").unwrap(), "zone-1");
        assert_eq!(solver.zone_for("other.net").unwrap(), "zone-2");
        assert!(matches!(
            solver.zone_for("nomatch.io"),
            Err(SolverError::UnknownDomain(_))
        ));
    }

    #[tokio::test]
    async fn test_provision_and_cleanup() {
        let server = MockServer::start().await;
        mock_zones(&server).await;

        let expected_value = dns_txt_value("tok.thumb");

        Mock::given(method("POST"))
            .and(path("/zones/zone-1/dns_records"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "result": {"id": "rec-9"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/dns-query"))
            .and(query_param("name", "_acme-challenge.www.example.com"))
            .and(query_param("type", "TXT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Status": 0,
                "Answer": [
                    {"name": "_acme-challenge.www.example.com", "type": 16, "TTL": 60,
                     "data": format!("\"{expected_value}\"")}
                ]
            })))
            .mount(&server)
            .await;

        Mock::given(method("DELETE"))
            .and(path("/zones/zone-1/dns_records/rec-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "result": {"id": "rec-9"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let solver = Dns01CloudflareSolver::connect(
            config(&server, vec!["www.example.com".to_string()]),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let receipt = solver
            .provision("www.example.com", "tok", "tok.thumb")
            .await
            .unwrap();
        let record = receipt.dns_record.as_ref().unwrap();
        assert_eq!(record.record_id, "rec-9");
        assert_eq!(record.fqdn, "_acme-challenge.www.example.com");

        solver.cleanup(&receipt).await.unwrap();
    }

    #[tokio::test]
    async fn test_provision_wildcard_strips_prefix() {
        let server = MockServer::start().await;
        mock_zones(&server).await;

        let expected_value = dns_txt_value("tok.thumb");

        Mock::given(method("POST"))
            .and(path("/zones/zone-1/dns_records"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "result": {"id": "rec-1"}
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/dns-query"))
            .and(query_param("name", "_acme-challenge.example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Status": 0,
                "Answer": [{"name": "_acme-challenge.example.com", "type": 16, "TTL": 60,
                            "data": format!("\"{expected_value}\"")}]
            })))
            .mount(&server)
            .await;

        let solver = Dns01CloudflareSolver::connect(
            config(&server, vec!["example.com".to_string()]),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let receipt = solver
            .provision("*.example.com", "tok", "tok.thumb")
            .await
            .unwrap();
        assert_eq!(
            receipt.dns_record.unwrap().fqdn,
            "_acme-challenge.example.com"
        );
    }

    #[tokio::test]
    async fn test_propagation_timeout_deletes_record() {
        let server = MockServer::start().await;
        mock_zones(&server).await;

        Mock::given(method("POST"))
            .and(path("/zones/zone-1/dns_records"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "result": {"id": "rec-5"}
            })))
            .mount(&server)
            .await;

        // resolver never sees the record
        Mock::given(method("GET"))
            .and(path("/dns-query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Status": 0,
                "Answer": []
            })))
            .mount(&server)
            .await;

        Mock::given(method("DELETE"))
            .and(path("/zones/zone-1/dns_records/rec-5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "result": {"id": "rec-5"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let solver = Dns01CloudflareSolver::connect(
            config(&server, vec!["example.com".to_string()]),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let result = solver.provision("example.com", "tok", "tok.thumb").await;
        assert!(matches!(result, Err(SolverError::PropagationTimeout(_))));
    }
}
