//! Order pipeline end-to-end tests against a mock ACME server

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use certkeeper_acme::AcmeClient;
use certkeeper_crypto::{KeyAlgorithm, PrivateKey};
use certkeeper_orders::{
    AutoOrderConfig, AutoOrderScheduler, OrderPipeline, PipelineConfig, PipelineDeps, Priority,
};
use certkeeper_solvers::{
    ChallengeKind, ChallengeSolver, Http01Solver, ProvisionReceipt, SolverError,
};
use certkeeper_storage::{NewAccount, NewCertificate, NewKey, Storage};

/// Wraps the http-01 solver to count provision/cleanup pairing
struct TrackingSolver {
    inner: Http01Solver,
    provisions: AtomicUsize,
    cleanups: AtomicUsize,
}

impl TrackingSolver {
    fn new() -> Self {
        Self {
            inner: Http01Solver::new(),
            provisions: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl ChallengeSolver for TrackingSolver {
    fn kind(&self) -> ChallengeKind {
        ChallengeKind::Http01
    }

    async fn provision(
        &self,
        identifier: &str,
        token: &str,
        key_authorization: &str,
    ) -> Result<ProvisionReceipt, SolverError> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        self.inner.provision(identifier, token, key_authorization).await
    }

    async fn cleanup(&self, receipt: &ProvisionReceipt) -> Result<(), SolverError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        self.inner.cleanup(receipt).await
    }
}

fn test_pipeline_config() -> PipelineConfig {
    PipelineConfig {
        worker_count: 2,
        poll_interval: Duration::from_millis(50),
        poll_max: Duration::from_secs(10),
        backoff_base: Duration::from_millis(10),
        backoff_factor: 2,
        backoff_max: Duration::from_millis(100),
        max_attempts: 2,
    }
}

/// A realistic issued chain: a self-signed leaf valid ~90 days
fn issued_chain_pem() -> String {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(vec!["example.com".to_string()]).unwrap();
    let now = chrono::Utc::now().timestamp();
    params.not_before = time::OffsetDateTime::from_unix_timestamp(now).unwrap();
    params.not_after = time::OffsetDateTime::from_unix_timestamp(now + 90 * 86_400).unwrap();
    params.self_signed(&key_pair).unwrap().pem()
}

async fn mount_directory_and_nonce(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/directory"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "newNonce": format!("{}/acme/new-nonce", server.uri()),
            "newAccount": format!("{}/acme/new-acct", server.uri()),
            "newOrder": format!("{}/acme/new-order", server.uri()),
        })))
        .mount(server)
        .await;

    Mock::given(method("HEAD"))
        .and(path("/acme/new-nonce"))
        .respond_with(ResponseTemplate::new(200).insert_header("Replay-Nonce", "test-nonce"))
        .mount(server)
        .await;
}

/// Seed a key, a registered account and a certificate; returns (cert_id)
async fn seed_certificate(storage: &Storage, name: &str) -> i64 {
    let key_pem = PrivateKey::generate(KeyAlgorithm::EcdsaP256)
        .unwrap()
        .to_pem()
        .unwrap();

    let key = storage
        .create_key(NewKey {
            name: format!("{name}-key"),
            description: None,
            algorithm: "ecdsap256".to_string(),
            pem: key_pem,
            api_key: "key-api".to_string(),
        })
        .await
        .unwrap();

    let account = storage
        .create_account(NewAccount {
            name: format!("{name}-account"),
            description: None,
            email: Some("ops@example.com".to_string()),
            accepted_tos: true,
            private_key_id: key.id,
            directory: "staging".to_string(),
        })
        .await
        .unwrap();
    storage
        .set_account_registration(account.id, "https://acme.example/acct/1", "valid")
        .await
        .unwrap();

    let cert = storage
        .create_certificate(NewCertificate {
            name: name.to_string(),
            description: None,
            account_id: account.id,
            private_key_id: key.id,
            subject: "example.com".to_string(),
            subject_alts: vec!["example.com".to_string()],
            api_key: "cert-api".to_string(),
            api_key_via_url: false,
            post_processing_command: None,
        })
        .await
        .unwrap();

    cert.id
}

async fn build_pipeline(
    server: &MockServer,
    storage: &Storage,
    solvers: Vec<Arc<dyn ChallengeSolver>>,
    shutdown: CancellationToken,
) -> Arc<OrderPipeline> {
    let client = Arc::new(
        AcmeClient::connect(format!("{}/directory", server.uri()))
            .await
            .unwrap(),
    );
    OrderPipeline::new(
        PipelineDeps {
            storage: storage.clone(),
            acme_prod: client.clone(),
            acme_staging: client,
            solvers,
        },
        test_pipeline_config(),
        shutdown,
    )
}

async fn wait_for_terminal(storage: &Storage, order_id: i64) -> certkeeper_storage::entities::acme_order::Model {
    for _ in 0..200 {
        let order = storage.get_order(order_id).await.unwrap();
        if order.is_terminal() {
            return order;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("order {order_id} never reached a terminal state");
}

#[tokio::test]
async fn test_happy_path_issuance() {
    let server = MockServer::start().await;
    mount_directory_and_nonce(&server).await;

    let order_url = format!("{}/acme/order/1", server.uri());
    let authz_url = format!("{}/acme/authz/1", server.uri());
    let finalize_url = format!("{}/acme/order/1/finalize", server.uri());
    let cert_url = format!("{}/acme/cert/1", server.uri());

    let pending_order = serde_json::json!({
        "status": "pending",
        "expires": "2027-01-01T00:00:00Z",
        "identifiers": [{"type": "dns", "value": "example.com"}],
        "authorizations": [authz_url],
        "finalize": finalize_url,
    });

    // newOrder placement
    Mock::given(method("POST"))
        .and(path("/acme/new-order"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("Location", order_url.as_str())
                .insert_header("Replay-Nonce", "n")
                .set_body_json(pending_order.clone()),
        )
        .mount(&server)
        .await;

    // order fetch sequence: pending -> ready -> valid
    Mock::given(method("POST"))
        .and(path("/acme/order/1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Replay-Nonce", "n")
                .set_body_json(pending_order.clone()),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/acme/order/1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Replay-Nonce", "n")
                .set_body_json(serde_json::json!({
                    "status": "ready",
                    "identifiers": [{"type": "dns", "value": "example.com"}],
                    "authorizations": [authz_url],
                    "finalize": finalize_url,
                })),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/acme/order/1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Replay-Nonce", "n")
                .set_body_json(serde_json::json!({
                    "status": "valid",
                    "identifiers": [{"type": "dns", "value": "example.com"}],
                    "authorizations": [authz_url],
                    "finalize": finalize_url,
                    "certificate": cert_url,
                })),
        )
        .mount(&server)
        .await;

    // authorization: pending with an http-01 challenge, then valid
    Mock::given(method("POST"))
        .and(path("/acme/authz/1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Replay-Nonce", "n")
                .set_body_json(serde_json::json!({
                    "identifier": {"type": "dns", "value": "example.com"},
                    "status": "pending",
                    "challenges": [
                        {"type": "http-01", "url": format!("{}/acme/chall/1", server.uri()),
                         "status": "pending", "token": "tok-1"}
                    ],
                })),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/acme/authz/1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Replay-Nonce", "n")
                .set_body_json(serde_json::json!({
                    "identifier": {"type": "dns", "value": "example.com"},
                    "status": "valid",
                    "challenges": [],
                })),
        )
        .mount(&server)
        .await;

    // challenge trigger
    Mock::given(method("POST"))
        .and(path("/acme/chall/1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Replay-Nonce", "n")
                .set_body_json(serde_json::json!({
                    "type": "http-01",
                    "url": format!("{}/acme/chall/1", server.uri()),
                    "status": "processing",
                    "token": "tok-1",
                })),
        )
        .expect(1)
        .mount(&server)
        .await;

    // finalize, then the valid order mock above takes over
    Mock::given(method("POST"))
        .and(path("/acme/order/1/finalize"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Replay-Nonce", "n")
                .set_body_json(serde_json::json!({
                    "status": "processing",
                    "identifiers": [{"type": "dns", "value": "example.com"}],
                    "authorizations": [authz_url],
                    "finalize": finalize_url,
                })),
        )
        .expect(1)
        .mount(&server)
        .await;

    // issued chain download
    let chain = issued_chain_pem();
    Mock::given(method("POST"))
        .and(path("/acme/cert/1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Replay-Nonce", "n")
                .set_body_raw(chain.clone(), "application/pem-certificate-chain"),
        )
        .mount(&server)
        .await;

    let storage = Storage::connect("sqlite::memory:").await.unwrap();
    let cert_id = seed_certificate(&storage, "happy").await;

    let tracker = Arc::new(TrackingSolver::new());
    let shutdown = CancellationToken::new();
    let pipeline = build_pipeline(
        &server,
        &storage,
        vec![tracker.clone() as Arc<dyn ChallengeSolver>],
        shutdown.clone(),
    )
    .await;

    pipeline.start_workers();
    let order_id = pipeline.place_new_order(cert_id, Priority::High).await.unwrap();

    let order = wait_for_terminal(&storage, order_id).await;
    assert_eq!(order.status, "valid");

    let pem = order.pem.unwrap();
    assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));

    // ~90 day certificate
    let lifetime = order.valid_to.unwrap() - order.valid_from.unwrap();
    assert_eq!(lifetime, 90 * 86_400);
    assert!(order.finalized_key_id.is_some());

    // provision/cleanup pairing held
    assert_eq!(tracker.provisions.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.cleanups.load(Ordering::SeqCst), 1);

    shutdown.cancel();
}

#[tokio::test]
async fn test_failed_authorization_marks_order_invalid_and_cleans_up() {
    let server = MockServer::start().await;
    mount_directory_and_nonce(&server).await;

    let order_url = format!("{}/acme/order/2", server.uri());
    let authz_url = format!("{}/acme/authz/2", server.uri());

    let pending_order = serde_json::json!({
        "status": "pending",
        "identifiers": [{"type": "dns", "value": "example.com"}],
        "authorizations": [authz_url],
        "finalize": format!("{}/acme/order/2/finalize", server.uri()),
    });

    Mock::given(method("POST"))
        .and(path("/acme/new-order"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("Location", order_url.as_str())
                .insert_header("Replay-Nonce", "n")
                .set_body_json(pending_order.clone()),
        )
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/acme/order/2"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Replay-Nonce", "n")
                .set_body_json(pending_order.clone()),
        )
        .mount(&server)
        .await;

    // authorization goes pending -> invalid
    Mock::given(method("POST"))
        .and(path("/acme/authz/2"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Replay-Nonce", "n")
                .set_body_json(serde_json::json!({
                    "identifier": {"type": "dns", "value": "example.com"},
                    "status": "pending",
                    "challenges": [
                        {"type": "http-01", "url": format!("{}/acme/chall/2", server.uri()),
                         "status": "pending", "token": "tok-2"}
                    ],
                })),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/acme/authz/2"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Replay-Nonce", "n")
                .set_body_json(serde_json::json!({
                    "identifier": {"type": "dns", "value": "example.com"},
                    "status": "invalid",
                    "challenges": [],
                })),
        )
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/acme/chall/2"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Replay-Nonce", "n")
                .set_body_json(serde_json::json!({
                    "type": "http-01",
                    "url": format!("{}/acme/chall/2", server.uri()),
                    "status": "processing",
                    "token": "tok-2",
                })),
        )
        .mount(&server)
        .await;

    let storage = Storage::connect("sqlite::memory:").await.unwrap();
    let cert_id = seed_certificate(&storage, "failing").await;

    let tracker = Arc::new(TrackingSolver::new());
    let shutdown = CancellationToken::new();
    let pipeline = build_pipeline(
        &server,
        &storage,
        vec![tracker.clone() as Arc<dyn ChallengeSolver>],
        shutdown.clone(),
    )
    .await;

    pipeline.start_workers();
    let order_id = pipeline.place_new_order(cert_id, Priority::High).await.unwrap();

    let order = wait_for_terminal(&storage, order_id).await;
    assert_eq!(order.status, "invalid");
    assert!(order.error.is_some());

    // cleanup ran even though the authorization failed
    assert_eq!(tracker.provisions.load(Ordering::SeqCst), 1);
    assert_eq!(tracker.cleanups.load(Ordering::SeqCst), 1);

    shutdown.cancel();
}

#[tokio::test]
async fn test_renewal_threshold_and_scheduler_idempotence() {
    let server = MockServer::start().await;
    mount_directory_and_nonce(&server).await;

    // any renewal order placed lands here
    Mock::given(method("POST"))
        .and(path("/acme/new-order"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("Location", format!("{}/acme/order/9", server.uri()).as_str())
                .insert_header("Replay-Nonce", "n")
                .set_body_json(serde_json::json!({
                    "status": "pending",
                    "identifiers": [{"type": "dns", "value": "example.com"}],
                    "authorizations": [format!("{}/acme/authz/9", server.uri())],
                    "finalize": format!("{}/acme/order/9/finalize", server.uri()),
                })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let storage = Storage::connect("sqlite::memory:").await.unwrap();
    let cert_id = seed_certificate(&storage, "expiring").await;

    // an existing valid order that expires in 10 days
    let now = chrono::Utc::now().timestamp();
    let old = storage
        .insert_order(certkeeper_storage::NewOrder {
            certificate_id: cert_id,
            location: format!("{}/acme/order/8", server.uri()),
            status: certkeeper_acme::OrderStatus::Pending,
            expires: None,
            dns_identifiers: vec!["example.com".to_string()],
            authorizations: vec![],
            finalize: String::new(),
        })
        .await
        .unwrap();
    let cert_key = storage.get_certificate(cert_id).await.unwrap().private_key_id;
    storage
        .set_order_valid(old.id, "PEM", cert_key, now, now + 10 * 86_400)
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    // workers intentionally NOT started; we only inspect the queue
    let pipeline = build_pipeline(&server, &storage, vec![], shutdown.clone()).await;

    let scheduler = AutoOrderScheduler::new(
        storage.clone(),
        pipeline.clone(),
        AutoOrderConfig {
            enabled: true,
            valid_remaining_days_threshold: 40,
            refresh_hour: 3,
            refresh_minute: 0,
            submission_spacing: Duration::from_millis(1),
        },
        shutdown.clone(),
    );

    // first run places exactly one renewal order
    scheduler.run_once().await;
    assert_eq!(pipeline.queued_len(), 1);
    let orders = storage.get_cert_orders(cert_id).await.unwrap();
    assert_eq!(orders.len(), 2);

    // second run finds the in-flight order and re-submits it, which dedups:
    // no new order, no extra queue entry
    scheduler.run_once().await;
    assert_eq!(pipeline.queued_len(), 1);
    let orders = storage.get_cert_orders(cert_id).await.unwrap();
    assert_eq!(orders.len(), 2);
}
