//! The order-processing pipeline
//!
//! Jobs flow through two FIFO queues (high = operator-initiated, low =
//! auto-renew / retries). A fixed pool of workers drains them, preferring
//! high priority, with at most one in-flight job per certificate: a worker
//! that peeks a job whose certificate is busy rotates it to the tail, and
//! after one full scan without a runnable job it parks on the notify until
//! the active set shrinks or something is enqueued.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use certkeeper_acme::{
    AcmeClient, AcmeError, AuthorizationStatus, Challenge, OrderStatus, Problem,
};
use certkeeper_crypto::{CryptoError, PrivateKey};
use certkeeper_solvers::{ChallengeKind, ChallengeSolver, SolverError};
use certkeeper_storage::entities::{acme_account, certificate};
use certkeeper_storage::{NewOrder, Storage, StorageError};

use crate::csr::{build_csr, leaf_validity, parse_rfc3339_unix};

/// Challenge preference when an authorization offers several
const CHALLENGE_PREFERENCE: [ChallengeKind; 2] = [ChallengeKind::Dns01, ChallengeKind::Http01];

#[derive(Debug, Error)]
pub enum OrderError {
    #[error(transparent)]
    Acme(#[from] AcmeError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Solver(#[from] SolverError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("csr generation failed: {0}")]
    Csr(String),

    #[error("issued certificate unparsable: {0}")]
    CertParse(String),

    #[error("account is not registered with the acme server")]
    AccountNotRegistered,

    #[error("no solver available for the offered challenge types of {0}")]
    NoSolver(String),

    #[error("authorization for {0} failed")]
    AuthorizationFailed(String),

    #[error("gave up polling {0} before it settled")]
    PollTimeout(String),

    #[error("shutdown requested")]
    Shutdown,
}

impl OrderError {
    /// Retryable failures trigger the bounded backoff; everything else
    /// makes the order invalid
    pub fn is_retryable(&self) -> bool {
        match self {
            OrderError::Acme(e) => e.is_retryable(),
            OrderError::Solver(SolverError::Transport(_)) => true,
            OrderError::Solver(SolverError::PropagationTimeout(_)) => true,
            OrderError::PollTimeout(_) => true,
            _ => false,
        }
    }

    /// The problem document to persist on the order, synthesized when the
    /// failure did not come from the server
    fn as_problem(&self) -> Problem {
        if let OrderError::Acme(e) = self {
            if let Some(problem) = e.problem() {
                return problem.clone();
            }
        }
        Problem {
            detail: Some(self.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Operator-initiated work
    High,
    /// Auto-renewals and retries
    Low,
}

/// One unit of pipeline work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderJob {
    pub order_id: i64,
    pub cert_id: i64,
}

/// Collaborators the pipeline drives, built once at startup
pub struct PipelineDeps {
    pub storage: Storage,
    pub acme_prod: Arc<AcmeClient>,
    pub acme_staging: Arc<AcmeClient>,
    pub solvers: Vec<Arc<dyn ChallengeSolver>>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub worker_count: usize,
    /// Authorization / order poll cadence
    pub poll_interval: Duration,
    /// Hard cap on any single polling loop
    pub poll_max: Duration,
    pub backoff_base: Duration,
    pub backoff_factor: u32,
    pub backoff_max: Duration,
    pub max_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval: Duration::from_secs(5),
            poll_max: Duration::from_secs(600),
            backoff_base: Duration::from_secs(30),
            backoff_factor: 2,
            backoff_max: Duration::from_secs(600),
            max_attempts: 6,
        }
    }
}

#[derive(Default)]
struct QueueState {
    high: VecDeque<OrderJob>,
    low: VecDeque<OrderJob>,
    /// order ids sitting in either queue
    queued_orders: HashSet<i64>,
    /// cert id -> worker currently processing an order for it
    active_certs: HashMap<i64, usize>,
    /// order ids currently being processed
    active_orders: HashSet<i64>,
}

pub struct OrderPipeline {
    state: Mutex<QueueState>,
    notify: Notify,
    deps: PipelineDeps,
    config: PipelineConfig,
    shutdown: CancellationToken,
}

impl OrderPipeline {
    pub fn new(
        deps: PipelineDeps,
        config: PipelineConfig,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            deps,
            config,
            shutdown,
        })
    }

    /// Spawn the worker pool
    pub fn start_workers(self: &Arc<Self>) {
        info!(workers = self.config.worker_count, "starting order pipeline workers");
        for worker_id in 0..self.config.worker_count {
            let pipeline = self.clone();
            tokio::spawn(async move { pipeline.worker_loop(worker_id).await });
        }
    }

    /// Enqueue an order job. No-op (returns false) when a job for the same
    /// order is already queued or being processed.
    pub fn submit(&self, order_id: i64, cert_id: i64, priority: Priority) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        if state.queued_orders.contains(&order_id) || state.active_orders.contains(&order_id) {
            debug!(order_id, "order already queued or active, submit is a no-op");
            return false;
        }

        let job = OrderJob { order_id, cert_id };
        match priority {
            Priority::High => state.high.push_back(job),
            Priority::Low => state.low.push_back(job),
        }
        state.queued_orders.insert(order_id);
        drop(state);

        self.notify.notify_waiters();
        debug!(order_id, cert_id, ?priority, "order job queued");
        true
    }

    /// Create a brand-new ACME order for a certificate, persist it and queue
    /// the job. Used by operator actions (high) and the renewal scheduler
    /// (low).
    pub async fn place_new_order(
        &self,
        cert_id: i64,
        priority: Priority,
    ) -> Result<i64, OrderError> {
        let storage = &self.deps.storage;
        let cert = storage.get_certificate(cert_id).await?;
        let account = storage.get_account(cert.account_id).await?;
        let kid = account
            .kid
            .clone()
            .ok_or(OrderError::AccountNotRegistered)?;
        let account_key = self.load_key(account.private_key_id).await?;
        let client = self.client_for(&account);

        let identifiers = cert.dns_identifiers();
        let (location, remote) = client.new_order(&kid, &account_key, &identifiers).await?;

        let row = storage
            .insert_order(NewOrder {
                certificate_id: cert.id,
                location,
                status: remote.status,
                expires: parse_rfc3339_unix(remote.expires.as_deref()),
                dns_identifiers: identifiers,
                authorizations: remote.authorizations.clone(),
                finalize: remote.finalize.clone(),
            })
            .await?;

        info!(order_id = row.id, cert_id, "new acme order placed");
        self.submit(row.id, cert_id, priority);
        Ok(row.id)
    }

    /// Number of jobs currently queued (both priorities); used by tests and
    /// the status endpoint
    pub fn queued_len(&self) -> usize {
        match self.state.lock() {
            Ok(state) => state.high.len() + state.low.len(),
            Err(_) => 0,
        }
    }

    fn client_for(&self, account: &acme_account::Model) -> Arc<AcmeClient> {
        if account.directory == "staging" {
            self.deps.acme_staging.clone()
        } else {
            self.deps.acme_prod.clone()
        }
    }

    async fn load_key(&self, key_id: i64) -> Result<PrivateKey, OrderError> {
        let row = self.deps.storage.get_key(key_id).await?;
        Ok(PrivateKey::from_pem(&row.pem)?)
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "pipeline worker started");
        loop {
            let job = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                job = self.next_job(worker_id) => job,
            };

            self.run_job(worker_id, job).await;
            self.release(job);
        }
        debug!(worker_id, "pipeline worker stopped");
    }

    /// Block until a runnable job exists, then claim it
    async fn next_job(&self, worker_id: usize) -> OrderJob {
        loop {
            let notified = self.notify.notified();
            if let Some(job) = self.try_claim(worker_id) {
                return job;
            }
            notified.await;
        }
    }

    /// One bounded scan over both queues: rotate blocked jobs to the tail,
    /// claim the first job whose certificate is idle
    fn try_claim(&self, worker_id: usize) -> Option<OrderJob> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let QueueState {
            high,
            low,
            queued_orders,
            active_certs,
            active_orders,
        } = &mut *state;

        for queue in [high, low] {
            for _ in 0..queue.len() {
                let Some(job) = queue.pop_front() else {
                    break;
                };
                if active_certs.contains_key(&job.cert_id) {
                    queue.push_back(job);
                    continue;
                }
                queued_orders.remove(&job.order_id);
                active_certs.insert(job.cert_id, worker_id);
                active_orders.insert(job.order_id);
                return Some(job);
            }
        }
        None
    }

    fn release(&self, job: OrderJob) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.active_certs.remove(&job.cert_id);
        state.active_orders.remove(&job.order_id);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Drive one job to completion, with bounded exponential backoff on
    /// retryable failures
    async fn run_job(&self, worker_id: usize, job: OrderJob) {
        let mut attempt: u32 = 0;
        loop {
            match self.process_order(&job).await {
                Ok(()) => return,
                Err(OrderError::Shutdown) | Err(OrderError::Solver(SolverError::Shutdown)) => {
                    // leave the order non-terminal; the next retry cycle
                    // picks it up
                    info!(worker_id, order_id = job.order_id, "job aborted for shutdown");
                    return;
                }
                Err(e) if e.is_retryable() && attempt + 1 < self.config.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        worker_id,
                        order_id = job.order_id,
                        attempt,
                        delay_secs = delay.as_secs(),
                        "retryable order failure: {e}"
                    );
                    if let Err(persist) = self
                        .deps
                        .storage
                        .set_order_error(job.order_id, &e.as_problem())
                        .await
                    {
                        warn!(order_id = job.order_id, "failed to record order error: {persist}");
                    }

                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    // attempts exhausted on a transient failure: record it
                    // and leave the order non-terminal for the daily retry
                    error!(
                        worker_id,
                        order_id = job.order_id,
                        "giving up on order for now: {e}"
                    );
                    if let Err(persist) = self
                        .deps
                        .storage
                        .set_order_error(job.order_id, &e.as_problem())
                        .await
                    {
                        warn!(order_id = job.order_id, "failed to record order error: {persist}");
                    }
                    return;
                }
                Err(e) => {
                    error!(worker_id, order_id = job.order_id, "order failed: {e}");
                    if let Err(persist) = self
                        .deps
                        .storage
                        .set_order_invalid(job.order_id, Some(&e.as_problem()))
                        .await
                    {
                        warn!(
                            order_id = job.order_id,
                            "failed to mark order invalid: {persist}"
                        );
                    }
                    return;
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.config.backoff_factor.saturating_pow(attempt);
        self.config
            .backoff_base
            .saturating_mul(factor)
            .min(self.config.backoff_max)
    }

    /// The order state machine: fetch, solve, finalize, poll, download
    async fn process_order(&self, job: &OrderJob) -> Result<(), OrderError> {
        let storage = &self.deps.storage;

        let order = storage.get_order(job.order_id).await?;
        if order.is_terminal() {
            debug!(order_id = order.id, "order already terminal, nothing to do");
            return Ok(());
        }

        let cert = storage.get_certificate(order.certificate_id).await?;
        let account = storage.get_account(cert.account_id).await?;
        let kid = account
            .kid
            .clone()
            .ok_or(OrderError::AccountNotRegistered)?;
        let account_key = self.load_key(account.private_key_id).await?;
        let client = self.client_for(&account);

        // 1. sync with the server
        let mut remote = client.get_order(&order.location, &kid, &account_key).await?;
        let expires = parse_rfc3339_unix(remote.expires.as_deref());
        if !remote.status.is_terminal() {
            storage
                .update_order_from_acme(order.id, &remote, expires)
                .await?;
        }

        // 2. solve authorizations while pending
        if remote.status == OrderStatus::Pending {
            for authz_url in remote.authorizations.clone() {
                if self.shutdown.is_cancelled() {
                    return Err(OrderError::Shutdown);
                }
                self.solve_authorization(&client, &kid, &account_key, &authz_url, expires)
                    .await?;
            }

            remote = client.get_order(&order.location, &kid, &account_key).await?;
            if !remote.status.is_terminal() {
                storage
                    .update_order_from_acme(order.id, &remote, None)
                    .await?;
            }
        }

        // 3. finalize with a CSR signed by the certificate's current key
        if remote.status == OrderStatus::Ready {
            let cert_key_row = storage.get_key(cert.private_key_id).await?;
            let csr = build_csr(&cert, &cert_key_row.pem)?;
            remote = client
                .finalize(&remote.finalize, &kid, &account_key, &csr)
                .await?;
            if !remote.status.is_terminal() {
                storage
                    .update_order_from_acme(order.id, &remote, None)
                    .await?;
            }
        }

        // 4. poll to a terminal state
        let deadline = self.poll_deadline(expires);
        while !remote.status.is_terminal() {
            if chrono::Utc::now().timestamp() >= deadline {
                return Err(OrderError::PollTimeout(order.location.clone()));
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(OrderError::Shutdown),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            remote = client.get_order(&order.location, &kid, &account_key).await?;
            if !remote.status.is_terminal() {
                storage
                    .update_order_from_acme(order.id, &remote, None)
                    .await?;
            }
        }

        // 5. terminal handling
        match remote.status {
            OrderStatus::Valid => {
                let certificate_url = remote.certificate.clone().ok_or_else(|| {
                    OrderError::Acme(AcmeError::MalformedResponse(
                        "valid order without certificate url".to_string(),
                    ))
                })?;
                let pem = client
                    .download_certificate(&certificate_url, &kid, &account_key)
                    .await?;
                let (valid_from, valid_to) = leaf_validity(&pem)?;

                storage
                    .set_order_valid(order.id, &pem, cert.private_key_id, valid_from, valid_to)
                    .await?;
                info!(
                    order_id = order.id,
                    cert = %cert.name,
                    valid_to,
                    "certificate issued and persisted"
                );

                self.run_post_processing(&cert).await;
            }
            OrderStatus::Invalid => {
                storage
                    .set_order_invalid(order.id, remote.error.as_ref())
                    .await?;
                warn!(order_id = order.id, cert = %cert.name, "order ended invalid");
            }
            _ => {}
        }

        Ok(())
    }

    /// Solve one authorization: pick a challenge matching an available
    /// solver (dns-01 preferred), provision, trigger validation and poll.
    /// Cleanup always runs, error paths included.
    async fn solve_authorization(
        &self,
        client: &Arc<AcmeClient>,
        kid: &str,
        account_key: &PrivateKey,
        authz_url: &str,
        order_expires: Option<i64>,
    ) -> Result<(), OrderError> {
        let authz = client.get_authorization(authz_url, kid, account_key).await?;
        let identifier = authz.identifier.value.clone();

        match authz.status {
            AuthorizationStatus::Valid => {
                debug!(%identifier, "authorization already valid");
                return Ok(());
            }
            AuthorizationStatus::Pending => {}
            _ => return Err(OrderError::AuthorizationFailed(identifier)),
        }

        let (challenge, solver) = self.pick_challenge(&authz.challenges, &identifier)?;

        let key_authorization = format!(
            "{}.{}",
            challenge.token,
            account_key.jwk_thumbprint()?
        );

        let receipt = solver
            .provision(&identifier, &challenge.token, &key_authorization)
            .await?;

        let result = self
            .validate_challenge(client, kid, account_key, authz_url, &challenge, order_expires)
            .await;

        if let Err(e) = solver.cleanup(&receipt).await {
            warn!(%identifier, "challenge cleanup failed: {e}");
        }

        result
    }

    /// POST the challenge and poll the authorization until it settles
    async fn validate_challenge(
        &self,
        client: &Arc<AcmeClient>,
        kid: &str,
        account_key: &PrivateKey,
        authz_url: &str,
        challenge: &Challenge,
        order_expires: Option<i64>,
    ) -> Result<(), OrderError> {
        client.post_challenge(&challenge.url, kid, account_key).await?;

        let deadline = self.poll_deadline(order_expires);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(OrderError::Shutdown),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            let authz = client.get_authorization(authz_url, kid, account_key).await?;
            match authz.status {
                AuthorizationStatus::Valid => return Ok(()),
                AuthorizationStatus::Pending => {}
                _ => {
                    return Err(OrderError::AuthorizationFailed(
                        authz.identifier.value.clone(),
                    ))
                }
            }

            if chrono::Utc::now().timestamp() >= deadline {
                return Err(OrderError::PollTimeout(authz_url.to_string()));
            }
        }
    }

    /// Polling never outlives the order itself nor the configured cap
    fn poll_deadline(&self, order_expires: Option<i64>) -> i64 {
        let cap = chrono::Utc::now().timestamp() + self.config.poll_max.as_secs() as i64;
        match order_expires {
            Some(expires) => cap.min(expires),
            None => cap,
        }
    }

    fn pick_challenge<'c>(
        &self,
        challenges: &'c [Challenge],
        identifier: &str,
    ) -> Result<(&'c Challenge, Arc<dyn ChallengeSolver>), OrderError> {
        for kind in CHALLENGE_PREFERENCE {
            let Some(solver) = self
                .deps
                .solvers
                .iter()
                .find(|solver| solver.kind() == kind)
            else {
                continue;
            };
            if let Some(challenge) = challenges
                .iter()
                .find(|challenge| challenge.kind == kind.acme_type())
            {
                return Ok((challenge, solver.clone()));
            }
        }
        Err(OrderError::NoSolver(identifier.to_string()))
    }

    /// Optional post-issuance hook; failures are logged, never fatal
    async fn run_post_processing(&self, cert: &certificate::Model) {
        let Some(command_line) = &cert.post_processing_command else {
            return;
        };
        let mut parts = command_line.split_whitespace();
        let Some(program) = parts.next() else {
            return;
        };

        info!(cert = %cert.name, command = %command_line, "running post-processing command");
        match tokio::process::Command::new(program)
            .args(parts)
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                debug!(cert = %cert.name, "post-processing command succeeded");
            }
            Ok(output) => {
                warn!(
                    cert = %cert.name,
                    status = ?output.status.code(),
                    "post-processing command exited non-zero"
                );
            }
            Err(e) => {
                warn!(cert = %cert.name, "post-processing command failed to start: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backoff_delay_bounded() {
        let pipeline = test_pipeline().await;

        assert_eq!(pipeline.backoff_delay(0), Duration::from_secs(30));
        assert_eq!(pipeline.backoff_delay(1), Duration::from_secs(60));
        assert_eq!(pipeline.backoff_delay(2), Duration::from_secs(120));
        // capped at 10 minutes no matter the attempt
        assert_eq!(pipeline.backoff_delay(10), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_submit_dedup_and_claim_rotation() {
        let pipeline = test_pipeline().await;

        assert!(pipeline.submit(1, 10, Priority::High));
        // same order again: no-op
        assert!(!pipeline.submit(1, 10, Priority::Low));
        // different order, same cert: queued
        assert!(pipeline.submit(2, 10, Priority::Low));
        assert_eq!(pipeline.queued_len(), 2);

        // worker 0 claims order 1, cert 10 becomes busy
        let job = pipeline.try_claim(0).unwrap();
        assert_eq!(job.order_id, 1);

        // order 2 shares the cert: not runnable, rotated in place
        assert!(pipeline.try_claim(1).is_none());
        assert_eq!(pipeline.queued_len(), 1);

        // resubmitting the active order is still a no-op
        assert!(!pipeline.submit(1, 10, Priority::High));

        // once released, order 2 becomes claimable
        pipeline.release(job);
        let job2 = pipeline.try_claim(1).unwrap();
        assert_eq!(job2.order_id, 2);
    }

    #[tokio::test]
    async fn test_high_priority_claimed_first() {
        let pipeline = test_pipeline().await;

        assert!(pipeline.submit(1, 10, Priority::Low));
        assert!(pipeline.submit(2, 20, Priority::High));

        let first = pipeline.try_claim(0).unwrap();
        assert_eq!(first.order_id, 2);
        let second = pipeline.try_claim(1).unwrap();
        assert_eq!(second.order_id, 1);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_submit_single_winner() {
        let pipeline = test_pipeline().await;

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let pipeline = pipeline.clone();
                std::thread::spawn(move || pipeline.submit(7, 70, Priority::High))
            })
            .collect();

        let accepted = handles
            .into_iter()
            .map(|h| h.join())
            .filter(|r| matches!(r, Ok(true)))
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(pipeline.queued_len(), 1);
    }

    /// A pipeline whose collaborators are never exercised; the
    /// queue-discipline tests only touch the in-memory state
    async fn test_pipeline() -> Arc<OrderPipeline> {
        let storage = Storage::connect("sqlite::memory:").await.unwrap();
        OrderPipeline::new(
            PipelineDeps {
                storage,
                acme_prod: offline_client(),
                acme_staging: offline_client(),
                solvers: Vec::new(),
            },
            PipelineConfig::default(),
            CancellationToken::new(),
        )
    }

    fn offline_client() -> Arc<AcmeClient> {
        let directory = certkeeper_acme::Directory {
            new_nonce: "http://127.0.0.1:9/new-nonce".to_string(),
            new_account: "http://127.0.0.1:9/new-acct".to_string(),
            new_order: "http://127.0.0.1:9/new-order".to_string(),
            revoke_cert: None,
            key_change: None,
            meta: None,
        };
        Arc::new(AcmeClient::with_directory("http://127.0.0.1:9/directory", directory).unwrap())
    }
}
