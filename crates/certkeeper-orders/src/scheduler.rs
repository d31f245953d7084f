//! Daily automatic ordering
//!
//! Once per day at the configured local wall-clock time the scheduler
//! re-queues every incomplete order and places renewal orders for
//! certificates nearing expiry. The run second is randomized per Let's
//! Encrypt integration guidance, chosen after the day rollover so two runs
//! never land on the same day.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, TimeZone};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use certkeeper_storage::Storage;

use crate::pipeline::{OrderPipeline, Priority};

#[derive(Debug, Clone)]
pub struct AutoOrderConfig {
    pub enabled: bool,
    /// Renew when the newest valid order expires within this many days
    pub valid_remaining_days_threshold: i64,
    /// Local wall-clock run time
    pub refresh_hour: u32,
    pub refresh_minute: u32,
    /// Gap between renewal submissions so a slew of orders does not hit the
    /// CA at once
    pub submission_spacing: Duration,
}

impl Default for AutoOrderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            valid_remaining_days_threshold: 40,
            refresh_hour: 3,
            refresh_minute: 12,
            submission_spacing: Duration::from_secs(15),
        }
    }
}

pub struct AutoOrderScheduler {
    storage: Storage,
    pipeline: Arc<OrderPipeline>,
    config: AutoOrderConfig,
    shutdown: CancellationToken,
}

impl AutoOrderScheduler {
    pub fn new(
        storage: Storage,
        pipeline: Arc<OrderPipeline>,
        config: AutoOrderConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            storage,
            pipeline,
            config,
            shutdown,
        }
    }

    /// Spawn the service loop; returns immediately when disabled
    pub fn spawn(self) {
        if !self.config.enabled {
            info!("automatic certificate ordering is disabled");
            return;
        }

        info!(
            threshold_days = self.config.valid_remaining_days_threshold,
            hour = self.config.refresh_hour,
            minute = self.config.refresh_minute,
            "starting automatic certificate ordering service"
        );

        tokio::spawn(async move { self.run().await });
    }

    async fn run(self) {
        loop {
            let sleep_for = self.until_next_run();
            debug!(sleep_secs = sleep_for.as_secs(), "auto order sleeping until next run");

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("automatic certificate ordering service shutdown complete");
                    return;
                }
                _ = tokio::time::sleep(sleep_for) => {}
            }

            self.run_once().await;
        }
    }

    /// One scheduler pass: retry incompletes, then renew expiring certs.
    /// Public so operator actions and tests can trigger a pass directly.
    pub async fn run_once(&self) {
        if let Err(e) = self.retry_incomplete_orders().await {
            error!("error retrying incomplete orders: {e}");
        }
        if let Err(e) = self.order_expiring_certs().await {
            error!("error ordering expiring certs: {e}");
        }
    }

    /// Every previously started order must eventually reach a terminal
    /// state; put all non-terminal ones back on the low priority queue
    async fn retry_incomplete_orders(&self) -> Result<(), certkeeper_storage::StorageError> {
        info!("adding incomplete orders to the order queue");

        let order_ids = self.storage.get_all_incomplete_order_ids().await?;
        for order_id in order_ids {
            match self.storage.get_order(order_id).await {
                Ok(order) => {
                    self.pipeline
                        .submit(order_id, order.certificate_id, Priority::Low);
                }
                Err(e) => error!(order_id, "failed to load incomplete order: {e}"),
            }
        }

        Ok(())
    }

    /// Place (or re-queue) renewal orders for certificates whose newest
    /// valid order expires within the threshold
    async fn order_expiring_certs(&self) -> Result<(), certkeeper_storage::StorageError> {
        info!("adding expiring certificates to the order queue");

        let cert_ids = self
            .storage
            .get_expiring_cert_ids(self.config.valid_remaining_days_threshold)
            .await?;

        for cert_id in cert_ids {
            match self
                .storage
                .get_newest_incomplete_cert_order_id(cert_id)
                .await
            {
                Ok(Some(order_id)) => {
                    // an order is already underway; just retry it
                    debug!(order_id, cert_id, "retrying existing order for expiring cert");
                    self.pipeline.submit(order_id, cert_id, Priority::Low);
                }
                Ok(None) => {
                    debug!(cert_id, "placing new renewal order for expiring cert");
                    if let Err(e) = self.pipeline.place_new_order(cert_id, Priority::Low).await {
                        error!(cert_id, "failed to place renewal order: {e}");
                    }
                }
                Err(e) => {
                    error!(cert_id, "failed to look up incomplete order: {e}");
                }
            }

            // spread submissions out; abort between items on shutdown
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("expiring certificate refresh canceled for shutdown");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.submission_spacing) => {}
            }
        }

        info!("expiring certificates added to the order queue");
        Ok(())
    }

    /// Time until the next scheduled run: today at HH:MM if still ahead,
    /// otherwise tomorrow, plus a random second offset
    fn until_next_run(&self) -> Duration {
        let now = Local::now();
        let today = now.date_naive().and_hms_opt(
            self.config.refresh_hour,
            self.config.refresh_minute,
            0,
        );

        let mut next = match today.and_then(|naive| Local.from_local_datetime(&naive).single()) {
            Some(at) => at,
            // unrepresentable local time (DST edge); fall back to a day out
            None => now + chrono::Duration::hours(24),
        };

        if next <= now {
            next += chrono::Duration::hours(24);
        }

        // random second after the rollover decision so two runs cannot land
        // on the same day
        let second = rand::thread_rng().gen_range(0..60);
        next += chrono::Duration::seconds(second);

        (next - now).to_std().unwrap_or(Duration::from_secs(1))
    }
}
