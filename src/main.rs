//! CertKeeper - self-hosted ACME certificate management backend
//!
//! Obtains and renews certificates from ACME CAs, stores the key material,
//! and serves it back to authorized clients over an authenticated channel.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use certkeeper_acme::AcmeClient;
use certkeeper_api::{build_router, AppCert, AppState};
use certkeeper_orders::{
    AutoOrderConfig, AutoOrderScheduler, OrderPipeline, PipelineConfig, PipelineDeps,
};
use certkeeper_solvers::{ChallengeSolver, CloudflareConfig, Dns01CloudflareSolver, Http01Solver};
use certkeeper_storage::Storage;

use config::Config;

/// CertKeeper - keep your certificates valid indefinitely
#[derive(Parser, Debug)]
#[command(name = "certkeeper")]
#[command(about = "Self-hosted ACME certificate management backend")]
#[command(version)]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "./config.json", env = "CERTKEEPER_CONFIG")]
    config: PathBuf,

    /// Force dev mode (plain HTTP api, no download HTTPS gate)
    #[arg(long)]
    dev_mode: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // one process-wide TLS crypto provider; both the listener and the http
    // clients build rustls configs
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let mut config = Config::load(&cli.config)?;
    if cli.dev_mode {
        config.dev_mode = true;
    }
    if config.dev_mode {
        warn!("dev mode enabled: api served over plain http, download gate lifted");
    }

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();

    // leaves first: storage, then the services that consume it
    if let Some(parent) = std::path::Path::new(&config.db_file).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory {parent:?}"))?;
    }
    let storage = Storage::connect(&config.db_url())
        .await
        .context("storage startup failed")?;

    let acme_prod = Arc::new(
        AcmeClient::connect(&config.acme.prod_dir_url)
            .await
            .context("prod acme directory unreachable")?,
    );
    let acme_staging = Arc::new(
        AcmeClient::connect(&config.acme.staging_dir_url)
            .await
            .context("staging acme directory unreachable")?,
    );

    let mut solvers: Vec<Arc<dyn ChallengeSolver>> = Vec::new();
    if config.http01_internal.enable {
        let solver = Http01Solver::new();
        solver
            .start(config.http01_internal.port, shutdown.clone())
            .await
            .context("http-01 responder failed to start")?;
        solvers.push(Arc::new(solver));
    }
    if config.dns01_cloudflare.enable {
        // zero matching zones is a config error and aborts startup
        let solver = Dns01CloudflareSolver::connect(
            CloudflareConfig {
                api_token: config.dns01_cloudflare.api_token.clone(),
                domains: config.dns01_cloudflare.domains.clone(),
                api_url: None,
                doh_url: None,
                propagation_timeout_secs: 120,
                poll_interval_secs: 10,
            },
            shutdown.clone(),
        )
        .await
        .context("dns-01 cloudflare provider failed to start")?;
        solvers.push(Arc::new(solver));
    }
    if solvers.is_empty() {
        warn!("no challenge solvers enabled; orders cannot be fulfilled");
    }

    let pipeline = OrderPipeline::new(
        PipelineDeps {
            storage: storage.clone(),
            acme_prod: acme_prod.clone(),
            acme_staging: acme_staging.clone(),
            solvers,
        },
        PipelineConfig {
            worker_count: config.orders.worker_count,
            ..Default::default()
        },
        shutdown.clone(),
    );
    pipeline.start_workers();

    AutoOrderScheduler::new(
        storage.clone(),
        pipeline.clone(),
        AutoOrderConfig {
            enabled: config.orders.automatic_ordering_enable,
            valid_remaining_days_threshold: config.orders.valid_remaining_days_threshold,
            refresh_hour: config.orders.refresh_time_hour,
            refresh_minute: config.orders.refresh_time_minute,
            ..Default::default()
        },
        shutdown.clone(),
    )
    .spawn();

    let state = Arc::new(AppState {
        storage: storage.clone(),
        pipeline,
        acme_prod,
        acme_staging,
        dev_mode: config.dev_mode,
        is_https: !config.dev_mode,
    });
    let router = build_router(state);

    // serve: TLS with the hot-swappable pair, or plain http in dev mode
    let server = if config.dev_mode {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            certkeeper_api::serve_dev_http(router, addr, server_shutdown).await
        })
    } else {
        let appcert = AppCert::load(
            storage,
            &config.private_key_name,
            &config.certificate_name,
            &config.hostname,
        )
        .await
        .context("listener certificate setup failed")?;
        let rustls = appcert.rustls_config();
        appcert.spawn_refresher(shutdown.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], config.https_port));
        let server_shutdown = shutdown.clone();
        tokio::spawn(
            async move { certkeeper_api::serve_https(router, addr, rustls, server_shutdown).await },
        )
    };

    // run until ctrl-c or the server dies on its own
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    tokio::pin!(server);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("shutdown signal received");
            shutdown.cancel();

            // bounded drain; pipeline workers stop at their next poll boundary
            match tokio::time::timeout(Duration::from_secs(15), &mut server).await {
                Ok(Ok(Ok(()))) => info!("api server stopped"),
                Ok(Ok(Err(e))) => error!("api server error during drain: {e}"),
                Ok(Err(e)) => error!("api server task panicked: {e}"),
                Err(_) => warn!("shutdown drain timed out"),
            }
        }
        result = &mut server => {
            shutdown.cancel();
            match result {
                Ok(Ok(())) => info!("api server stopped"),
                Ok(Err(e)) => return Err(e).context("api server failed"),
                Err(e) => return Err(e).context("api server task panicked"),
            }
        }
    }

    info!("certkeeper shutdown complete");
    Ok(())
}
