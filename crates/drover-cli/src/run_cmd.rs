//! The `drover run` command: the engine lifecycle.
//!
//! Opens the database, verifies the schema, writes a PID marker, installs
//! signal handlers, and runs the scheduler loop, the lease reaper, the
//! dependency-unblock sweep, and the agent HTTP surface until a shutdown
//! signal triggers the drain sequence.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use drover_core::github::{GithubPrCreator, PrCreator, PrRequest};
use drover_core::scheduler::{reaper, EngineShared, Scheduler};
use drover_core::server::{self, AppState};
use drover_core::verify::{
    HttpVerifier, VerificationRequest, Verdict, VerdictStatus, Verifier,
};
use drover_core::vmpool::create_vm_pool;
use drover_db::pool;

use crate::config::{self, DroverConfig};

/// Development fallback when no verifier is configured: every attempt
/// passes. A real deployment always points at an external verifier.
struct AlwaysPassVerifier;

#[async_trait]
impl Verifier for AlwaysPassVerifier {
    fn name(&self) -> &str {
        "always-pass"
    }

    async fn verify(&self, request: &VerificationRequest) -> Result<Verdict> {
        tracing::warn!(
            ticket_id = %request.ticket_id,
            "no verifier configured, passing attempt unverified"
        );
        Ok(Verdict {
            status: VerdictStatus::Passed,
            ready_for_pr: true,
            feedback_for_agent: serde_json::Value::Null,
            evidence: serde_json::json!({ "verifier": "always-pass" }),
        })
    }
}

/// Fallback when no GitHub token is configured. Every PR attempt fails,
/// which parks verified tickets in `needs_review` instead of losing them.
struct DisabledPrCreator;

#[async_trait]
impl PrCreator for DisabledPrCreator {
    async fn create_pr(&self, request: &PrRequest) -> Result<String> {
        anyhow::bail!(
            "PR creation disabled (no GitHub token configured); branch {} is pushed and waiting",
            request.head_branch
        )
    }
}

pub async fn run(config: DroverConfig) -> Result<()> {
    // 1. Database: connect, ensure it exists, verify schema.
    pool::ensure_database_exists(&config.db_config).await?;
    let pg = pool::create_pool(&config.db_config).await?;
    pool::run_migrations(&pg).await?;

    // 2. PID marker.
    let pid_path = config::pid_path();
    if let Some(dir) = pid_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    std::fs::write(&pid_path, std::process::id().to_string())
        .with_context(|| format!("failed to write PID marker at {}", pid_path.display()))?;

    // 3. Collaborators.
    let scheduler_config = config.engine.scheduler_config();

    let vm_base_dir = config
        .engine
        .vm_base_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir)
        .join("drover-slots");
    let vm_pool = create_vm_pool(
        &config.engine.vm_pool,
        &vm_base_dir,
        scheduler_config.max_concurrent,
    )?;

    let verifier: Arc<dyn Verifier> = match &config.verifier_url {
        Some(url) => Arc::new(HttpVerifier::new(url.clone())),
        None => {
            tracing::warn!("no verifier configured; attempts will pass unverified");
            Arc::new(AlwaysPassVerifier)
        }
    };

    let pr_creator: Arc<dyn PrCreator> = match &config.github_token {
        Some(token) => Arc::new(GithubPrCreator::new(token.clone())),
        None => {
            tracing::warn!("no GitHub token configured; verified tickets will park in needs_review");
            Arc::new(DisabledPrCreator)
        }
    };

    let shared = Arc::new(EngineShared::new(scheduler_config.max_concurrent));

    // 4. Signal handling.
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    // 5. Background tasks.
    let reaper_task = tokio::spawn(reaper::run_reaper(
        pg.clone(),
        Arc::clone(&vm_pool),
        Arc::clone(&shared),
        scheduler_config.reaper_interval,
        cancel.clone(),
    ));
    let sweep_task = tokio::spawn(reaper::run_unblock_sweep(
        pg.clone(),
        scheduler_config.sweep_interval,
        cancel.clone(),
    ));

    let app_state = AppState {
        pool: pg.clone(),
        shared: Arc::clone(&shared),
        verifier: Arc::clone(&verifier),
        pr_creator: Arc::clone(&pr_creator),
        policies: scheduler_config.policies.clone(),
        lease_secs: scheduler_config.lease_secs,
    };
    let bind = config.engine.bind.clone();
    let port = config.engine.port;
    let server_cancel = cancel.clone();
    let server_task =
        tokio::spawn(async move { server::run_server(app_state, &bind, port, server_cancel).await });

    // 6. The scheduler loop runs in the foreground; it returns after the
    // drain sequence completes.
    let scheduler = Scheduler::new(
        pg.clone(),
        vm_pool,
        verifier,
        pr_creator,
        scheduler_config,
        shared,
    );
    tracing::info!("engine started");
    let result = scheduler.run(cancel.clone()).await;

    // 7. Shutdown: the cancel token has fired (or the scheduler errored);
    // collect the background tasks and drop the PID marker.
    cancel.cancel();
    let _ = reaper_task.await;
    let _ = sweep_task.await;
    if let Ok(Err(e)) = server_task.await {
        tracing::warn!(error = %e, "agent surface exited with error");
    }

    if let Err(e) = std::fs::remove_file(&pid_path) {
        tracing::debug!(error = %e, "failed to remove PID marker");
    }

    pg.close().await;
    tracing::info!("engine stopped");
    result
}

async fn shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("ctrl-c received");
    }
    cancel.cancel();
}
