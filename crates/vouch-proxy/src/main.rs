//! vouch-proxy daemon entry point.
//!
//! Wires the singletons (store, signer, worker, gateway, policy) into the
//! shared state, starts the proxy and control listeners, reloads the
//! policy on SIGHUP, and drains the ledger worker on shutdown.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vouch_core::policy::{PolicyConfig, PolicyHandle};
use vouch_core::worker::{LedgerWorker, WorkerConfig};
use vouch_core::{ApprovalGateway, Signer, Store};
use vouch_proxy::config::Args;
use vouch_proxy::state::{ProxyState, SharedState};
use vouch_proxy::{control, interceptor};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("vouch - the interceptor");

    let policy = PolicyConfig::from_file(&args.policy)
        .with_context(|| format!("failed to load policy from {}", args.policy.display()))?;
    info!(
        version = %policy.version,
        rules = policy.policies.len(),
        "loaded policy"
    );

    let store = Store::open(&args.db)
        .with_context(|| format!("failed to open ledger at {}", args.db.display()))?;
    let signer = Signer::load_or_generate(&args.key_file)
        .with_context(|| format!("failed to load signer from {}", args.key_file.display()))?;

    let worker = LedgerWorker::start(
        store.clone(),
        signer,
        WorkerConfig {
            queue_capacity: args.queue_capacity,
            agent: args.agent.clone(),
        },
    )
    .context("failed to start ledger worker")?;

    let state: SharedState = Arc::new(ProxyState {
        worker,
        gateway: ApprovalGateway::new(),
        policy: PolicyHandle::new(policy),
        store,
        upstream: reqwest::Client::builder()
            .timeout(Duration::from_secs(args.upstream_timeout_secs))
            .build()
            .context("failed to build upstream client")?,
        upstream_url: args.upstream.clone(),
        active_tasks: dashmap::DashMap::new(),
        last_event_by_task: dashmap::DashMap::new(),
        stall_timeout: args.stall_timeout_secs.map(Duration::from_secs),
    });
    state
        .recover_tasks()
        .context("failed to recover task state from ledger")?;

    spawn_policy_reload(Arc::clone(&state), args.policy.clone());

    let control_listener = tokio::net::TcpListener::bind(args.control)
        .await
        .with_context(|| format!("failed to bind control API on {}", args.control))?;
    info!(addr = %args.control, "control API listening");
    tokio::spawn(axum::serve(control_listener, control::router(Arc::clone(&state))).into_future());

    let proxy_listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind proxy on {}", args.listen))?;
    info!(
        listen = %args.listen,
        upstream = %args.upstream,
        queue_capacity = args.queue_capacity,
        "ready to intercept tool traffic"
    );
    tokio::spawn(axum::serve(proxy_listener, interceptor::router(Arc::clone(&state))).into_future());

    wait_for_shutdown().await;

    info!("shutting down: draining ledger worker");
    state.worker.shutdown().await;
    Ok(())
}

/// Reloads the policy file on SIGHUP; a bad file keeps the old policy.
fn spawn_policy_reload(state: SharedState, path: std::path::PathBuf) {
    tokio::spawn(async move {
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(hup) => hup,
            Err(e) => {
                error!(error = %e, "cannot install SIGHUP handler; policy reload disabled");
                return;
            },
        };
        while hup.recv().await.is_some() {
            match PolicyConfig::from_file(&path) {
                Ok(policy) => {
                    info!(rules = policy.policies.len(), "policy reloaded");
                    state.policy.swap(policy);
                },
                Err(e) => error!(error = %e, "policy reload failed; keeping previous policy"),
            }
        }
    });
}

async fn wait_for_shutdown() {
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = term.recv() => info!("received SIGTERM"),
    }
}
