/*
 * Responsibility
 * - Config読み込み → 依存生成 → Router 組み立て
 * - 入場判定チェーンの適用と eviction task の起動/停止
 * - axum::serve() で起動 (graceful shutdown)
 */
use std::sync::Arc;
use std::{panic, process};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::limiter::{self, RateLimiterStore};
use crate::pipeline::{self, Settings};
use crate::services::forward::{ForwardingDispatcher, HttpForwarder};
use crate::services::probe::HttpResourceProbe;
use crate::services::replicate::{RestUserReplicator, UserReplicator};
use crate::services::ticket::CasTicketClient;
use crate::state::AppState;

fn init_tracing() {
    // Prefer RUST_LOG if set; otherwise use a sensible default.
    // Ex:
    // RUST_LOG=info,sso_gate=debug,tower_http=debug cargo run
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn init_panic_hook(abort_on_panic: bool) {
    // Keep the default hook as a fallback (prints to stderr with location/payload).
    let default_hook = panic::take_hook();

    panic::set_hook(Box::new(move |info| {
        // Always surface panics via tracing so they don't get "lost"
        // (stderr can be hidden depending on how the process is launched.)
        tracing::error!(?info, "panic");

        // In development, fail fast: crash the whole process so we notice immediately.
        // In production, prefer the default behavior (stderr) and let the server keep running.
        if abort_on_panic {
            process::abort();
        } else {
            default_hook(info);
        }
    }))
}

pub async fn run() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("could not load configuration")?;
    init_panic_hook(!config.app_env.is_production());

    let settings = pipeline::build_settings(&config).context("could not compose pipeline")?;
    let state = build_state(&config, settings)?;
    let router = pipeline::build_router(state.clone());

    let (stop_tx, stop_rx) = watch::channel(false);
    let sweeper = limiter::spawn_eviction_task(
        state.limiter.clone(),
        config.limiter_eviction_interval,
        stop_rx,
    );

    tracing::info!(
        addr = %config.addr,
        target = %state.settings.target,
        "starting authenticating reverse proxy in {:?} mode",
        config.app_env
    );

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .context("failed to bind listen address")?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Stop the eviction sweep before leaving so the task does not outlive
    // the server.
    stop_tx.send(true).ok();
    sweeper.await.ok();

    Ok(())
}

fn build_state(config: &Config, settings: Settings) -> Result<AppState> {
    let http = reqwest::Client::builder()
        .danger_accept_invalid_certs(config.skip_ssl_verification)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("failed to build http client")?;

    let limiter = Arc::new(RateLimiterStore::new(
        config.limiter_token_rate,
        config.limiter_burst_size,
    ));
    let tickets = Arc::new(CasTicketClient::new(
        &settings.cas_url,
        &settings.service_url,
        http.clone(),
    ));
    let forwarder = Arc::new(HttpForwarder::new(http.clone()));
    let dispatcher = Arc::new(ForwardingDispatcher::new(
        settings.target.clone(),
        settings.principal_header.clone(),
        forwarder,
    ));
    let probe = Arc::new(HttpResourceProbe::new(http.clone()));
    let replicator = settings.replication.as_ref().map(|r| {
        Arc::new(RestUserReplicator::new(
            http.clone(),
            r.url.clone(),
            r.username.clone(),
            r.password.clone(),
        )) as Arc<dyn UserReplicator>
    });

    Ok(AppState::new(
        settings, limiter, tickets, dispatcher, probe, replicator,
    ))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
