//! Process assembly — opens every store, wires the Mark Engine/Snapshot
//! Builder generation counter, starts the background loops, and serves the
//! HTTP surface until a shutdown signal arrives (spec §5).
//!
//! Grounded on the teacher's `api::routes::serve`: same open-stores /
//! build-router / bind-listener / `with_graceful_shutdown` shape, minus the
//! parts of the teacher's surface (agents, workspaces, MCP) this crate has
//! no use for.

use crate::account::{AccountStore, SqliteAccountStore};
use crate::config::{Config, StickyBackend};
use crate::crypto::TokenCipher;
use crate::logs::{RequestLogBuffer, SqliteRequestLogStore};
use crate::mark::MarkEngine;
use crate::proxy::{self, AppState, SelectionEventLog};
use crate::reconciler::Reconciler;
use crate::settings::DashboardSettingsStore;
use crate::sticky::{DbStickyStore, MemoryStickyStore, StickyStore};
use crate::snapshot::SnapshotBuilder;
use crate::token::TokenManager;
use crate::usage::{SqliteUsageStore, UsageStore};
use crate::usage_refresh::UsageRefresher;
use crate::debug;

use axum::Router;
use sha2::{Digest, Sha256};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Runs the server until shutdown; returns once every background task has
/// drained. Startup failures are the caller's to map to a process exit code.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let accounts: Arc<dyn AccountStore> = Arc::new(SqliteAccountStore::open(&config.accounts_database_url)?);
    let usage: Arc<dyn UsageStore> = Arc::new(SqliteUsageStore::open(&config.database_url)?);
    let settings = Arc::new(DashboardSettingsStore::open(&config.database_url)?);
    let sticky: Arc<dyn StickyStore> = match config.sticky_backend {
        StickyBackend::Memory => Arc::new(MemoryStickyStore::new()),
        StickyBackend::Db => Arc::new(DbStickyStore::open(&config.database_url)?),
    };
    let request_log_store = Arc::new(SqliteRequestLogStore::open(&config.database_url)?);

    let cipher = Arc::new(TokenCipher::load_or_create(&config.encryption_key_file).await?);
    let sticky_hmac_key = derive_sticky_hmac_key(&cipher_fingerprint(&config));

    let generation = Arc::new(AtomicU64::new(0));
    let mark = Arc::new(MarkEngine::new(accounts.clone(), settings.clone(), usage.clone(), generation.clone(), &config));
    let snapshot = Arc::new(SnapshotBuilder::new(accounts.clone(), usage.clone(), mark.clone(), generation, config.snapshot_ttl));
    let reconciler = Arc::new(Reconciler::new(accounts.clone(), snapshot.clone()));

    // No blanket `.timeout()` here: compact requests get
    // `proxy_compact_timeout` per-request, streaming requests are governed
    // by `proxy_stream_read_timeout` on each post-prelude read instead.
    let http = reqwest::Client::builder().connect_timeout(std::time::Duration::from_secs(10)).build()?;
    let tokens = Arc::new(TokenManager::new(accounts.clone(), cipher, mark.clone(), http.clone()));

    hydrate_runtime_state(&accounts, &mark).await?;

    let request_logs = if config.request_logs_buffer_enabled {
        Some(Arc::new(RequestLogBuffer::new(config.request_log_buffer_capacity)))
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    if let Some(buffer) = &request_logs {
        let buffer = buffer.clone();
        let store = request_log_store.clone();
        let batch_size = config.request_log_flush_batch_size;
        let flush_interval = config.request_log_flush_interval;
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            buffer.run_flush_loop(store, batch_size, flush_interval, rx).await;
        });
    }

    let refresher = Arc::new(UsageRefresher::new(
        accounts.clone(),
        usage.clone(),
        tokens.clone(),
        mark.clone(),
        snapshot.clone(),
        http.clone(),
        config.upstream_base_url.clone(),
        config.usage_refresh_concurrency,
    ));
    {
        let refresher = refresher.clone();
        let interval = config.usage_refresh_interval;
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            refresher.run(interval, rx).await;
        });
    }

    let state = Arc::new(AppState {
        config: config.clone(),
        accounts,
        usage,
        settings,
        sticky,
        sticky_hmac_key,
        mark,
        tokens,
        snapshot,
        reconciler,
        request_logs,
        selection_events: SelectionEventLog::new(),
        http,
    });

    let app: Router = Router::new()
        .merge(proxy::router(state.clone()))
        .merge(debug::router(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {addr}: {e}"))?;
    tracing::info!(%addr, "codex-lb listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    Ok(())
}

async fn shutdown_signal(shutdown_tx: tokio::sync::watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received, draining background loops");
    let _ = shutdown_tx.send(true);
}

/// Seeds `RuntimeAccountState` from each account's persisted `reset_at` so a
/// restart doesn't momentarily treat a still-cooling-down account as
/// eligible (spec §5 "hydrate RuntimeAccountState from persisted reset_at").
async fn hydrate_runtime_state(accounts: &Arc<dyn AccountStore>, mark: &Arc<MarkEngine>) -> anyhow::Result<()> {
    for account in accounts.list().await? {
        mark.hydrate(&account.id, account.reset_at).await;
    }
    Ok(())
}

/// A stable per-install value to derive the sticky-session HMAC key from,
/// independent of the token encryption key's raw bytes.
fn cipher_fingerprint(config: &Config) -> String {
    config.encryption_key_file.to_string_lossy().to_string()
}

fn derive_sticky_hmac_key(seed: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"codex-lb-sticky-hmac");
    hasher.update(seed.as_bytes());
    hasher.finalize().to_vec()
}
