//! Process wiring for `run`: instance lock, store, Telegram channel, status server, signals.

use crate::channels::TelegramChannel;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::forwarder::orchestrator::{Forwarder, RunSummary};
use crate::forwarder::status;
use crate::listener::UpstreamError;
use crate::lock::InstanceLock;
use crate::store::Store;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Run the forwarder until SIGINT/SIGTERM or a fatal error.
pub async fn run_forwarder(settings: Settings) -> Result<RunSummary> {
    let lock = InstanceLock::acquire(&settings.lock_path)?;
    let store = Arc::new(Store::open(&settings.db_path, settings.pool_size).await?);

    let telegram = Arc::new(
        TelegramChannel::new(settings.bot_token.clone())
            .with_api_base(settings.api_base.clone())
            .with_poll_timeout(settings.poll_timeout_secs),
    );
    match telegram.get_me().await {
        Ok(me) => log::info!(
            "telegram channel: authenticated as @{} ({})",
            me.username.as_deref().unwrap_or("?"),
            me.id
        ),
        Err(UpstreamError::Unauthorized(e)) => {
            return Err(Error::Configuration(format!(
                "telegram rejected the bot token: {}",
                e
            )));
        }
        Err(e) => log::warn!("telegram channel: getMe failed, continuing: {}", e),
    }

    let shutdown = CancellationToken::new();
    let status_task = match &settings.status_addr {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
                Error::Configuration(format!("binding status server to {}: {}", addr, e))
            })?;
            Some(tokio::spawn(status::serve(
                listener,
                Arc::clone(&store),
                shutdown.clone(),
            )))
        }
        None => None,
    };
    let signal_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
    };

    log::info!(
        "forwarding {} source(s) to {} target(s)",
        settings.sources.len(),
        settings.targets.len()
    );
    let forwarder = Forwarder::new(
        settings.forwarder_options(),
        Arc::clone(&store),
        telegram.clone(),
        telegram,
    );
    let res = forwarder.run(shutdown.clone()).await;

    shutdown.cancel();
    signal_task.abort();
    if let Some(task) = status_task {
        if let Ok(Err(e)) = task.await {
            log::warn!("status server exited with error: {}", e);
        }
    }
    store.close().await;
    log::debug!("releasing instance lock {}", lock.path().display());
    drop(lock);
    res
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, stopping listener and draining deliveries");
}
