//! Process wiring: one correlation store shared by the callback listener and the MCP
//! transport, plus the TTL sweeper. Everything stops on SIGINT/SIGTERM.

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::callback::{self, CallbackState};
use crate::config::{self, Config};
use crate::correlation::CorrelationStore;
use crate::mcp::TelephonyServer;
use crate::tools::ToolFacade;
use crate::vonage::{TelephonyProvider, VonageClient};

/// Run the callback receiver and the MCP server until a shutdown signal.
/// With `stdio`, MCP is served on stdin/stdout instead of HTTP and the process also
/// exits when the client closes the stream.
pub async fn run_server(config: Config, stdio: bool) -> Result<()> {
    let store = Arc::new(CorrelationStore::from_config(&config.correlation));
    let provider: Arc<dyn TelephonyProvider> =
        Arc::new(VonageClient::new(config.vonage.clone(), &config.callback));
    let tools = ToolFacade::from_config(provider, store.clone(), &config);
    if config.vonage.virtual_number.is_none() {
        log::warn!("no virtual number configured (vonage.virtualNumber or VONAGE_LVN); every tool call must pass `from`");
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            log::info!("shutdown signal received, draining connections");
            shutdown.cancel();
        });
    }
    let sweeper = spawn_sweeper(
        store.clone(),
        config.correlation.sweep_interval(),
        shutdown.clone(),
    );

    let callback_listener =
        bind("callback receiver", &config.callback.bind, config.callback.port).await?;
    log::info!(
        "callback receiver public url: {} (voice events at {})",
        config.callback.public_url,
        config.callback.url_for(&config.callback.voice_event_path)
    );
    let callback_app = callback::router(
        CallbackState::new(store.clone(), &config.callback),
        &config.callback,
    )?;
    let callback_task = tokio::spawn(serve(
        "callback receiver",
        callback_listener,
        callback_app,
        shutdown.clone(),
    ));

    let mcp_result = if stdio {
        serve_stdio(tools, shutdown.clone()).await
    } else {
        let listener = bind("mcp server", &config.mcp.bind, config.mcp.port).await?;
        let app = mcp_router(tools, &config.mcp.path, shutdown.clone())?;
        serve("mcp server", listener, app, shutdown.clone()).await
    };
    // Either transport ending takes the whole process down.
    shutdown.cancel();

    let callback_result = callback_task
        .await
        .context("callback receiver task panicked")?;
    join_sweeper(sweeper).await;
    mcp_result?;
    callback_result?;
    log::info!("telephony server stopped");
    Ok(())
}

/// HTTP router for the MCP streamable HTTP transport, mounted at `path`.
pub fn mcp_router(tools: ToolFacade, path: &str, shutdown: CancellationToken) -> Result<Router> {
    let path = path.trim();
    if !path.starts_with('/') || path == "/" {
        anyhow::bail!("mcp.path must start with '/' and not be the root (got {:?})", path);
    }
    // One server value per MCP session; they all share the facade (and its store).
    let service_factory = move || Ok(TelephonyServer::new(tools.clone()));
    let service = StreamableHttpService::new(
        service_factory,
        Arc::new(LocalSessionManager::default()),
        StreamableHttpServerConfig {
            cancellation_token: shutdown.child_token(),
            ..Default::default()
        },
    );
    Ok(Router::new()
        .route("/", get(health_http))
        .nest_service(path, service))
}

/// GET / on the MCP listener.
async fn health_http() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "service": "telephony mcp server" }))
}

async fn serve_stdio(tools: ToolFacade, shutdown: CancellationToken) -> Result<()> {
    log::info!("mcp server on stdio");
    let transport = rmcp::transport::io::stdio();
    let service = rmcp::serve_server(TelephonyServer::new(tools), transport)
        .await
        .context("starting mcp stdio transport")?;
    let cancel = service.cancellation_token();
    tokio::select! {
        res = service.waiting() => {
            let reason = res.context("mcp stdio transport")?;
            log::info!("mcp stdio session ended: {:?}", reason);
        }
        _ = shutdown.cancelled() => {
            cancel.cancel();
        }
    }
    Ok(())
}

async fn bind(what: &str, host: &str, port: u16) -> Result<TcpListener> {
    let host = host.trim();
    if !config::is_loopback_bind(host) {
        log::warn!("{} binding to non-loopback address {}", what, host);
    }
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {} to {}", what, addr))?;
    log::info!("{} listening on {}", what, addr);
    Ok(listener)
}

async fn serve(
    what: &'static str,
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .with_context(|| format!("{} exited", what))?;
    log::info!("{} stopped", what);
    Ok(())
}

/// Periodically drop correlation entries untouched for longer than the TTL.
pub fn spawn_sweeper(
    store: Arc<CorrelationStore>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = store.evict_expired();
                    if evicted > 0 {
                        log::debug!("sweeper: evicted {} expired correlation entries", evicted);
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    })
}

/// Wait for the sweeper to stop. Returns false (and logs) when it panicked or was aborted.
async fn join_sweeper(handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            log::warn!("correlation sweeper ended abnormally: {}", e);
            false
        }
    }
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
