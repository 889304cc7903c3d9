//! Process entry point: loads configuration, wires the `Gateway` to a live
//! Asterisk ARI connection and the operator front-end, and runs both until
//! shutdown.
//!
//! Grounded on the teacher's top-level binary (`discrivener`'s own `main`
//! uses `clap::Parser` to parse flags and stand up its process, logging with
//! bare `println!`/`eprintln!`); this gateway keeps the `clap::Parser` shape
//! but swaps in `tracing`-subscriber for structured diagnostics, and
//! generalizes the body to also spawn the ARI event listener and the axum
//! front-end server as independent tasks.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use gateway::config::{Cli, Config};
use gateway::conversation_log;
use gateway::pbx::{self, AriClient, PbxControlAdapter, RawAriEvent};
use gateway::tools::{SaveParametersTool, ToolRegistry};
use gateway::Gateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let pbx: Arc<dyn PbxControlAdapter> = Arc::new(AriClient::new(
        config.ari_base_url.clone(),
        config.ari_app_name.clone(),
        config.ari_username.clone(),
        config.ari_password.clone(),
    ));
    let conversation_log = conversation_log::build(config.redis_url.as_deref()).await;

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(SaveParametersTool));

    let frontend_bind = config.frontend_bind.clone();
    let ari_base_url = config.ari_base_url.clone();
    let ari_app_name = config.ari_app_name.clone();
    let ari_username = config.ari_username.clone();
    let ari_password = config.ari_password.clone();

    let gateway = Gateway::new(config, pbx, conversation_log, Arc::new(tools));

    let frontend_state = gateway.frontend_state();
    let frontend_router = gateway::frontend::router(frontend_state)
        .layer(tower_http::trace::TraceLayer::new_for_http());
    let frontend_listener = tokio::net::TcpListener::bind(&frontend_bind).await?;
    tracing::info!(bind = %frontend_bind, "operator front-end listening");
    let frontend_task = tokio::spawn(async move {
        if let Err(err) = axum::serve(frontend_listener, frontend_router).await {
            tracing::error!(%err, "operator front-end server exited");
        }
    });

    let (ari_tx, mut ari_rx) = mpsc::unbounded_channel::<RawAriEvent>();
    let ari_task = tokio::spawn(pbx::run_event_stream(
        ari_base_url,
        ari_app_name,
        ari_username,
        ari_password,
        ari_tx,
    ));

    let routing_gateway = gateway.clone();
    let routing_task = tokio::spawn(async move {
        while let Some(event) = ari_rx.recv().await {
            routing_gateway.route_ari_event(event).await;
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = frontend_task => {
            tracing::warn!("operator front-end task exited unexpectedly");
        }
        _ = routing_task => {
            tracing::warn!("ARI event routing task exited unexpectedly");
        }
    }

    ari_task.abort();
    Ok(())
}
