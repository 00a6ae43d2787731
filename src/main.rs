use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

mod config;
mod dashboard;
mod live;
mod registry;
mod view;

use config::Config;
use dashboard::AppState;
use live::{ConnectionManager, Connector, WsConnector};
use registry::{ActiveMatchClient, Session};
use view::{LiveView, ViewCommand};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let registry = match config.api_url() {
        Some(api_url) => {
            let session = config.api_token.clone().map(|access_token| Session { access_token });
            if session.is_none() {
                warn!("API_TOKEN not set; active match API requests will be anonymous");
            }
            Some(ActiveMatchClient::new(api_url, session)?)
        }
        None => {
            info!("No active match API configured; picker and deregistration disabled");
            None
        }
    };

    let connector: Arc<dyn Connector> = Arc::new(WsConnector);
    let manager = ConnectionManager::new(connector, &config.live_ws_url, config.ping_interval())?;
    info!("Live stream root: {}", config.live_ws_url);

    let (mut view, frames) = LiveView::new(manager, registry.clone(), config.view_options());
    match config.initial_match() {
        Some(match_id) => {
            info!("Binding initial match {}", match_id);
            view.bind(Some(match_id));
        }
        None => info!("No match selected; waiting for one from the dashboard"),
    }

    let (commands, command_rx) = mpsc::channel::<ViewCommand>(16);
    tokio::spawn(view.run(command_rx));

    // Start the dashboard HTTP server
    let app = dashboard::router(AppState {
        frames,
        commands,
        registry,
    });
    let addr: SocketAddr = config.dashboard_addr.parse()?;
    info!("Dashboard listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Run dashboard server (blocks until shutdown)
    axum::serve(listener, app).await?;

    Ok(())
}
