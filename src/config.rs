use clap::{ArgAction, Parser};
use std::time::Duration;

use crate::live::{MatchId, ReconcilerOptions};
use crate::view::ViewOptions;

/// Live match viewer
#[derive(Parser, Debug, Clone)]
#[command(name = "livematch", version, about)]
pub struct Config {
    /// WebSocket root of the live stream; matches are served at <root>/live/<id>
    #[arg(long, env = "LIVE_WS_URL", default_value = "ws://localhost:8000/ws")]
    pub live_ws_url: String,

    /// Base URL of the active match REST API (empty disables the picker and deregistration)
    #[arg(long, env = "ACTIVE_MATCH_API_URL", default_value = "http://localhost:8000")]
    pub active_match_api_url: String,

    /// Bearer token for the active match API
    #[arg(long, env = "API_TOKEN")]
    pub api_token: Option<String>,

    /// Match to bind at startup
    #[arg(long, env = "MATCH_ID")]
    pub match_id: Option<String>,

    /// Dashboard listen address
    #[arg(long, env = "DASHBOARD_ADDR", default_value = "0.0.0.0:8080")]
    pub dashboard_addr: String,

    /// Reopen the stream after it drops unexpectedly
    #[arg(long, env = "RECONNECT", default_value = "false")]
    pub reconnect: bool,

    /// Upper bound for the reconnect backoff, in seconds
    #[arg(long, env = "RECONNECT_MAX_BACKOFF_SECS", default_value = "30")]
    pub reconnect_max_backoff_secs: u64,

    /// Client ping interval on the live stream, in seconds
    #[arg(long, env = "PING_INTERVAL_SECS", default_value = "30")]
    pub ping_interval_secs: u64,

    /// Drop match updates older than the newest one applied
    #[arg(long, env = "REJECT_STALE_UPDATES", default_value = "false")]
    pub reject_stale_updates: bool,

    /// Remove a match from the active list when the viewer leaves it
    #[arg(
        long,
        env = "DEREGISTER_ON_TEARDOWN",
        action = ArgAction::Set,
        default_value_t = true
    )]
    pub deregister_on_teardown: bool,

    /// Number of recent events kept for the dashboard
    #[arg(long, env = "EVENT_LOG_CAPACITY", default_value = "50")]
    pub event_log_capacity: usize,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        let ws = url::Url::parse(&self.live_ws_url)
            .map_err(|e| anyhow::anyhow!("LIVE_WS_URL is not a valid URL: {}", e))?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            anyhow::bail!("LIVE_WS_URL must use ws:// or wss://, got {}", ws.scheme());
        }
        if let Some(api) = self.api_url() {
            let api = url::Url::parse(api)
                .map_err(|e| anyhow::anyhow!("ACTIVE_MATCH_API_URL is not a valid URL: {}", e))?;
            if !matches!(api.scheme(), "http" | "https") {
                anyhow::bail!(
                    "ACTIVE_MATCH_API_URL must use http:// or https://, got {}",
                    api.scheme()
                );
            }
        }
        if self.ping_interval_secs == 0 {
            anyhow::bail!("ping_interval_secs must be positive");
        }
        if self.reconnect_max_backoff_secs < 1 {
            anyhow::bail!("reconnect_max_backoff_secs must be at least 1");
        }
        if self.event_log_capacity == 0 {
            anyhow::bail!("event_log_capacity must be positive");
        }
        Ok(())
    }

    pub fn api_url(&self) -> Option<&str> {
        Some(self.active_match_api_url.trim()).filter(|u| !u.is_empty())
    }

    /// Blank `MATCH_ID` means nothing is selected.
    pub fn initial_match(&self) -> Option<MatchId> {
        self.match_id.as_deref().and_then(MatchId::parse)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn view_options(&self) -> ViewOptions {
        ViewOptions {
            reconnect: self.reconnect,
            max_backoff: Duration::from_secs(self.reconnect_max_backoff_secs),
            reconciler: ReconcilerOptions {
                reject_stale_updates: self.reject_stale_updates,
            },
            deregister_on_teardown: self.deregister_on_teardown,
            event_log_capacity: self.event_log_capacity,
        }
    }
}
