use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::live::{DerivedView, MatchId};
use crate::registry::ActiveMatchClient;
use crate::view::{LiveFrame, ViewCommand};

#[derive(Clone)]
pub struct AppState {
    pub frames: watch::Receiver<LiveFrame>,
    pub commands: mpsc::Sender<ViewCommand>,
    pub registry: Option<ActiveMatchClient>,
}

/// Build the Axum router for the dashboard.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/live", get(live_handler))
        .route("/api/matches", get(matches_handler).post(register_handler))
        .route(
            "/api/matches/:id",
            get(match_handler).patch(end_match_handler).delete(delete_match_handler),
        )
        .route("/api/watch/:id", post(watch_handler))
        .route("/api/watch", delete(unwatch_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

async fn index_handler() -> impl IntoResponse {
    Html(DASHBOARD_HTML)
}

#[derive(Debug, Serialize)]
struct LivePayload {
    frame: LiveFrame,
    view: Option<DerivedView>,
}

/// GET /api/live
async fn live_handler(State(state): State<Arc<AppState>>) -> Json<LivePayload> {
    let frame = state.frames.borrow().clone();
    let view = frame.snapshot.as_deref().map(DerivedView::of);
    Json(LivePayload { frame, view })
}

#[derive(Debug, Serialize)]
struct MatchOption {
    id: i64,
    match_uuid: String,
    label: String,
    created_at: DateTime<Utc>,
}

/// GET /api/matches
async fn matches_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let matches = registry(&state)?.list().await.map_err(upstream)?;
    let options: Vec<MatchOption> = matches
        .into_iter()
        .filter(|m| m.ended_at.is_none())
        .map(|m| MatchOption {
            label: m.label(),
            id: m.id,
            match_uuid: m.match_uuid,
            created_at: m.created_at,
        })
        .collect();
    Ok(Json(options))
}

fn registry(state: &AppState) -> Result<&ActiveMatchClient, (StatusCode, String)> {
    state.registry.as_ref().ok_or((
        StatusCode::SERVICE_UNAVAILABLE,
        "no active match API configured".to_string(),
    ))
}

fn upstream(e: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::BAD_GATEWAY, format!("{:#}", e))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    match_uuid: String,
}

/// POST /api/matches
async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let Some(match_id) = MatchId::parse(&req.match_uuid) else {
        return Err((StatusCode::BAD_REQUEST, "match_uuid is blank".to_string()));
    };
    let created = registry(&state)?.create(&match_id).await.map_err(upstream)?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/matches/:id
async fn match_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    registry(&state)?.get(id).await.map(Json).map_err(upstream)
}

/// PATCH /api/matches/:id marks the match ended
async fn end_match_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    registry(&state)?.end(id).await.map(Json).map_err(upstream)
}

/// DELETE /api/matches/:id
async fn delete_match_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, (StatusCode, String)> {
    registry(&state)?.delete(id).await.map_err(upstream)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn send_command(
    state: &AppState,
    command: ViewCommand,
) -> Result<StatusCode, (StatusCode, String)> {
    state.commands.send(command).await.map_err(|_| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "live view is not running".to_string(),
        )
    })?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /api/watch/:id
async fn watch_handler(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let Some(match_id) = MatchId::parse(&raw) else {
        return Err((StatusCode::BAD_REQUEST, "match id is blank".to_string()));
    };
    info!("Dashboard selected match {}", match_id);
    send_command(&state, ViewCommand::Watch(Some(match_id))).await
}

/// DELETE /api/watch
async fn unwatch_handler(
    State(state): State<Arc<AppState>>,
) -> Result<StatusCode, (StatusCode, String)> {
    info!("Dashboard cleared match selection");
    send_command(&state, ViewCommand::Watch(None)).await
}

/// Embedded single-file dashboard (HTML + CSS + JS)
const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Live Match</title>
<style>
  :root {
    --bg: #0f1117;
    --card: #1a1d27;
    --border: #2a2d3a;
    --accent: #6c63ff;
    --blue: #4fa3ff;
    --red: #ff4f6a;
    --green: #00c896;
    --text: #e0e0e0;
    --muted: #8888aa;
  }
  * { box-sizing: border-box; margin: 0; padding: 0; }
  body { background: var(--bg); color: var(--text); font-family: 'Segoe UI', system-ui, sans-serif; }
  header { display: flex; align-items: center; gap: 1rem; padding: 1rem 2rem; border-bottom: 1px solid var(--border); }
  header h1 { font-size: 1.4rem; font-weight: 700; }
  .badge { padding: .2rem .6rem; border-radius: 4px; font-size: .75rem; font-weight: 700; text-transform: uppercase; background: var(--border); color: var(--muted); }
  .badge.live { background: var(--green); color: #000; }
  .badge.reconnecting, .badge.connecting { background: #ff9800; color: #000; }
  .badge.closed { background: var(--red); color: #000; }
  .status-dot { width: 10px; height: 10px; border-radius: 50%; background: var(--muted); display: inline-block; }
  .status-dot.live { background: var(--green); animation: pulse 1.5s infinite; }
  @keyframes pulse { 0%,100% { opacity: 1; } 50% { opacity: .3; } }
  main { padding: 1.5rem 2rem; display: grid; gap: 1.5rem; }
  .picker { display: flex; gap: .6rem; align-items: center; }
  .picker select, .picker input { background: var(--card); border: 1px solid var(--border); color: var(--text); padding: .35rem .6rem; border-radius: 6px; font-size: .85rem; }
  .picker input { width: 22rem; }
  .btn { background: none; border: 1px solid var(--border); color: var(--muted); padding: .3rem .8rem; border-radius: 6px; cursor: pointer; font-size: .8rem; }
  .btn:hover { border-color: var(--accent); color: var(--accent); }
  .stats-grid { display: grid; grid-template-columns: repeat(auto-fill, minmax(180px, 1fr)); gap: 1rem; }
  .stat-card { background: var(--card); border: 1px solid var(--border); border-radius: 10px; padding: 1.2rem; }
  .stat-card .label { color: var(--muted); font-size: .8rem; text-transform: uppercase; letter-spacing: .06em; margin-bottom: .4rem; }
  .stat-card .value { font-size: 1.7rem; font-weight: 700; }
  .panel { background: var(--card); border: 1px solid var(--border); border-radius: 10px; overflow: hidden; }
  .panel-header { padding: .9rem 1.2rem; border-bottom: 1px solid var(--border); font-weight: 600; display: flex; justify-content: space-between; align-items: center; }
  .panel-header.blue { color: var(--blue); }
  .panel-header.red { color: var(--red); }
  .panel-header small { color: var(--muted); font-weight: 400; }
  table { width: 100%; border-collapse: collapse; }
  th { padding: .7rem 1rem; text-align: left; font-size: .75rem; text-transform: uppercase; color: var(--muted); border-bottom: 1px solid var(--border); }
  td { padding: .65rem 1rem; font-size: .88rem; border-bottom: 1px solid #1e2130; }
  tr:last-child td { border-bottom: none; }
  .two-col { display: grid; grid-template-columns: 1fr 1fr; gap: 1.5rem; }
  @media (max-width: 768px) { .two-col { grid-template-columns: 1fr; } }
  .empty { color: var(--muted); text-align: center; padding: 2rem; font-size: .9rem; }
  .muted { color: var(--muted); }
</style>
</head>
<body>
<header>
  <span class="status-dot" id="dot"></span>
  <h1>Live Match</h1>
  <span class="badge" id="conn-badge">…</span>
  <span style="margin-left:auto;color:var(--muted);font-size:.8rem;" id="last-updated"></span>
</header>

<main>
  <div class="picker">
    <select id="match-select"><option value="">Active matches…</option></select>
    <input id="match-input" placeholder="or paste a match id">
    <button class="btn" onclick="watchSelected()">Watch</button>
    <button class="btn" onclick="unwatch()">Stop</button>
    <button class="btn" onclick="loadMatches()">↻</button>
  </div>

  <div class="stats-grid">
    <div class="stat-card"><div class="label">Map</div><div class="value" id="s-map">–</div></div>
    <div class="stat-card"><div class="label">Mode</div><div class="value" id="s-mode">–</div></div>
    <div class="stat-card"><div class="label">State</div><div class="value" id="s-state">–</div></div>
    <div class="stat-card"><div class="label">Score</div><div class="value" id="s-score">–</div></div>
    <div class="stat-card"><div class="label">Round</div><div class="value" id="s-round">–</div></div>
  </div>

  <div class="two-col">
    <div class="panel">
      <div class="panel-header blue">Blue <small id="blue-summary"></small></div>
      <table>
        <thead><tr><th>Player</th><th>Agent</th><th>Rank</th><th>RR</th><th>Level</th></tr></thead>
        <tbody id="blue-tbody"><tr><td colspan="5" class="empty">Waiting for data…</td></tr></tbody>
      </table>
    </div>
    <div class="panel">
      <div class="panel-header red">Red <small id="red-summary"></small></div>
      <table>
        <thead><tr><th>Player</th><th>Agent</th><th>Rank</th><th>RR</th><th>Level</th></tr></thead>
        <tbody id="red-tbody"><tr><td colspan="5" class="empty">Waiting for data…</td></tr></tbody>
      </table>
    </div>
  </div>

  <div class="panel">
    <div class="panel-header">Recent Events</div>
    <table>
      <thead><tr><th>Time</th><th>Type</th><th>Result</th></tr></thead>
      <tbody id="events-tbody"><tr><td colspan="3" class="empty">No events yet</td></tr></tbody>
    </table>
  </div>
</main>

<script>
const esc = s => String(s ?? '').replace(/[&<>"']/g, c => ({'&':'&amp;','<':'&lt;','>':'&gt;','"':'&quot;',"'":'&#39;'}[c]));
const dash = v => v == null ? '–' : esc(v);
const applied = a => typeof a === 'string' ? a : 'ignored: ' + a.ignored;

function playerRows(players) {
  if (!players.length) return '<tr><td colspan="5" class="empty">No players</td></tr>';
  return players.map(p => `<tr>
    <td>${esc(p.game_name || p.subject.slice(0, 8))}${p.leaderboard_rank ? ` <span class="muted">#${p.leaderboard_rank}</span>` : ''}</td>
    <td>${esc(p.character)}</td>
    <td>${esc(p.rank)}</td>
    <td>${dash(p.rr)}</td>
    <td>${dash(p.account_level)}</td>
  </tr>`).join('');
}

function summary(s) {
  if (!s) return '';
  const parts = [s.players + ' players'];
  if (s.average_account_level != null) parts.push('avg lvl ' + s.average_account_level);
  if (s.top_leaderboard_rank != null) parts.push('best #' + s.top_leaderboard_rank);
  return parts.join(' · ');
}

async function loadLive() {
  const r = await fetch('/api/live');
  if (!r.ok) return;
  const { frame, view } = await r.json();

  const status = frame.connection.status;
  const badge = document.getElementById('conn-badge');
  badge.textContent = status === 'reconnecting' ? `reconnecting in ${frame.connection.in_secs}s`
    : status === 'closed' ? `closed (${frame.connection.reason})`
    : status;
  badge.className = 'badge ' + status;
  document.getElementById('dot').className = 'status-dot ' + status;

  const snap = frame.snapshot;
  if (!frame.match_id) {
    document.getElementById('s-state').textContent = 'No match selected';
  } else if (frame.ended && !snap) {
    document.getElementById('s-state').textContent = 'Match ended';
  }
  if (snap && view) {
    document.getElementById('s-map').textContent = view.map;
    document.getElementById('s-mode').textContent = view.mode;
    document.getElementById('s-state').textContent = view.state;
    document.getElementById('s-score').textContent = `${snap.party_owner_score} – ${snap.party_owner_enemy_score}`;
    document.getElementById('s-round').textContent = snap.round ? `${snap.round.round} (${snap.round.roundPhase})` : '–';
    document.getElementById('blue-tbody').innerHTML = playerRows(view.blue);
    document.getElementById('red-tbody').innerHTML = playerRows(view.red);
    document.getElementById('blue-summary').textContent = summary(view.blue_summary);
    document.getElementById('red-summary').textContent = summary(view.red_summary);
  } else {
    ['s-map', 's-mode', 's-score', 's-round'].forEach(id => document.getElementById(id).textContent = '–');
    ['blue-tbody', 'red-tbody'].forEach(id =>
      document.getElementById(id).innerHTML = '<tr><td colspan="5" class="empty">Waiting for data…</td></tr>');
    ['blue-summary', 'red-summary'].forEach(id => document.getElementById(id).textContent = '');
  }

  const tbody = document.getElementById('events-tbody');
  if (!frame.events.length) {
    tbody.innerHTML = '<tr><td colspan="3" class="empty">No events yet</td></tr>';
  } else {
    tbody.innerHTML = frame.events.slice().reverse().map(e => `<tr>
      <td>${new Date(e.at).toLocaleTimeString()}</td>
      <td>${esc(e.kind.replace(/_/g, ' '))}</td>
      <td>${esc(applied(e.applied))}</td>
    </tr>`).join('');
  }
  document.getElementById('last-updated').textContent = 'Updated ' + new Date(frame.updated_at).toLocaleTimeString();
}

async function loadMatches() {
  const r = await fetch('/api/matches');
  if (!r.ok) return;
  const matches = await r.json();
  const select = document.getElementById('match-select');
  select.innerHTML = '<option value="">Active matches…</option>' + matches.map(m =>
    `<option value="${esc(m.match_uuid)}">${esc(m.label)} · ${new Date(m.created_at).toLocaleTimeString()}</option>`).join('');
}

async function watchSelected() {
  const typed = document.getElementById('match-input').value.trim();
  const id = typed || document.getElementById('match-select').value;
  if (!id) return;
  await fetch('/api/watch/' + encodeURIComponent(id), { method: 'POST' });
  loadLive();
}

async function unwatch() {
  await fetch('/api/watch', { method: 'DELETE' });
  loadLive();
}

loadMatches();
loadLive();
setInterval(loadLive, 1000);
</script>
</body>
</html>"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::model::MatchState;
    use crate::live::MatchSnapshot;

    fn state() -> (
        Arc<AppState>,
        watch::Sender<LiveFrame>,
        mpsc::Receiver<ViewCommand>,
    ) {
        let (frames_tx, frames) = watch::channel(LiveFrame::waiting());
        let (commands, commands_rx) = mpsc::channel(4);
        let state = AppState {
            frames,
            commands,
            registry: None,
        };
        (Arc::new(state), frames_tx, commands_rx)
    }

    #[tokio::test]
    async fn test_watch_forwards_command() {
        let (state, _frames, mut rx) = state();
        let status = watch_handler(State(state.clone()), Path(" m1 ".to_string()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(
            rx.recv().await,
            Some(ViewCommand::Watch(MatchId::parse("m1")))
        );

        let status = unwatch_handler(State(state)).await.unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(rx.recv().await, Some(ViewCommand::Watch(None)));
    }

    #[tokio::test]
    async fn test_blank_id_is_rejected() {
        let (state, _frames, _rx) = state();
        let err = watch_handler(State(state), Path("  ".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_watch_without_view_is_unavailable() {
        let (state, _frames, rx) = state();
        drop(rx);
        let err = unwatch_handler(State(state)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_live_payload_includes_derived_view() {
        let (state, frames, _rx) = state();
        let Json(payload) = live_handler(State(state.clone())).await;
        assert!(payload.view.is_none());

        let mut snapshot = MatchSnapshot::empty();
        snapshot.game_map = "/Game/Maps/Triad/Triad".to_string();
        snapshot.state = MatchState::InProgress;
        snapshot.players = vec![crate::live::model::player("a", "Blue")];
        frames.send_modify(|f| f.snapshot = Some(Arc::new(snapshot)));

        let Json(payload) = live_handler(State(state)).await;
        let view = payload.view.unwrap();
        assert_eq!(view.map, "Haven");
        assert_eq!(view.blue.len(), 1);
        let json = serde_json::to_value(LivePayload {
            frame: payload.frame,
            view: None,
        })
        .unwrap();
        assert_eq!(json["frame"]["snapshot"]["game_map"], "/Game/Maps/Triad/Triad");
        assert_eq!(json["frame"]["connection"]["status"], "waiting");
    }

    #[tokio::test]
    async fn test_registry_routes_without_registry() {
        let (state, _frames, _rx) = state();
        let err = matches_handler(State(state.clone())).await.err().unwrap();
        assert_eq!(err.0, StatusCode::SERVICE_UNAVAILABLE);
        let err = delete_match_handler(State(state.clone()), Path(3))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::SERVICE_UNAVAILABLE);

        let blank = RegisterRequest {
            match_uuid: " ".to_string(),
        };
        let err = register_handler(State(state), Json(blank)).await.err().unwrap();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }
}
