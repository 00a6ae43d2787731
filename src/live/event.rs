//! Wire decoding for the live stream.
//!
//! Every inbound text frame is an envelope:
//! ```text
//! { "type": "initial_data" | "match_update" | "match_end" | "stats_update",
//!   "match_id": "...",            // older servers send "match_uuid"
//!   "timestamp": "2024-05-01T12:00:00Z",
//!   "data": { ... } | "<json string>" }
//! ```
//! Match payloads exist in two revisions: the flat snake_case row the
//! backend stores, and the older PascalCase shape forwarded straight from
//! the game client (`{"match": {"MatchID": ..., "Players": [...]}}`). Both
//! normalize to [`MatchPatch`] here so nothing downstream sees raw JSON.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::derive::rank_label;
use super::model::{
    normalize_roster, parse_timestamp, MatchId, MatchPatch, MatchSnapshot, MatchState,
    PlayerEntry, RoundStats,
};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("`{kind}` event carries no data")]
    MissingData { kind: String },
    #[error("`{kind}` data is not a JSON object")]
    NotAnObject { kind: String },
    #[error("invalid `{kind}` payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("initial snapshot is missing `{0}`")]
    IncompleteSnapshot(&'static str),
}

/// Type-specific body of a [`LiveEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    InitialSnapshot(MatchSnapshot),
    Update(MatchPatch),
    End,
    RoundStats(RoundStats),
    /// Forward-compatible catch-all; consumers treat it as a no-op.
    Unknown { kind: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveEvent {
    pub match_id: Option<MatchId>,
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: EventPayload,
}

impl LiveEvent {
    pub fn kind(&self) -> &str {
        match &self.payload {
            EventPayload::InitialSnapshot(_) => "initial_data",
            EventPayload::Update(_) => "match_update",
            EventPayload::End => "match_end",
            EventPayload::RoundStats(_) => "stats_update",
            EventPayload::Unknown { kind } => kind,
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, alias = "match_uuid")]
    match_id: Option<String>,
    /// Advisory only; unreadable values are dropped rather than failing
    /// the frame.
    #[serde(default)]
    timestamp: Value,
    #[serde(default)]
    data: Value,
}

/// Decode one text frame. Unknown event types decode successfully to
/// [`EventPayload::Unknown`]; shape errors are reported, never guessed at.
pub fn decode(text: &str) -> Result<LiveEvent, DecodeError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    let kind = envelope.kind;
    let mut match_id = envelope.match_id.as_deref().and_then(MatchId::parse);
    let timestamp = envelope_timestamp(&kind, envelope.timestamp);

    let payload = match kind.as_str() {
        "initial_data" => {
            let patch = decode_match(&kind, payload_data(&kind, envelope.data)?)?;
            match_id = match_id.or_else(|| patch.match_id.clone());
            EventPayload::InitialSnapshot(snapshot_from_patch(patch)?)
        }
        "match_update" => {
            let patch = decode_match(&kind, payload_data(&kind, envelope.data)?)?;
            match_id = match_id.or_else(|| patch.match_id.clone());
            EventPayload::Update(patch)
        }
        "stats_update" => {
            let data = payload_data(&kind, envelope.data)?;
            let stats = serde_json::from_value(data).map_err(|source| {
                DecodeError::InvalidPayload {
                    kind: kind.clone(),
                    source,
                }
            })?;
            EventPayload::RoundStats(stats)
        }
        // `data` is never inspected for these.
        "match_end" => EventPayload::End,
        _ => EventPayload::Unknown { kind: kind.clone() },
    };

    Ok(LiveEvent {
        match_id,
        timestamp,
        payload,
    })
}

fn envelope_timestamp(kind: &str, raw: Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::Null => None,
        Value::String(s) => {
            let parsed = parse_timestamp(&s);
            if parsed.is_none() {
                debug!("Ignoring unreadable timestamp {:?} on `{}`", s, kind);
            }
            parsed
        }
        other => {
            debug!("Ignoring non-string timestamp {} on `{}`", other, kind);
            None
        }
    }
}

fn payload_data(kind: &str, data: Value) -> Result<Value, DecodeError> {
    require_data(kind, unwrap_string_data(data)?)
}

/// Some producers double-encode `data` as a JSON string.
fn unwrap_string_data(data: Value) -> Result<Value, DecodeError> {
    match data {
        Value::String(inner) => Ok(serde_json::from_str(&inner)?),
        other => Ok(other),
    }
}

fn require_data(kind: &str, data: Value) -> Result<Value, DecodeError> {
    match data {
        Value::Null => Err(DecodeError::MissingData {
            kind: kind.to_string(),
        }),
        Value::Object(_) => Ok(data),
        _ => Err(DecodeError::NotAnObject {
            kind: kind.to_string(),
        }),
    }
}

fn decode_match(kind: &str, data: Value) -> Result<MatchPatch, DecodeError> {
    let invalid = |source: serde_json::Error| DecodeError::InvalidPayload {
        kind: kind.to_string(),
        source,
    };
    if data.get("match").is_some() {
        let legacy: LegacyMatchData = serde_json::from_value(data).map_err(invalid)?;
        Ok(legacy.into_patch())
    } else {
        let current: CurrentMatch = serde_json::from_value(data).map_err(invalid)?;
        Ok(current.into_patch())
    }
}

fn snapshot_from_patch(patch: MatchPatch) -> Result<MatchSnapshot, DecodeError> {
    Ok(MatchSnapshot {
        game_map: patch
            .game_map
            .ok_or(DecodeError::IncompleteSnapshot("game_map"))?,
        game_mode: patch
            .game_mode
            .ok_or(DecodeError::IncompleteSnapshot("game_mode"))?,
        state: patch.state.ok_or(DecodeError::IncompleteSnapshot("state"))?,
        party_owner_score: patch.party_owner_score.unwrap_or(0),
        party_owner_enemy_score: patch.party_owner_enemy_score.unwrap_or(0),
        party_owner_team: patch.party_owner_team,
        party_size: patch.party_size,
        players: patch.players.unwrap_or_default(),
        round: None,
    })
}

// ── Current revision ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CurrentMatch {
    #[serde(default, alias = "match_uuid")]
    match_id: Option<String>,
    #[serde(default)]
    game_map: Option<String>,
    #[serde(default)]
    game_mode: Option<String>,
    #[serde(default)]
    state: Option<MatchState>,
    #[serde(default)]
    party_owner_score: Option<u32>,
    #[serde(default)]
    party_owner_enemy_score: Option<u32>,
    #[serde(default, alias = "team_orientation")]
    party_owner_team: Option<String>,
    #[serde(default)]
    party_size: Option<u32>,
    #[serde(default)]
    players: Option<Vec<PlayerEntry>>,
}

impl CurrentMatch {
    fn into_patch(self) -> MatchPatch {
        MatchPatch {
            match_id: self.match_id.as_deref().and_then(MatchId::parse),
            game_map: self.game_map,
            game_mode: self.game_mode,
            state: self.state,
            party_owner_score: self.party_owner_score,
            party_owner_enemy_score: self.party_owner_enemy_score,
            party_owner_team: self.party_owner_team,
            party_size: self.party_size,
            players: self.players.map(normalize_roster),
        }
    }
}

// ── Legacy revision ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct LegacyMatchData {
    #[serde(rename = "match")]
    inner: LegacyMatch,
    /// Older builds sent the roster next to `match` instead of inside it
    #[serde(default)]
    players: Option<Vec<LegacyPlayer>>,
}

#[derive(Deserialize)]
struct LegacyMatch {
    #[serde(rename = "MatchID", default)]
    match_id: Option<String>,
    #[serde(rename = "State", default)]
    state: Option<MatchState>,
    #[serde(rename = "MapID", default)]
    map_id: Option<String>,
    #[serde(rename = "ModeID", default)]
    mode_id: Option<String>,
    #[serde(rename = "Players", default)]
    players: Option<Vec<LegacyPlayer>>,
    #[serde(default)]
    match_stats: Option<LegacyStats>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyStats {
    #[serde(default)]
    party_owner_match_score_ally_team: Option<u32>,
    #[serde(default)]
    party_owner_match_score_enemy_team: Option<u32>,
    #[serde(default)]
    party_size: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LegacyPlayer {
    subject: String,
    #[serde(rename = "TeamID")]
    team_id: String,
    #[serde(rename = "CharacterID")]
    character_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    agent_icon: Option<String>,
    #[serde(default)]
    player_identity: Option<LegacyIdentity>,
    #[serde(default)]
    seasonal_badge_info: Option<LegacyBadge>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LegacyIdentity {
    #[serde(default)]
    account_level: Option<u32>,
    #[serde(default)]
    hide_account_level: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LegacyBadge {
    #[serde(default)]
    rank: Option<u32>,
    #[serde(default)]
    leaderboard_rank: Option<u32>,
}

impl LegacyPlayer {
    fn into_entry(self) -> PlayerEntry {
        let account_level = self
            .player_identity
            .filter(|id| !id.hide_account_level)
            .and_then(|id| id.account_level);
        let (rank, leaderboard_rank) = match self.seasonal_badge_info {
            Some(badge) => (
                rank_label(badge.rank.unwrap_or(0)),
                badge.leaderboard_rank.filter(|r| *r > 0),
            ),
            None => (rank_label(0), None),
        };
        PlayerEntry {
            game_name: self.name.unwrap_or_default(),
            subject: self.subject,
            character: self.character_id,
            team_id: self.team_id,
            account_level,
            rank,
            rr: None,
            leaderboard_rank,
            agent_icon: self.agent_icon,
        }
    }
}

impl LegacyMatchData {
    fn into_patch(self) -> MatchPatch {
        let LegacyMatchData { inner, players } = self;
        let stats = inner.match_stats;
        let roster = inner.players.or(players).map(|players| {
            normalize_roster(players.into_iter().map(LegacyPlayer::into_entry).collect())
        });
        MatchPatch {
            match_id: inner.match_id.as_deref().and_then(MatchId::parse),
            game_map: inner.map_id,
            game_mode: inner.mode_id,
            state: inner.state,
            party_owner_score: stats
                .as_ref()
                .and_then(|s| s.party_owner_match_score_ally_team),
            party_owner_enemy_score: stats
                .as_ref()
                .and_then(|s| s.party_owner_match_score_enemy_team),
            party_owner_team: None,
            party_size: stats.as_ref().and_then(|s| s.party_size),
            players: roster,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::json;

    pub fn initial(match_id: &str, players: serde_json::Value) -> String {
        json!({
            "type": "initial_data",
            "match_id": match_id,
            "timestamp": "2024-05-01T12:00:00Z",
            "data": {
                "match_id": match_id,
                "game_map": "/Game/Maps/Ascent/Ascent",
                "game_mode": "competitive",
                "state": "IN_PROGRESS",
                "party_owner_score": 3,
                "party_owner_enemy_score": 2,
                "party_owner_team": "Blue",
                "players": players,
            }
        })
        .to_string()
    }

    pub fn update(match_id: &str, data: serde_json::Value) -> String {
        json!({
            "type": "match_update",
            "match_id": match_id,
            "timestamp": "2024-05-01T12:00:05Z",
            "data": data,
        })
        .to_string()
    }

    pub fn end(match_id: &str) -> String {
        json!({
            "type": "match_end",
            "match_id": match_id,
            "timestamp": "2024-05-01T12:40:00Z",
            "data": null,
        })
        .to_string()
    }

    pub fn player(subject: &str, team: &str) -> serde_json::Value {
        json!({
            "subject": subject,
            "character": "Jett",
            "team_id": team,
            "game_name": format!("{}#EUW", subject),
            "account_level": 42,
            "rank": "Gold 2",
            "rr": 57,
            "leaderboard_rank": null,
        })
    }
}
