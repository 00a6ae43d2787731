use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque key identifying one live match. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct MatchId(String);

impl MatchId {
    /// Parse a route parameter or config value. Blank input means "no match
    /// selected" and yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(MatchId(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coarse match lifecycle as shown on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", try_from = "String")]
pub enum MatchState {
    NotStarted,
    InProgress,
    Ended,
}

impl FromStr for MatchState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace([' ', '-'], "_").as_str() {
            "NOT_STARTED" | "PREGAME" | "MENUS" | "" => Ok(MatchState::NotStarted),
            "IN_PROGRESS" | "INGAME" => Ok(MatchState::InProgress),
            "ENDED" | "COMPLETED" | "POST_GAME" | "FINISHED" => Ok(MatchState::Ended),
            other => Err(format!("unknown match state `{}`", other)),
        }
    }
}

impl TryFrom<String> for MatchState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl MatchState {
    pub fn label(&self) -> &'static str {
        match self {
            MatchState::NotStarted => "Not Started",
            MatchState::InProgress => "In Progress",
            MatchState::Ended => "Ended",
        }
    }
}

fn unranked() -> String {
    "Unranked".to_string()
}

/// One player in the live roster. `subject` is the primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerEntry {
    pub subject: String,
    #[serde(default)]
    pub game_name: String,
    pub character: String,
    pub team_id: String,
    #[serde(default)]
    pub account_level: Option<u32>,
    #[serde(default = "unranked")]
    pub rank: String,
    #[serde(default)]
    pub rr: Option<i32>,
    #[serde(default)]
    pub leaderboard_rank: Option<u32>,
    #[serde(default)]
    pub agent_icon: Option<String>,
}

/// Per-player numbers for the current round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRoundStats {
    pub riot_id: String,
    #[serde(default)]
    pub kills: u32,
    #[serde(default)]
    pub deaths: u32,
    #[serde(default)]
    pub assists: u32,
    #[serde(default)]
    pub score: u32,
}

/// Latest `stats_update` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundStats {
    pub round: u32,
    #[serde(default)]
    pub round_phase: String,
    #[serde(default)]
    pub player_stats: Vec<PlayerRoundStats>,
}

/// The client's authoritative view of one match.
///
/// Owned by the reconciler and handed to the renderer behind an `Arc`; a
/// change always produces a new value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchSnapshot {
    pub game_map: String,
    pub game_mode: String,
    pub state: MatchState,
    /// Score of the team the party owner plays on
    pub party_owner_score: u32,
    pub party_owner_enemy_score: u32,
    /// Side ("Blue" / "Red") the party owner plays on, when known
    pub party_owner_team: Option<String>,
    pub party_size: Option<u32>,
    pub players: Vec<PlayerEntry>,
    pub round: Option<RoundStats>,
}

impl MatchSnapshot {
    /// Blank snapshot used when an update arrives before any baseline.
    pub fn empty() -> Self {
        MatchSnapshot {
            game_map: String::new(),
            game_mode: String::new(),
            state: MatchState::NotStarted,
            party_owner_score: 0,
            party_owner_enemy_score: 0,
            party_owner_team: None,
            party_size: None,
            players: Vec::new(),
            round: None,
        }
    }
}

/// A possibly partial match state carried by an incremental update.
/// `None` means "not present in this payload".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchPatch {
    pub match_id: Option<MatchId>,
    pub game_map: Option<String>,
    pub game_mode: Option<String>,
    pub state: Option<MatchState>,
    pub party_owner_score: Option<u32>,
    pub party_owner_enemy_score: Option<u32>,
    pub party_owner_team: Option<String>,
    pub party_size: Option<u32>,
    pub players: Option<Vec<PlayerEntry>>,
}

/// RFC 3339, or an offset-less ISO 8601 datetime read as UTC (the backend
/// stores naive UTC datetimes).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Collapse duplicate subjects: the last entry wins but keeps the position
/// of the first occurrence.
pub fn normalize_roster(players: Vec<PlayerEntry>) -> Vec<PlayerEntry> {
    let mut out: Vec<PlayerEntry> = Vec::with_capacity(players.len());
    for player in players {
        match out.iter_mut().find(|p| p.subject == player.subject) {
            Some(existing) => *existing = player,
            None => out.push(player),
        }
    }
    out
}

#[cfg(test)]
pub(crate) fn player(subject: &str, team: &str) -> PlayerEntry {
    PlayerEntry {
        subject: subject.to_string(),
        game_name: format!("{}#EUW", subject),
        character: "Jett".to_string(),
        team_id: team.to_string(),
        account_level: Some(42),
        rank: unranked(),
        rr: None,
        leaderboard_rank: None,
        agent_icon: None,
    }
}
