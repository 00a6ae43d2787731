//! Pure helpers computed from a snapshot on every render.

use serde::Serialize;

use super::model::{MatchSnapshot, PlayerEntry};

/// Roster split by side. "Blue" and "Red" are matched case-insensitively;
/// anything else (coaches, observers, unknown ids) lands in `other`.
#[derive(Debug, Default, PartialEq)]
pub struct TeamSplit<'a> {
    pub blue: Vec<&'a PlayerEntry>,
    pub red: Vec<&'a PlayerEntry>,
    pub other: Vec<&'a PlayerEntry>,
}

pub fn partition_by_team(players: &[PlayerEntry]) -> TeamSplit<'_> {
    let mut split = TeamSplit::default();
    for p in players {
        if p.team_id.eq_ignore_ascii_case("blue") {
            split.blue.push(p);
        } else if p.team_id.eq_ignore_ascii_case("red") {
            split.red.push(p);
        } else {
            split.other.push(p);
        }
    }
    split
}

/// Map code names as they appear in asset paths.
const MAP_NAMES: &[(&str, &str)] = &[
    ("Ascent", "Ascent"),
    ("Duality", "Bind"),
    ("Foxtrot", "Breeze"),
    ("Canyon", "Fracture"),
    ("Triad", "Haven"),
    ("Port", "Icebox"),
    ("Jam", "Lotus"),
    ("Pitt", "Pearl"),
    ("Bonsai", "Split"),
    ("Juliett", "Sunset"),
    ("Infinity", "Abyss"),
];

/// Queue ids as reported by the party/presence endpoints.
const QUEUE_NAMES: &[(&str, &str)] = &[
    ("newmap", "New Map"),
    ("competitive", "Competitive"),
    ("unrated", "Unrated"),
    ("swiftplay", "Swiftplay"),
    ("spikerush", "Spike Rush"),
    ("deathmatch", "Deathmatch"),
    ("ggteam", "Escalation"),
    ("onefa", "Replication"),
    ("hurm", "Team Deathmatch"),
    ("custom", "Custom"),
    ("snowball", "Snowball Fight"),
];

/// Game-mode asset names with the `GameMode` suffix stripped.
const MODE_ASSETS: &[(&str, &str)] = &[
    ("Bomb", "Standard"),
    ("QuickBomb", "Spike Rush"),
    ("Deathmatch", "Deathmatch"),
    ("GunGame", "Escalation"),
    ("OneForAll", "Replication"),
    ("HURM", "Team Deathmatch"),
    ("SnowballFight", "Snowball Fight"),
    ("Swiftplay", "Swiftplay"),
];

fn last_segment(raw: &str) -> &str {
    raw.rsplit('/').find(|s| !s.is_empty()).unwrap_or("")
}

/// "/Game/Maps/Duality/Duality" → "Bind". Already-friendly names pass
/// through unchanged.
pub fn map_label(raw: &str) -> String {
    let segment = last_segment(raw.trim());
    if segment.is_empty() {
        return "Unknown".to_string();
    }
    MAP_NAMES
        .iter()
        .find(|(code, _)| code.eq_ignore_ascii_case(segment))
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| segment.to_string())
}

/// Accepts either a queue id ("competitive") or a game-mode asset path
/// ("/Game/GameModes/Bomb/BombGameMode.BombGameMode_C").
pub fn mode_label(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return "Custom".to_string();
    }
    if let Some((_, name)) = QUEUE_NAMES.iter().find(|(id, _)| id.eq_ignore_ascii_case(raw)) {
        return name.to_string();
    }

    let segment = last_segment(raw);
    let asset = segment.split('.').next().unwrap_or(segment);
    let stem = asset
        .trim_end_matches("_C")
        .trim_end_matches("GameMode")
        .trim_end_matches('_');
    if stem.is_empty() {
        return "Unknown".to_string();
    }
    MODE_ASSETS
        .iter()
        .find(|(asset, _)| asset.eq_ignore_ascii_case(stem))
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| stem.to_string())
}

const DIVISIONS: &[&str] = &[
    "Iron", "Bronze", "Silver", "Gold", "Platinum", "Diamond", "Ascendant", "Immortal",
];

/// Competitive tier number (legacy payloads) → rank label.
pub fn rank_label(tier: u32) -> String {
    match tier {
        0..=2 => "Unranked".to_string(),
        3..=26 => {
            let idx = (tier - 3) as usize;
            format!("{} {}", DIVISIONS[idx / 3], idx % 3 + 1)
        }
        27 => "Radiant".to_string(),
        _ => "Unknown".to_string(),
    }
}

/// Header numbers for one team panel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeamSummary {
    pub players: usize,
    /// Best (lowest) leaderboard position on the team
    pub top_leaderboard_rank: Option<u32>,
    pub average_account_level: Option<u32>,
}

pub fn team_summary(players: &[&PlayerEntry]) -> TeamSummary {
    let levels: Vec<u32> = players.iter().filter_map(|p| p.account_level).collect();
    let average_account_level = if levels.is_empty() {
        None
    } else {
        Some(levels.iter().sum::<u32>() / levels.len() as u32)
    };
    TeamSummary {
        players: players.len(),
        top_leaderboard_rank: players.iter().filter_map(|p| p.leaderboard_rank).min(),
        average_account_level,
    }
}

/// Everything the renderer needs beyond the raw snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DerivedView {
    pub map: String,
    pub mode: String,
    pub state: &'static str,
    pub blue: Vec<PlayerEntry>,
    pub red: Vec<PlayerEntry>,
    pub other: Vec<PlayerEntry>,
    pub blue_summary: TeamSummary,
    pub red_summary: TeamSummary,
}

impl DerivedView {
    pub fn of(snapshot: &MatchSnapshot) -> Self {
        let split = partition_by_team(&snapshot.players);
        DerivedView {
            map: map_label(&snapshot.game_map),
            mode: mode_label(&snapshot.game_mode),
            state: snapshot.state.label(),
            blue_summary: team_summary(&split.blue),
            red_summary: team_summary(&split.red),
            blue: split.blue.into_iter().cloned().collect(),
            red: split.red.into_iter().cloned().collect(),
            other: split.other.into_iter().cloned().collect(),
        }
    }
}
