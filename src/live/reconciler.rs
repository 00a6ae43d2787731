//! Folds the ordered event stream of one match binding into a snapshot.
//!
//! Merge rules:
//! - `initial_data` replaces the snapshot wholesale, from any phase.
//! - `match_update` overwrites each scalar that is present; the roster is
//!   replaced only by a present, non-empty roster. Before any baseline an
//!   update seeds a blank snapshot; after `match_end` it is ignored.
//! - `match_end` clears the snapshot until the next `initial_data`.
//! - `stats_update` refreshes the round panel of an existing snapshot.
//! - A merge that leaves the snapshot as it was reports
//!   [`Ignored::Unchanged`] and keeps the same `Arc`.
//!
//! Transport order is authoritative. Timestamps are only consulted when
//! [`ReconcilerOptions::reject_stale_updates`] is set.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use super::event::{EventPayload, LiveEvent};
use super::model::{MatchId, MatchPatch, MatchSnapshot, RoundStats};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcilerOptions {
    /// Drop `match_update`s strictly older than the newest applied event
    pub reject_stale_updates: bool,
}

#[derive(Debug, Clone)]
enum Phase {
    /// Bound but nothing received yet
    Pending,
    Live(Arc<MatchSnapshot>),
    /// `match_end` seen; only a fresh baseline revives the snapshot
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ignored {
    AfterEnd,
    NoSnapshot,
    Stale,
    ForeignMatch,
    UnknownKind,
    /// Payload matched what is already shown
    Unchanged,
}

/// What an `apply` call did to the visible snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Applied {
    Replaced,
    Merged,
    Cleared,
    Ignored(Ignored),
}

impl Applied {
    pub fn changed(&self) -> bool {
        !matches!(self, Applied::Ignored(_))
    }
}

pub struct Reconciler {
    match_id: MatchId,
    phase: Phase,
    newest: Option<DateTime<Utc>>,
    options: ReconcilerOptions,
}

impl Reconciler {
    pub fn new(match_id: MatchId, options: ReconcilerOptions) -> Self {
        Reconciler {
            match_id,
            phase: Phase::Pending,
            newest: None,
            options,
        }
    }

    /// Continue from a last-known snapshot, e.g. after reconnecting to the
    /// same match.
    pub fn resume(
        match_id: MatchId,
        snapshot: Option<Arc<MatchSnapshot>>,
        options: ReconcilerOptions,
    ) -> Self {
        let mut reconciler = Reconciler::new(match_id, options);
        if let Some(snapshot) = snapshot {
            reconciler.phase = Phase::Live(snapshot);
        }
        reconciler
    }

    pub fn snapshot(&self) -> Option<&Arc<MatchSnapshot>> {
        match &self.phase {
            Phase::Live(snapshot) => Some(snapshot),
            Phase::Pending | Phase::Ended => None,
        }
    }

    pub fn is_ended(&self) -> bool {
        matches!(self.phase, Phase::Ended)
    }

    pub fn apply(&mut self, event: LiveEvent) -> Applied {
        if let Some(id) = &event.match_id {
            if id != &self.match_id {
                debug!(
                    "[{}] Ignoring {} addressed to match {}",
                    self.match_id,
                    event.kind(),
                    id
                );
                return Applied::Ignored(Ignored::ForeignMatch);
            }
        }

        let LiveEvent {
            timestamp, payload, ..
        } = event;

        let applied = match payload {
            EventPayload::InitialSnapshot(snapshot) => {
                self.phase = Phase::Live(Arc::new(snapshot));
                Applied::Replaced
            }
            EventPayload::Update(patch) => {
                if self.is_stale(timestamp) {
                    debug!(
                        "[{}] Dropping stale match_update ({:?} < {:?})",
                        self.match_id, timestamp, self.newest
                    );
                    return Applied::Ignored(Ignored::Stale);
                }
                match &self.phase {
                    Phase::Ended => return Applied::Ignored(Ignored::AfterEnd),
                    Phase::Pending => {
                        let next = merge_patch(&MatchSnapshot::empty(), patch);
                        self.phase = Phase::Live(Arc::new(next));
                        Applied::Merged
                    }
                    Phase::Live(current) => {
                        let next = merge_patch(current, patch);
                        self.replace_if_changed(next)
                    }
                }
            }
            EventPayload::End => {
                self.phase = Phase::Ended;
                Applied::Cleared
            }
            EventPayload::RoundStats(stats) => {
                let next = match &self.phase {
                    Phase::Live(current) => with_round(current, stats),
                    Phase::Pending | Phase::Ended => {
                        return Applied::Ignored(Ignored::NoSnapshot)
                    }
                };
                self.replace_if_changed(next)
            }
            EventPayload::Unknown { .. } => return Applied::Ignored(Ignored::UnknownKind),
        };

        if let Some(ts) = timestamp {
            if self.newest.map_or(true, |newest| ts > newest) {
                self.newest = Some(ts);
            }
        }
        applied
    }

    fn replace_if_changed(&mut self, next: MatchSnapshot) -> Applied {
        match &self.phase {
            Phase::Live(current) if **current == next => Applied::Ignored(Ignored::Unchanged),
            _ => {
                self.phase = Phase::Live(Arc::new(next));
                Applied::Merged
            }
        }
    }

    fn is_stale(&self, timestamp: Option<DateTime<Utc>>) -> bool {
        if !self.options.reject_stale_updates {
            return false;
        }
        matches!((timestamp, self.newest), (Some(ts), Some(newest)) if ts < newest)
    }
}

/// Field-wise merge producing a new snapshot.
pub fn merge_patch(current: &MatchSnapshot, patch: MatchPatch) -> MatchSnapshot {
    let mut next = current.clone();
    if let Some(map) = patch.game_map {
        next.game_map = map;
    }
    if let Some(mode) = patch.game_mode {
        next.game_mode = mode;
    }
    if let Some(state) = patch.state {
        next.state = state;
    }
    if let Some(score) = patch.party_owner_score {
        next.party_owner_score = score;
    }
    if let Some(score) = patch.party_owner_enemy_score {
        next.party_owner_enemy_score = score;
    }
    if let Some(team) = patch.party_owner_team {
        next.party_owner_team = Some(team);
    }
    if let Some(size) = patch.party_size {
        next.party_size = Some(size);
    }
    // Upstream omits the roster on some ticks; never blank a known roster.
    if let Some(players) = patch.players.filter(|p| !p.is_empty()) {
        next.players = players;
    }
    next
}

fn with_round(current: &MatchSnapshot, stats: RoundStats) -> MatchSnapshot {
    let mut next = current.clone();
    next.round = Some(stats);
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::event::{decode, fixtures};
    use crate::live::model::MatchState;
    use serde_json::json;

    fn id(s: &str) -> MatchId {
        MatchId::parse(s).unwrap()
    }

    fn feed(reconciler: &mut Reconciler, msg: String) -> Applied {
        reconciler.apply(decode(&msg).unwrap())
    }

    fn subjects(reconciler: &Reconciler) -> Vec<String> {
        reconciler
            .snapshot()
            .map(|s| s.players.iter().map(|p| p.subject.clone()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_initial_then_empty_roster_update_keeps_players() {
        let mut r = Reconciler::new(id("m1"), ReconcilerOptions::default());
        feed(&mut r, fixtures::initial("m1", json!([fixtures::player("p1", "Blue")])));
        let applied = feed(
            &mut r,
            fixtures::update("m1", json!({"players": [], "party_owner_score": 4})),
        );
        assert_eq!(applied, Applied::Merged);
        assert_eq!(subjects(&r), vec!["p1"]);
        assert_eq!(r.snapshot().unwrap().party_owner_score, 4);
    }

    #[test]
    fn test_roster_tracks_last_non_empty_update() {
        let mut r = Reconciler::new(id("m1"), ReconcilerOptions::default());
        feed(&mut r, fixtures::initial("m1", json!([fixtures::player("p1", "Blue")])));
        feed(
            &mut r,
            fixtures::update(
                "m1",
                json!({"players": [fixtures::player("p2", "Red"), fixtures::player("p3", "Blue")]}),
            ),
        );
        feed(&mut r, fixtures::update("m1", json!({"state": "IN_PROGRESS"})));
        feed(&mut r, fixtures::update("m1", json!({"players": null})));
        feed(&mut r, fixtures::update("m1", json!({"players": []})));
        assert_eq!(subjects(&r), vec!["p2", "p3"]);
    }

    #[test]
    fn test_partial_update_retains_scalars() {
        let mut r = Reconciler::new(id("m1"), ReconcilerOptions::default());
        feed(
            &mut r,
            fixtures::update(
                "m1",
                json!({
                    "game_map": "/Game/Maps/Triad/Triad",
                    "game_mode": "competitive",
                    "state": "IN_PROGRESS",
                    "party_owner_score": 11,
                    "party_owner_enemy_score": 9
                }),
            ),
        );
        feed(&mut r, fixtures::update("m1", json!({"state": "ENDED"})));
        let snap = r.snapshot().unwrap();
        assert_eq!(snap.state, MatchState::Ended);
        assert_eq!(snap.game_map, "/Game/Maps/Triad/Triad");
        assert_eq!(snap.game_mode, "competitive");
        assert_eq!(snap.party_owner_score, 11);
        assert_eq!(snap.party_owner_enemy_score, 9);
    }

    #[test]
    fn test_end_clears_from_any_phase() {
        let mut pending = Reconciler::new(id("m1"), ReconcilerOptions::default());
        assert_eq!(feed(&mut pending, fixtures::end("m1")), Applied::Cleared);
        assert!(pending.snapshot().is_none());

        let mut live = Reconciler::new(id("m1"), ReconcilerOptions::default());
        feed(&mut live, fixtures::initial("m1", json!([fixtures::player("p1", "Blue")])));
        feed(&mut live, fixtures::end("m1"));
        assert!(live.snapshot().is_none());
        assert!(live.is_ended());
    }

    #[test]
    fn test_updates_after_end_are_ignored_until_new_baseline() {
        let mut r = Reconciler::new(id("m1"), ReconcilerOptions::default());
        feed(&mut r, fixtures::initial("m1", json!([fixtures::player("p1", "Blue")])));
        feed(&mut r, fixtures::end("m1"));

        let late = feed(&mut r, fixtures::update("m1", json!({"state": "IN_PROGRESS"})));
        assert_eq!(late, Applied::Ignored(Ignored::AfterEnd));
        assert!(r.snapshot().is_none());

        feed(&mut r, fixtures::initial("m1", json!([fixtures::player("p7", "Red")])));
        assert_eq!(subjects(&r), vec!["p7"]);
        feed(&mut r, fixtures::update("m1", json!({"party_owner_enemy_score": 1})));
        assert_eq!(r.snapshot().unwrap().party_owner_enemy_score, 1);
    }

    #[test]
    fn test_initial_replaces_verbatim() {
        let mut r = Reconciler::new(id("m1"), ReconcilerOptions::default());
        feed(
            &mut r,
            fixtures::update("m1", json!({"party_size": 5, "players": [fixtures::player("p1", "Blue")]})),
        );
        feed(&mut r, fixtures::initial("m1", json!([])));
        let snap = r.snapshot().unwrap();
        assert!(snap.players.is_empty());
        assert_eq!(snap.party_size, None);
    }

    #[test]
    fn test_unknown_and_foreign_events_are_no_ops() {
        let mut r = Reconciler::new(id("m1"), ReconcilerOptions::default());
        feed(&mut r, fixtures::initial("m1", json!([fixtures::player("p1", "Blue")])));
        let before = r.snapshot().cloned();

        let unknown = json!({"type": "ult_points", "match_id": "m1", "data": {}}).to_string();
        assert_eq!(feed(&mut r, unknown), Applied::Ignored(Ignored::UnknownKind));

        let foreign = feed(&mut r, fixtures::update("m2", json!({"state": "ENDED"})));
        assert_eq!(foreign, Applied::Ignored(Ignored::ForeignMatch));
        assert_eq!(r.snapshot().cloned(), before);
    }

    #[test]
    fn test_round_stats_need_a_snapshot() {
        let stats = json!({
            "type": "stats_update",
            "match_id": "m1",
            "data": {"round": 2, "roundPhase": "shopping", "playerStats": []}
        })
        .to_string();

        let mut r = Reconciler::new(id("m1"), ReconcilerOptions::default());
        assert_eq!(
            feed(&mut r, stats.clone()),
            Applied::Ignored(Ignored::NoSnapshot)
        );
        feed(&mut r, fixtures::initial("m1", json!([])));
        assert_eq!(feed(&mut r, stats), Applied::Merged);
        assert_eq!(r.snapshot().unwrap().round.as_ref().unwrap().round, 2);
    }

    #[test]
    fn test_stale_updates_rejected_only_when_enabled() {
        let older = json!({
            "type": "match_update",
            "match_id": "m1",
            "timestamp": "2024-05-01T11:59:00Z",
            "data": {"party_owner_score": 0}
        })
        .to_string();

        let mut lenient = Reconciler::new(id("m1"), ReconcilerOptions::default());
        feed(&mut lenient, fixtures::initial("m1", json!([])));
        assert_eq!(feed(&mut lenient, older.clone()), Applied::Merged);
        assert_eq!(lenient.snapshot().unwrap().party_owner_score, 0);

        let mut strict = Reconciler::new(
            id("m1"),
            ReconcilerOptions {
                reject_stale_updates: true,
            },
        );
        feed(&mut strict, fixtures::initial("m1", json!([])));
        assert_eq!(feed(&mut strict, older), Applied::Ignored(Ignored::Stale));
        assert_eq!(strict.snapshot().unwrap().party_owner_score, 3);
    }

    #[test]
    fn test_every_change_is_a_new_value() {
        let mut r = Reconciler::new(id("m1"), ReconcilerOptions::default());
        feed(&mut r, fixtures::initial("m1", json!([fixtures::player("p1", "Blue")])));
        let first = Arc::clone(r.snapshot().unwrap());
        feed(&mut r, fixtures::update("m1", json!({"party_owner_score": 9})));
        assert_eq!(first.party_owner_score, 3);
        assert!(!Arc::ptr_eq(&first, r.snapshot().unwrap()));
    }

    #[test]
    fn test_identical_or_empty_patch_reports_no_change() {
        let mut r = Reconciler::new(id("m1"), ReconcilerOptions::default());
        feed(&mut r, fixtures::initial("m1", json!([fixtures::player("p1", "Blue")])));
        let before = Arc::clone(r.snapshot().unwrap());

        let empty = feed(&mut r, fixtures::update("m1", json!({})));
        assert_eq!(empty, Applied::Ignored(Ignored::Unchanged));
        assert!(!empty.changed());

        let same = feed(
            &mut r,
            fixtures::update("m1", json!({"state": "IN_PROGRESS", "party_owner_score": 3})),
        );
        assert_eq!(same, Applied::Ignored(Ignored::Unchanged));
        assert!(Arc::ptr_eq(&before, r.snapshot().unwrap()));

        assert_eq!(
            feed(&mut r, fixtures::update("m1", json!({"party_owner_score": 4}))),
            Applied::Merged
        );
    }

    #[test]
    fn test_first_update_before_baseline_is_a_change() {
        let mut r = Reconciler::new(id("m1"), ReconcilerOptions::default());
        assert_eq!(feed(&mut r, fixtures::update("m1", json!({}))), Applied::Merged);
        assert_eq!(r.snapshot().unwrap().state, MatchState::NotStarted);
    }

    #[test]
    fn test_resume_keeps_last_known_snapshot() {
        let mut r = Reconciler::new(id("m1"), ReconcilerOptions::default());
        feed(&mut r, fixtures::initial("m1", json!([fixtures::player("p1", "Blue")])));
        let resumed = Reconciler::resume(id("m1"), r.snapshot().cloned(), ReconcilerOptions::default());
        assert_eq!(subjects(&resumed), vec!["p1"]);
    }
}
