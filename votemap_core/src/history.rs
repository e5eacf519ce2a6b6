use std::{
    sync::{Arc, RwLock},
    time::SystemTime,
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use votemap_runtime::Environment;

use crate::weighting::{GroupKind, WeightingParameters};

pub const DEFAULT_HISTORY_RETENTION: usize = 10;

/// One observed round start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayRecord {
    map: String,
    environment: Environment,
    round_index: u64,
    /// Exact layer, when the round start named it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    layer_id: Option<String>,
    #[serde(default = "SystemTime::now")]
    recorded_at: SystemTime,
}

impl PlayRecord {
    pub fn new(map: impl Into<String>, environment: Environment, round_index: u64) -> Self {
        Self {
            map: map.into(),
            environment,
            round_index,
            layer_id: None,
            recorded_at: SystemTime::now(),
        }
    }

    pub fn with_layer(mut self, layer_id: impl Into<String>) -> Self {
        self.layer_id = Some(layer_id.into());
        self
    }

    pub fn map(&self) -> &str {
        &self.map
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn round_index(&self) -> u64 {
        self.round_index
    }

    pub fn layer_id(&self) -> Option<&str> {
        self.layer_id.as_deref()
    }

    pub fn recorded_at(&self) -> SystemTime {
        self.recorded_at
    }
}

/// Rounds elapsed since a map or group was last played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recency {
    Rounds(u64),
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Appended,
    /// The round index was already recorded.
    Duplicate,
    /// The round index is older than the latest record.
    OutOfOrder { latest: u64 },
}

/// Point-in-time view of the play history, oldest record first. Round
/// indices are strictly increasing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredHistory")]
pub struct HistorySnapshot {
    records: Vec<PlayRecord>,
}

#[derive(Deserialize)]
struct StoredHistory {
    records: Vec<PlayRecord>,
}

impl From<StoredHistory> for HistorySnapshot {
    fn from(stored: StoredHistory) -> Self {
        HistorySnapshot::from_records(stored.records, usize::MAX)
    }
}

impl HistorySnapshot {
    /// Builds a snapshot from records in any order, keeping the newest
    /// `retention` entries. Records are ordered by round index; of several
    /// records for one round only the first is kept.
    pub fn from_records(mut records: Vec<PlayRecord>, retention: usize) -> Self {
        records.sort_by_key(|record| record.round_index);
        records.dedup_by_key(|record| record.round_index);
        if records.len() > retention {
            records.drain(..records.len() - retention);
        }
        Self { records }
    }

    pub fn records(&self) -> &[PlayRecord] {
        &self.records
    }

    pub fn latest(&self) -> Option<&PlayRecord> {
        self.records.last()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// How many rounds ago any member of the named group was played. A group
    /// unknown to `parameters` or absent from the window reports `Never`.
    pub fn recency_of(
        &self,
        parameters: &WeightingParameters,
        group_name: &str,
        kind: GroupKind,
    ) -> Recency {
        match kind {
            GroupKind::Map => match parameters.map_group(group_name) {
                Some(group) => self.recency_where(|record| group.contains(&record.map)),
                None => Recency::Never,
            },
            GroupKind::Environment => match parameters.environment_group(group_name) {
                Some(group) => self.recency_where(|record| group.contains(&record.environment)),
                None => Recency::Never,
            },
        }
    }

    /// How many rounds ago `map` itself was played.
    pub fn recency_of_map(&self, map: &str) -> Recency {
        self.recency_where(|record| record.map == map)
    }

    fn recency_where(&self, mut matches: impl FnMut(&PlayRecord) -> bool) -> Recency {
        let Some(latest) = self.latest() else {
            return Recency::Never;
        };
        self.records
            .iter()
            .rev()
            .find(|record| matches(record))
            .map(|record| Recency::Rounds(latest.round_index.saturating_sub(record.round_index)))
            .unwrap_or(Recency::Never)
    }
}

/// Single writer of the play history. Readers take cheap `Arc` snapshots that
/// later appends never mutate.
#[derive(Debug)]
pub struct PlayHistoryTracker {
    retention: usize,
    snapshot: RwLock<Arc<HistorySnapshot>>,
}

impl PlayHistoryTracker {
    pub fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            snapshot: RwLock::new(Arc::new(HistorySnapshot::default())),
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub fn snapshot(&self) -> Arc<HistorySnapshot> {
        Arc::clone(&self.snapshot.read().expect("play history lock poisoned"))
    }

    pub fn record(
        &self,
        map: impl Into<String>,
        environment: Environment,
        round_index: u64,
    ) -> RecordOutcome {
        self.record_play(PlayRecord::new(map, environment, round_index))
    }

    /// Appends `play` unless its round is already recorded or older than the
    /// latest one.
    pub fn record_play(&self, play: PlayRecord) -> RecordOutcome {
        let (map, environment, round_index) = (play.map.clone(), play.environment, play.round_index);
        let mut guard = self.snapshot.write().expect("play history lock poisoned");

        if let Some(latest) = guard.latest() {
            let latest = latest.round_index;
            let outcome = if round_index == latest {
                RecordOutcome::Duplicate
            } else if round_index < latest {
                RecordOutcome::OutOfOrder { latest }
            } else {
                RecordOutcome::Appended
            };
            if outcome != RecordOutcome::Appended {
                warn!(
                    target: "votemap::history",
                    map = %map,
                    environment = %environment,
                    round_index,
                    latest,
                    "history.record_rejected"
                );
                return outcome;
            }
        }

        let mut records = guard.records.clone();
        records.push(play);
        *guard = Arc::new(HistorySnapshot::from_records(records, self.retention));
        let len = guard.len();
        drop(guard);

        info!(
            target: "votemap::history",
            map = %map,
            environment = %environment,
            round_index,
            len,
            "history.recorded"
        );
        RecordOutcome::Appended
    }
}

impl Default for PlayHistoryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_RETENTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parameters() -> WeightingParameters {
        WeightingParameters::from_json_str(
            r#"{
                "groups": {
                    "Top": {"weight": 100, "repeat_decay": 0.8, "maps": ["carentan", "omahabeach"]},
                    "Mid": {"weight": 80, "repeat_decay": 0.5, "maps": ["foy"]}
                },
                "environments": {
                    "Day": {"weight": 100, "repeat_decay": 0.8, "environments": ["day"]},
                    "Night": {"weight": 50, "repeat_decay": 0.1, "environments": ["night"]}
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn recency_counts_rounds_since_last_play() {
        let tracker = PlayHistoryTracker::new(10);
        tracker.record("carentan", Environment::Night, 1);
        tracker.record("foy", Environment::Day, 2);
        tracker.record("omahabeach", Environment::Day, 3);

        let params = parameters();
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.recency_of(&params, "Top", GroupKind::Map), Recency::Rounds(0));
        assert_eq!(snapshot.recency_of(&params, "Mid", GroupKind::Map), Recency::Rounds(1));
        assert_eq!(
            snapshot.recency_of(&params, "Night", GroupKind::Environment),
            Recency::Rounds(2)
        );
        assert_eq!(snapshot.recency_of(&params, "Ghost", GroupKind::Map), Recency::Never);
        assert_eq!(snapshot.recency_of_map("carentan"), Recency::Rounds(2));
        assert_eq!(snapshot.recency_of_map("kursk"), Recency::Never);
    }

    #[test]
    fn empty_history_reports_never() {
        let tracker = PlayHistoryTracker::default();
        let snapshot = tracker.snapshot();
        assert!(snapshot.is_empty());
        assert_eq!(
            snapshot.recency_of(&parameters(), "Top", GroupKind::Map),
            Recency::Never
        );
    }

    #[test]
    fn retention_discards_oldest_records() {
        let tracker = PlayHistoryTracker::new(2);
        tracker.record("foy", Environment::Day, 1);
        tracker.record("carentan", Environment::Day, 2);
        tracker.record("omahabeach", Environment::Day, 3);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.records()[0].map(), "carentan");
        assert_eq!(
            snapshot.recency_of(&parameters(), "Mid", GroupKind::Map),
            Recency::Never
        );
    }

    #[test]
    fn rejects_duplicate_and_stale_rounds() {
        let tracker = PlayHistoryTracker::new(5);
        assert_eq!(tracker.record("foy", Environment::Day, 4), RecordOutcome::Appended);
        assert_eq!(tracker.record("foy", Environment::Day, 4), RecordOutcome::Duplicate);
        assert_eq!(
            tracker.record("carentan", Environment::Night, 2),
            RecordOutcome::OutOfOrder { latest: 4 }
        );
        assert_eq!(tracker.snapshot().len(), 1);
    }

    #[test]
    fn snapshots_are_unaffected_by_later_appends() {
        let tracker = PlayHistoryTracker::new(5);
        tracker.record("foy", Environment::Day, 1);
        let before = tracker.snapshot();
        tracker.record("carentan", Environment::Day, 2);
        assert_eq!(before.len(), 1);
        assert_eq!(tracker.snapshot().len(), 2);
    }

    #[test]
    fn unordered_records_are_sorted_by_round() {
        let snapshot = HistorySnapshot::from_records(
            vec![
                PlayRecord::new("carentan", Environment::Day, 5),
                PlayRecord::new("foy", Environment::Day, 2),
            ],
            10,
        );
        assert_eq!(snapshot.latest().map(PlayRecord::map), Some("carentan"));
        assert_eq!(snapshot.recency_of_map("carentan"), Recency::Rounds(0));
        assert_eq!(snapshot.recency_of_map("foy"), Recency::Rounds(3));
    }

    #[test]
    fn stored_history_is_normalized_on_load() {
        let snapshot: HistorySnapshot = serde_json::from_str(
            r#"{"records": [
                {"map": "carentan", "environment": "day", "round_index": 5},
                {"map": "foy", "environment": "night", "round_index": 2},
                {"map": "kursk", "environment": "day", "round_index": 5}
            ]}"#,
        )
        .expect("history decodes");
        let maps: Vec<&str> = snapshot.records().iter().map(PlayRecord::map).collect();
        assert_eq!(maps, vec!["foy", "carentan"]);
        assert_eq!(snapshot.recency_of_map("foy"), Recency::Rounds(3));
    }

    #[test]
    fn named_layers_are_kept_with_the_record() {
        let tracker = PlayHistoryTracker::new(5);
        let play = PlayRecord::new("foy", Environment::Night, 3).with_layer("foy_warfare_night");
        assert_eq!(tracker.record_play(play), RecordOutcome::Appended);
        assert_eq!(
            tracker.snapshot().latest().and_then(PlayRecord::layer_id),
            Some("foy_warfare_night")
        );
    }
}
