//! Objective progress tracking for one interview conversation.
//!
//! Each conversation owns an ordered map of named objectives. The map is
//! replaced wholesale when the model reports one inline, and patched field
//! by field when the asynchronous progress summarizer runs. A revision
//! counter decides which of the two wins a race.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::database::ConversationStore;

pub const DEFAULT_OBJECTIVE_COUNT: usize = 5;
pub const DEFAULT_OBJECTIVE_TARGET: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectiveStatus {
    Tbc,
    Current,
    Done,
}

impl ObjectiveStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectiveStatus::Tbc => "tbc",
            ObjectiveStatus::Current => "current",
            ObjectiveStatus::Done => "done",
        }
    }

    /// Tolerant parse; model output mixes case freely.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tbc" => Some(ObjectiveStatus::Tbc),
            "current" => Some(ObjectiveStatus::Current),
            "done" => Some(ObjectiveStatus::Done),
            _ => None,
        }
    }

    fn weight(self) -> u32 {
        match self {
            ObjectiveStatus::Done => 100,
            ObjectiveStatus::Current => 50,
            ObjectiveStatus::Tbc => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub status: ObjectiveStatus,
    #[serde(default)]
    pub count: u32,
    #[serde(default = "default_target")]
    pub target: u32,
    #[serde(default)]
    pub guidance: String,
}

fn default_target() -> u32 {
    DEFAULT_OBJECTIVE_TARGET
}

/// Ordered mapping from objective key (`objective01`, ...) to its state.
pub type ObjectiveMap = BTreeMap<String, Objective>;

/// Durable progress state for one conversation. `revision` increases on
/// every wholesale replacement and gates stale summarizer patches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationProgress {
    pub objectives: ObjectiveMap,
    #[serde(default)]
    pub revision: u64,
}

impl ConversationProgress {
    pub fn new_skeleton() -> Self {
        Self {
            objectives: default_objectives(),
            revision: 0,
        }
    }
}

/// A targeted field update from the progress summarizer,
/// e.g. `{ "path": "objective02.status", "value": "done" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressPatch {
    pub path: String,
    pub value: Value,
}

/// The default skeleton: first objective is live, the rest pending.
pub fn default_objectives() -> ObjectiveMap {
    let mut objectives = ObjectiveMap::new();
    for index in 1..=DEFAULT_OBJECTIVE_COUNT {
        let status = if index == 1 {
            ObjectiveStatus::Current
        } else {
            ObjectiveStatus::Tbc
        };
        objectives.insert(
            format!("objective{index:02}"),
            Objective {
                status,
                count: 0,
                target: DEFAULT_OBJECTIVE_TARGET,
                guidance: String::new(),
            },
        );
    }
    objectives
}

/// Lenient per-entry conversion of a recovered `currentObjectives` value.
/// Entries with an unusable shape are dropped rather than rejecting the map;
/// an empty result counts as no map at all.
pub fn objective_map_from_value(value: &Value) -> Option<ObjectiveMap> {
    let raw_map = value.as_object()?;
    let mut objectives = ObjectiveMap::new();
    for (key, entry) in raw_map {
        let Some(fields) = entry.as_object() else {
            tracing::debug!(key = %key, "objective entry is not an object, skipping");
            continue;
        };
        let status = fields
            .get("status")
            .and_then(Value::as_str)
            .and_then(ObjectiveStatus::parse)
            .unwrap_or(ObjectiveStatus::Tbc);
        let count = coerce_u32(fields.get("count")).unwrap_or(0);
        let target = coerce_u32(fields.get("target")).unwrap_or(DEFAULT_OBJECTIVE_TARGET);
        let guidance = fields
            .get("guidance")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        objectives.insert(
            key.clone(),
            Objective {
                status,
                count,
                target,
                guidance,
            },
        );
    }
    if objectives.is_empty() {
        None
    } else {
        Some(objectives)
    }
}

fn coerce_u32(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::Number(n) => n.as_u64().map(|n| n as u32),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn all_objectives_done(objectives: &ObjectiveMap) -> bool {
    !objectives.is_empty()
        && objectives
            .values()
            .all(|o| o.status == ObjectiveStatus::Done)
}

/// Coarse completion heuristic: done=100, current=50, tbc=0, averaged and
/// rounded. Stable, bounded, and zero for an empty map.
pub fn completion_percentage(objectives: &ObjectiveMap) -> u8 {
    if objectives.is_empty() {
        return 0;
    }
    let total: u32 = objectives.values().map(|o| o.status.weight()).sum();
    let mean = f64::from(total) / objectives.len() as f64;
    mean.round() as u8
}

/// Completion from a raw progress snapshot. Malformed input degrades to 0.
pub fn completion_from_json(raw: &str) -> u8 {
    match serde_json::from_str::<ConversationProgress>(raw) {
        Ok(progress) => completion_percentage(&progress.objectives),
        Err(e) => {
            tracing::warn!("unusable progress snapshot, treating as 0%: {e}");
            0
        }
    }
}

/// Owns load/replace/patch of per-conversation progress.
pub struct ProgressEngine {
    store: Arc<dyn ConversationStore>,
}

impl ProgressEngine {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    /// Load a conversation's progress, creating the default skeleton on
    /// first touch. Idempotent.
    pub fn initialize(&self, conversation_id: &str) -> Result<ConversationProgress> {
        if let Some(existing) = self
            .store
            .load_progress(conversation_id)
            .context("loading progress")?
        {
            return Ok(existing);
        }
        let fresh = ConversationProgress::new_skeleton();
        self.store
            .save_progress(conversation_id, &fresh)
            .context("seeding progress skeleton")?;
        tracing::debug!(conversation_id, "seeded default objective skeleton");
        Ok(fresh)
    }

    /// Wholesale replacement from a freshly recovered inline map. Bumps the
    /// revision so in-flight summarizer patches for the old state are
    /// recognizably stale.
    pub fn apply_recovered(
        &self,
        conversation_id: &str,
        objectives: ObjectiveMap,
    ) -> Result<ConversationProgress> {
        let current = self.initialize(conversation_id)?;
        let updated = ConversationProgress {
            objectives,
            revision: current.revision + 1,
        };
        self.store.save_progress(conversation_id, &updated)?;
        tracing::debug!(
            conversation_id,
            revision = updated.revision,
            "applied inline objective map"
        );
        Ok(updated)
    }

    /// Targeted field patches from the progress summarizer. Last write wins
    /// per path. The whole batch is dropped when a wholesale replacement
    /// landed after the summarizer captured its input.
    pub fn apply_patches(
        &self,
        conversation_id: &str,
        patches: &[ProgressPatch],
        observed_revision: u64,
    ) -> Result<ConversationProgress> {
        let mut progress = self.initialize(conversation_id)?;
        if progress.revision > observed_revision {
            tracing::info!(
                conversation_id,
                observed_revision,
                current_revision = progress.revision,
                "patch batch superseded by a newer wholesale replacement, ignoring"
            );
            return Ok(progress);
        }

        let mut changed = false;
        for patch in patches {
            if apply_single_patch(&mut progress.objectives, patch) {
                changed = true;
            }
        }
        if changed {
            self.store.save_progress(conversation_id, &progress)?;
        }
        Ok(progress)
    }
}

fn apply_single_patch(objectives: &mut ObjectiveMap, patch: &ProgressPatch) -> bool {
    let Some((key, field)) = patch.path.split_once('.') else {
        tracing::warn!(path = %patch.path, "patch path is not of the form key.field, skipping");
        return false;
    };
    let Some(objective) = objectives.get_mut(key) else {
        tracing::warn!(path = %patch.path, "patch targets unknown objective, skipping");
        return false;
    };
    match field {
        "status" => {
            let parsed = patch
                .value
                .as_str()
                .and_then(ObjectiveStatus::parse);
            match parsed {
                Some(status) => {
                    objective.status = status;
                    true
                }
                None => {
                    tracing::warn!(path = %patch.path, value = %patch.value, "unusable status value, skipping");
                    false
                }
            }
        }
        "count" => match coerce_u32(Some(&patch.value)) {
            Some(count) => {
                objective.count = count;
                true
            }
            None => {
                tracing::warn!(path = %patch.path, value = %patch.value, "unusable count value, skipping");
                false
            }
        },
        "target" => match coerce_u32(Some(&patch.value)) {
            Some(target) => {
                objective.target = target;
                true
            }
            None => {
                tracing::warn!(path = %patch.path, value = %patch.value, "unusable target value, skipping");
                false
            }
        },
        "guidance" => {
            objective.guidance = patch
                .value
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| patch.value.to_string());
            true
        }
        other => {
            tracing::warn!(path = %patch.path, field = other, "patch targets unknown field, skipping");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqliteStore;
    use serde_json::json;

    fn engine() -> (ProgressEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("test.db")).unwrap();
        (ProgressEngine::new(Arc::new(store)), dir)
    }

    #[test]
    fn skeleton_has_one_current_objective() {
        let objectives = default_objectives();
        assert_eq!(objectives.len(), DEFAULT_OBJECTIVE_COUNT);
        let current = objectives
            .values()
            .filter(|o| o.status == ObjectiveStatus::Current)
            .count();
        assert_eq!(current, 1);
        assert_eq!(objectives["objective01"].status, ObjectiveStatus::Current);
    }

    #[test]
    fn completion_bounds() {
        assert_eq!(completion_percentage(&ObjectiveMap::new()), 0);

        let skeleton = default_objectives();
        let pct = completion_percentage(&skeleton);
        assert!(pct <= 100);
        assert_eq!(pct, 10); // one of five at 50%

        let mut done = skeleton.clone();
        for objective in done.values_mut() {
            objective.status = ObjectiveStatus::Done;
        }
        assert_eq!(completion_percentage(&done), 100);
    }

    #[test]
    fn completion_is_monotonic_under_forward_patches() {
        let (engine, _dir) = engine();
        let id = "conv-monotonic";
        engine.initialize(id).unwrap();

        let sequence = vec![
            ProgressPatch {
                path: "objective01.status".into(),
                value: json!("done"),
            },
            ProgressPatch {
                path: "objective02.status".into(),
                value: json!("current"),
            },
            ProgressPatch {
                path: "objective02.status".into(),
                value: json!("done"),
            },
            ProgressPatch {
                path: "objective03.status".into(),
                value: json!("current"),
            },
        ];

        let mut last = completion_percentage(&engine.initialize(id).unwrap().objectives);
        for patch in sequence {
            let progress = engine.apply_patches(id, &[patch], 0).unwrap();
            let pct = completion_percentage(&progress.objectives);
            assert!(pct >= last, "completion went backwards: {last} -> {pct}");
            last = pct;
        }
    }

    #[test]
    fn initialize_is_idempotent() {
        let (engine, _dir) = engine();
        let first = engine.initialize("conv-a").unwrap();
        let second = engine.initialize("conv-a").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn stale_patch_batch_is_ignored() {
        let (engine, _dir) = engine();
        let id = "conv-race";
        engine.initialize(id).unwrap();

        // A fresher inline map lands first...
        let mut replaced = default_objectives();
        replaced.get_mut("objective01").unwrap().status = ObjectiveStatus::Done;
        let after_replace = engine.apply_recovered(id, replaced).unwrap();
        assert_eq!(after_replace.revision, 1);

        // ...then a patch captured against revision 0 tries to undo it.
        let stale = ProgressPatch {
            path: "objective01.status".into(),
            value: json!("current"),
        };
        let progress = engine.apply_patches(id, &[stale], 0).unwrap();
        assert_eq!(
            progress.objectives["objective01"].status,
            ObjectiveStatus::Done
        );
    }

    #[test]
    fn patches_are_last_write_wins_per_path() {
        let (engine, _dir) = engine();
        let id = "conv-lww";
        engine.initialize(id).unwrap();

        let batch = vec![
            ProgressPatch {
                path: "objective01.count".into(),
                value: json!(1),
            },
            ProgressPatch {
                path: "objective01.count".into(),
                value: json!("2"),
            },
        ];
        let progress = engine.apply_patches(id, &batch, 0).unwrap();
        assert_eq!(progress.objectives["objective01"].count, 2);
    }

    #[test]
    fn unusable_patches_are_skipped_without_error() {
        let (engine, _dir) = engine();
        let id = "conv-bad-patch";
        engine.initialize(id).unwrap();

        let batch = vec![
            ProgressPatch {
                path: "nonsense".into(),
                value: json!("done"),
            },
            ProgressPatch {
                path: "objective99.status".into(),
                value: json!("done"),
            },
            ProgressPatch {
                path: "objective01.status".into(),
                value: json!(17),
            },
            ProgressPatch {
                path: "objective01.status".into(),
                value: json!("done"),
            },
        ];
        let progress = engine.apply_patches(id, &batch, 0).unwrap();
        assert_eq!(
            progress.objectives["objective01"].status,
            ObjectiveStatus::Done
        );
    }

    #[test]
    fn lenient_map_conversion_drops_bad_entries() {
        let value = json!({
            "objective01": {"status": "DONE", "count": "2", "target": 3},
            "objective02": "not an object",
            "objective03": {"status": "mystery"}
        });
        let map = objective_map_from_value(&value).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["objective01"].status, ObjectiveStatus::Done);
        assert_eq!(map["objective01"].count, 2);
        assert_eq!(map["objective03"].status, ObjectiveStatus::Tbc);
    }

    #[test]
    fn malformed_progress_json_degrades_to_zero() {
        assert_eq!(completion_from_json("not json at all"), 0);
        assert_eq!(completion_from_json("null"), 0);
    }

    #[test]
    fn all_done_requires_nonempty_map() {
        assert!(!all_objectives_done(&ObjectiveMap::new()));
        let mut map = default_objectives();
        assert!(!all_objectives_done(&map));
        for objective in map.values_mut() {
            objective.status = ObjectiveStatus::Done;
        }
        assert!(all_objectives_done(&map));
    }
}
