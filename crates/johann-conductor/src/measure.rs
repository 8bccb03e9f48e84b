use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use crate::error::{JohannError, JohannResult};
use crate::log_prefix;
use crate::player::TaskMapEntry;
use crate::special_args::{parse_special_arg, SpecialArg};
use crate::state::TaskState;
use crate::stored::StoredData;
use crate::task::{group_status, GroupHandle, GroupStatus, TaskBroker};

/// Seconds, or a `johann.random.<low>-<high>` token drawn at dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StartDelay {
    Seconds(u64),
    Special(String),
}

impl StartDelay {
    pub fn validate(&self) -> JohannResult<()> {
        match self {
            StartDelay::Seconds(_) => Ok(()),
            StartDelay::Special(raw) => match parse_special_arg(raw) {
                Ok(SpecialArg::Random { .. }) => Ok(()),
                _ => Err(JohannError::validation(
                    "start_delay must be an integer or a special argument string",
                )),
            },
        }
    }

    pub fn resolve<R: Rng>(&self, rng: &mut R) -> JohannResult<u64> {
        match self {
            StartDelay::Seconds(secs) => Ok(*secs),
            StartDelay::Special(raw) => match parse_special_arg(raw)? {
                SpecialArg::Random { low, high } => Ok(rng.gen_range(low..=high)),
                SpecialArg::Stored(_) => Err(JohannError::validation(format!(
                    "start_delay '{}' must resolve to an integer",
                    raw
                ))),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasureDef {
    pub name: String,
    pub players: Vec<String>,
    pub task: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub store_as: Option<String>,
    #[serde(default)]
    pub store_singleton: bool,
    #[serde(default)]
    pub store_interim_results: bool,
    #[serde(default)]
    pub lazy_fetch_stored: bool,
    #[serde(default)]
    pub start_delay: Option<StartDelay>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub dependency_proof: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "MeasureDef")]
pub struct Measure {
    pub name: String,
    #[serde(rename = "players")]
    pub player_names: Vec<String>,
    #[serde(rename = "task")]
    pub task_name: String,
    pub args: Vec<Value>,
    pub store_as: Option<String>,
    pub store_singleton: bool,
    pub store_interim_results: bool,
    pub lazy_fetch_stored: bool,
    pub start_delay: Option<StartDelay>,
    pub depends_on: Vec<String>,
    pub dependency_proof: bool,

    pub state: TaskState,
    /// player -> (task id, or "all") -> message
    pub status: BTreeMap<String, BTreeMap<String, String>>,
    pub finished: bool,
    pub local_measure: bool,
    #[serde(skip)]
    pub groups: BTreeMap<String, GroupHandle>,
    /// Players whose dispatch was attempted and never reached the broker.
    #[serde(skip)]
    pub dispatch_failed: BTreeSet<String>,
}

/// Keys written by the conductor while a measure runs, never by a score file.
pub const RUNTIME_FIELDS: [&str; 4] = ["state", "status", "finished", "local_measure"];

impl From<MeasureDef> for Measure {
    fn from(def: MeasureDef) -> Self {
        Measure {
            name: def.name,
            player_names: def.players,
            task_name: def.task,
            args: def.args,
            store_as: def.store_as,
            store_singleton: def.store_singleton,
            store_interim_results: def.store_interim_results,
            lazy_fetch_stored: def.lazy_fetch_stored,
            start_delay: def.start_delay,
            depends_on: def.depends_on,
            dependency_proof: def.dependency_proof,
            state: TaskState::Pending,
            status: BTreeMap::new(),
            finished: false,
            local_measure: false,
            groups: BTreeMap::new(),
            dispatch_failed: BTreeSet::new(),
        }
    }
}

impl Measure {
    /// Conductor-internal measure run on the conductor's own queue.
    pub fn local(name: &str, player: &str, task: &str) -> Self {
        let mut measure = Measure::from(MeasureDef {
            name: name.to_string(),
            players: vec![player.to_string()],
            task: task.to_string(),
            args: Vec::new(),
            store_as: None,
            store_singleton: false,
            store_interim_results: false,
            lazy_fetch_stored: false,
            start_delay: Some(StartDelay::Seconds(0)),
            depends_on: Vec::new(),
            dependency_proof: false,
        });
        measure.local_measure = true;
        measure
    }

    pub fn started(&self) -> bool {
        self.state != TaskState::Pending
    }

    pub fn reset(&mut self) {
        self.state = TaskState::Pending;
        self.status.clear();
        self.finished = false;
        self.groups.clear();
        self.dispatch_failed.clear();
    }

    pub fn record_failure(&mut self, player: &str, key: &str, msg: String) {
        self.state = TaskState::Failure;
        self.status
            .entry(player.to_string())
            .or_default()
            .insert(key.to_string(), msg);
    }

    pub fn task_status(&self, broker: &dyn TaskBroker) -> BTreeMap<String, GroupStatus> {
        self.groups
            .iter()
            .map(|(player, handle)| (player.clone(), group_status(broker, handle)))
            .collect()
    }

    /// Pulls group status for every dispatched player, escalates this
    /// measure's state, and persists whatever results are present.
    ///
    /// A measure is finished once every player is finished: its group reached
    /// a terminal state, or its dispatch failed before reaching the broker.
    pub fn evaluate_state(
        &mut self,
        broker: &dyn TaskBroker,
        task_map: &BTreeMap<String, TaskMapEntry>,
        stored: &mut StoredData,
        score_name: &str,
    ) {
        let prefix = log_prefix(Some(score_name), Some(&self.name), None, None);
        let groups = self.task_status(broker);
        let prior = self.state;

        let mut success = 0;
        let mut finished = self
            .dispatch_failed
            .iter()
            .filter(|p| !self.groups.contains_key(*p))
            .count();
        for (player, group) in &groups {
            if group.finished {
                finished += 1;
            }
            if group.state == TaskState::Success {
                success += 1;
            }
            self.state = self.state.escalate(group.state);
            if !group.status.is_empty() {
                self.status.insert(player.clone(), group.status.clone());
            }
        }

        if success == self.player_names.len() {
            self.state = TaskState::Success;
        }
        if finished == self.player_names.len() {
            self.finished = true;
        }
        if self.state == TaskState::Failure && prior != TaskState::Failure {
            warn!(
                "{}| measure '{}' failed: {}",
                prefix,
                self.name,
                serde_json::to_string(&self.status).unwrap_or_default()
            );
        }

        self.store_results(&groups, task_map, stored, &prefix);
    }

    /// Stores `{host: result}` per player under `store_as`, or each result
    /// flat when `store_singleton`. Partial results are stored as they appear.
    pub fn store_results(
        &self,
        groups: &BTreeMap<String, GroupStatus>,
        task_map: &BTreeMap<String, TaskMapEntry>,
        stored: &mut StoredData,
        prefix: &str,
    ) -> Option<Value> {
        let key = self.store_as.as_deref()?;
        let mut results = Map::new();
        for (player, group) in groups {
            let mut by_host = Map::new();
            for task in &group.tasks {
                let result = match task.state {
                    TaskState::Success => task.result.clone(),
                    _ if self.store_interim_results => task
                        .meta
                        .as_ref()
                        .and_then(|meta| meta.get("interim_result"))
                        .cloned(),
                    _ => None,
                };
                let Some(result) = result.filter(|r| !r.is_null()) else {
                    continue;
                };
                if self.store_singleton {
                    stored.store(key, None, result.clone(), prefix);
                }
                let host_key = match task_map.get(&task.id) {
                    Some(entry) => entry.host_name.clone(),
                    None => {
                        info!("{}| task {} not found in task_map", prefix, task.id);
                        task.id.clone()
                    }
                };
                by_host.insert(host_key, result);
            }
            if !by_host.is_empty() && !self.store_singleton {
                stored.store(key, Some(player), Value::Object(by_host.clone()), prefix);
            }
            results.insert(player.clone(), Value::Object(by_host));
        }
        Some(Value::Object(results))
    }

    pub fn get_status(&self, broker: &dyn TaskBroker, short: bool) -> Value {
        let mut out = Map::new();
        if let Some(delay) = &self.start_delay {
            out.insert("start_delay".to_string(), json!(delay));
        }
        out.insert("depends_on".to_string(), json!(self.depends_on));
        out.insert("dependency_proof".to_string(), json!(self.dependency_proof));
        out.insert("state".to_string(), json!(self.state));
        if !self.status.is_empty() || !short {
            out.insert("status".to_string(), json!(self.status));
        }
        out.insert("finished".to_string(), json!(self.finished));
        let task_status: Map<String, Value> = self
            .task_status(broker)
            .iter()
            .map(|(player, group)| (player.clone(), group.to_json(short)))
            .collect();
        out.insert("task_status".to_string(), Value::Object(task_status));
        out.insert("local_measure".to_string(), json!(self.local_measure));
        Value::Object(out)
    }

    pub fn dump(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskSignature, TaskStatus};
    use anyhow::Result;
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[derive(Default)]
    struct FixedBroker {
        statuses: Mutex<BTreeMap<String, TaskStatus>>,
    }

    impl FixedBroker {
        fn set(&self, id: &str, state: TaskState, result: Option<Value>, meta: Option<Value>) {
            let mut status = TaskStatus::pending(id);
            status.state = state;
            status.result = result;
            status.meta = meta;
            if state == TaskState::Failure {
                status.error = Some("boom".to_string());
            }
            self.statuses.lock().insert(id.to_string(), status);
        }
    }

    impl TaskBroker for FixedBroker {
        fn submit(&self, _signature: TaskSignature) -> Result<()> {
            Ok(())
        }

        fn task_status(&self, task_id: &str) -> TaskStatus {
            self.statuses
                .lock()
                .get(task_id)
                .cloned()
                .unwrap_or_else(|| TaskStatus::pending(task_id))
        }
    }

    fn measure(raw: Value) -> Measure {
        serde_json::from_value(raw).expect("measure")
    }

    fn dispatched(m: &mut Measure, player: &str, ids: &[&str], task_map: &mut BTreeMap<String, TaskMapEntry>) {
        m.groups.insert(
            player.to_string(),
            GroupHandle {
                id: format!("g_{}", player),
                task_ids: ids.iter().map(|s| s.to_string()).collect(),
            },
        );
        for (i, id) in ids.iter().enumerate() {
            task_map.insert(
                id.to_string(),
                TaskMapEntry {
                    measure_name: m.name.clone(),
                    player_name: player.to_string(),
                    host_name: format!("{}_h{}", player, i),
                },
            );
        }
    }

    #[test]
    fn start_delay_accepts_integers_and_random_tokens() {
        let mut rng = StdRng::seed_from_u64(7);
        let m = measure(json!({"name": "m", "players": ["p"], "task": "t", "start_delay": 4}));
        assert_eq!(m.start_delay.as_ref().expect("delay").resolve(&mut rng).expect("secs"), 4);

        let delay = StartDelay::Special("johann.random.2-3".to_string());
        delay.validate().expect("valid");
        let drawn = delay.resolve(&mut rng).expect("drawn");
        assert!((2..=3).contains(&drawn));

        let stored = StartDelay::Special("johann.stored.x".to_string());
        assert!(stored.validate().is_err());
        assert!(stored.resolve(&mut rng).is_err());
        assert!(StartDelay::Special("soon".to_string()).validate().is_err());
    }

    #[test]
    fn success_requires_every_player() {
        let broker = FixedBroker::default();
        let mut task_map = BTreeMap::new();
        let mut stored = StoredData::new();
        let mut m = measure(json!({"name": "m", "players": ["p1", "p2"], "task": "t", "store_as": "r"}));
        m.state = TaskState::Queued;
        dispatched(&mut m, "p1", &["a"], &mut task_map);
        dispatched(&mut m, "p2", &["b"], &mut task_map);

        broker.set("a", TaskState::Success, Some(json!(1)), None);
        broker.set("b", TaskState::Started, None, None);
        m.evaluate_state(&broker, &task_map, &mut stored, "s");
        assert_eq!(m.state, TaskState::Started);
        assert!(!m.finished);
        assert_eq!(stored.get("r"), Some(&json!({"p1": {"p1_h0": 1}})));

        broker.set("b", TaskState::Success, Some(json!([1, 2])), None);
        m.evaluate_state(&broker, &task_map, &mut stored, "s");
        assert_eq!(m.state, TaskState::Success);
        assert!(m.finished);
        assert_eq!(stored.get("r").expect("r")["p2"], json!({"p2_h0": [1, 2]}));
    }

    #[test]
    fn failure_waits_for_running_players() {
        let broker = FixedBroker::default();
        let mut task_map = BTreeMap::new();
        let mut stored = StoredData::new();
        let mut m = measure(json!({"name": "m", "players": ["p1", "p2"], "task": "t"}));
        dispatched(&mut m, "p1", &["a"], &mut task_map);
        dispatched(&mut m, "p2", &["b"], &mut task_map);

        broker.set("a", TaskState::Failure, None, None);
        broker.set("b", TaskState::Progress, None, Some(json!({"current": 1, "total": 2})));
        m.evaluate_state(&broker, &task_map, &mut stored, "s");
        assert_eq!(m.state, TaskState::Failure);
        assert!(!m.finished);
        assert_eq!(m.status["p1"]["a"], "boom");

        broker.set("b", TaskState::Success, None, None);
        m.evaluate_state(&broker, &task_map, &mut stored, "s");
        assert_eq!(m.state, TaskState::Failure);
        assert!(m.finished);
    }

    #[test]
    fn failed_dispatch_counts_as_finished() {
        let broker = FixedBroker::default();
        let mut task_map = BTreeMap::new();
        let mut stored = StoredData::new();
        let mut m = measure(json!({"name": "m", "players": ["p1", "p2"], "task": "t"}));
        dispatched(&mut m, "p1", &["a"], &mut task_map);
        m.dispatch_failed.insert("p2".to_string());
        m.record_failure("p2", "all", "failed to play measure m".to_string());

        broker.set("a", TaskState::Started, None, None);
        m.evaluate_state(&broker, &task_map, &mut stored, "s");
        assert!(!m.finished);
        broker.set("a", TaskState::Success, None, None);
        m.evaluate_state(&broker, &task_map, &mut stored, "s");
        assert_eq!(m.state, TaskState::Failure);
        assert!(m.finished);
    }

    #[test]
    fn singleton_and_interim_storage() {
        let broker = FixedBroker::default();
        let mut task_map = BTreeMap::new();
        let mut stored = StoredData::new();
        let mut m = measure(json!({
            "name": "m", "players": ["p1"], "task": "t",
            "store_as": "single", "store_singleton": true, "store_interim_results": true
        }));
        dispatched(&mut m, "p1", &["a"], &mut task_map);

        broker.set("a", TaskState::Progress, None, Some(json!({"current": 1, "total": 2, "interim_result": "half"})));
        m.evaluate_state(&broker, &task_map, &mut stored, "s");
        assert_eq!(stored.get("single"), Some(&json!("half")));

        broker.set("a", TaskState::Success, Some(json!("done")), None);
        m.evaluate_state(&broker, &task_map, &mut stored, "s");
        assert_eq!(stored.get("single"), Some(&json!("done")));
    }

    #[test]
    fn status_and_dump_shapes() {
        let broker = FixedBroker::default();
        let m = measure(json!({"name": "m", "players": ["p1"], "task": "t", "start_delay": "johann.random.1-2"}));
        let status = m.get_status(&broker, true);
        assert_eq!(status["state"], json!("PENDING"));
        assert_eq!(status["start_delay"], json!("johann.random.1-2"));
        assert!(status.get("status").is_none());
        assert!(m.get_status(&broker, false).get("status").is_some());

        let dump = m.dump();
        assert_eq!(dump["players"], json!(["p1"]));
        assert_eq!(dump["task"], json!("t"));
        assert!(dump.get("groups").is_none());
    }
}
