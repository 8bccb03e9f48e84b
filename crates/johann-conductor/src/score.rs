use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::host::{Host, SharedHost};
use crate::log_prefix;
use crate::measure::{Measure, RUNTIME_FIELDS};
use crate::orchestra::Orchestra;
use crate::player::{Dispatch, Player, TaskMapEntry};
use crate::special_args::{transform_args, ArgContext};
use crate::state::TaskState;
use crate::stored::StoredData;
use crate::task::{TaskBroker, TUNE_HOST_TASK};

/// Conductor-local measure every user measure implicitly depends on.
pub const TUNE_ORCHESTRA: &str = "tune_orchestra";

/// Score-level keys that only the conductor writes.
const SCORE_RUNTIME_FIELDS: [&str; 9] = [
    "state",
    "status",
    "finished",
    "started_at",
    "finished_at",
    "stored_data",
    "task_map",
    "last_successful_roll_call",
    "file_name",
];

/// Status text recorded when the scheduling loop dies; details are logged.
const SCHEDULING_FAULT: &str = "internal error in scheduling loop; see conductor logs";

pub type SharedScore = Arc<Mutex<Score>>;

/// measure -> player -> host (or task id) -> message
pub type ScoreStatus = BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>;

/// One run of a scenario: players, measures and everything the run produces.
#[derive(Debug, Clone, Serialize)]
pub struct Score {
    pub name: String,
    pub version: String,
    pub category: String,
    pub description: String,
    pub players: BTreeMap<String, Player>,
    pub measures: Vec<Measure>,
    pub file_name: String,
    pub create_hosts: bool,
    pub discard_hosts: bool,

    pub state: TaskState,
    pub status: ScoreStatus,
    pub finished: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stored_data: StoredData,
    pub task_map: BTreeMap<String, TaskMapEntry>,
    pub last_successful_roll_call: Option<DateTime<Utc>>,
    #[serde(skip)]
    unqueued: Vec<String>,
}

impl Score {
    pub fn new(name: &str, players: Vec<Player>, measures: Vec<Measure>) -> Self {
        Score {
            name: name.to_string(),
            version: "1.0".to_string(),
            category: "none".to_string(),
            description: String::new(),
            players: players.into_iter().map(|p| (p.name.clone(), p)).collect(),
            measures,
            file_name: String::new(),
            create_hosts: false,
            discard_hosts: false,
            state: TaskState::Pending,
            status: BTreeMap::new(),
            finished: false,
            started_at: None,
            finished_at: None,
            stored_data: StoredData::new(),
            task_map: BTreeMap::new(),
            last_successful_roll_call: None,
            unqueued: Vec::new(),
        }
    }

    fn prefix(&self) -> String {
        log_prefix(Some(&self.name), None, None, None)
    }

    /// A run has started and not yet finished.
    pub fn is_playing(&self) -> bool {
        self.started_at.is_some() && !self.finished
    }

    pub fn measure(&self, name: &str) -> Option<&Measure> {
        self.measures.iter().find(|m| m.name == name)
    }

    fn measure_index(&self, name: &str) -> Option<usize> {
        self.measures.iter().position(|m| m.name == name)
    }

    /// Fills every player up to its scale with synthesized host names and
    /// returns them. Names stay reserved in the registry until registered or
    /// released, so concurrent calls never collide.
    pub fn map_missing_hosts(&mut self, orch: &Orchestra) -> Vec<String> {
        let external = orch.controls.all_host_names();
        let allhosts = orch.config.conductor_allhosts_player_name.as_str();
        let prefix = self.prefix();
        let players = &mut self.players;
        let mut synthesized = Vec::new();
        orch.hosts.reserve_names(&external, |taken| {
            for player in players.values_mut() {
                if player.name == allhosts {
                    continue;
                }
                while player.hostnames.len() < player.scale {
                    let name = loop {
                        let suffix = Uuid::new_v4().simple().to_string();
                        let candidate = format!("{}_{}", player.name, &suffix[..6]);
                        if !taken.contains(&candidate) {
                            break candidate;
                        }
                    };
                    debug!("{}| mapped missing host {} to player {}", prefix, name, player.name);
                    taken.insert(name.clone());
                    synthesized.push(name.clone());
                    player.hostnames.push(name);
                }
            }
        });
        synthesized
    }

    /// Unmaps synthesized names that never got registered and ends their
    /// reservations, so a later roll call maps fresh ones.
    fn release_unregistered(&mut self, orch: &Orchestra, synthesized: &[String]) {
        let stale: Vec<String> = synthesized
            .iter()
            .filter(|name| !orch.hosts.contains(name))
            .cloned()
            .collect();
        if stale.is_empty() {
            return;
        }
        for player in self.players.values_mut() {
            player.hostnames.retain(|h| !stale.contains(h));
        }
        orch.hosts.release_names(&stale);
        debug!("{}| released unregistered host names {:?}", self.prefix(), stale);
    }

    /// Checks that every player maps onto hosts that exist (or will be
    /// created) and can be reached through a registered control method.
    pub fn validate_create_host_mappings(&mut self, orch: &Orchestra) -> (bool, Vec<String>) {
        let synthesized = if self.create_hosts {
            self.map_missing_hosts(orch)
        } else {
            Vec::new()
        };
        let result = self.check_host_mappings(orch);
        self.release_unregistered(orch, &synthesized);
        result
    }

    fn check_host_mappings(&self, orch: &Orchestra) -> (bool, Vec<String>) {
        let config = orch.config.as_ref();
        let now = Utc::now();
        let mut errors = Vec::new();

        for player in self.players.values() {
            if player.name == config.conductor_allhosts_player_name {
                continue;
            }
            let prefix = log_prefix(Some(&self.name), None, Some(&player.name), None);
            if player.hostnames.is_empty() && !self.create_hosts {
                let msg = format!("{}: no hosts mapped", player.name);
                if player.scale == 0 && config.allow_empty_player_hosts {
                    debug!("{}| {}", prefix, msg);
                } else {
                    warn!("{}| {}", prefix, msg);
                    errors.push(msg);
                    continue;
                }
            } else if player.hostnames.len() != player.scale && !self.create_hosts {
                let msg = format!(
                    "{}: length of hosts does not match scale ({})",
                    player.name, player.scale
                );
                warn!("{}| {}", prefix, msg);
                errors.push(msg);
                continue;
            }

            for hostname in &player.hostnames {
                if let Err(msg) = self.check_host(orch, player, hostname, now) {
                    warn!("{}| {}", prefix, msg);
                    errors.push(msg);
                }
            }
        }
        (errors.is_empty(), errors)
    }

    fn check_host(&self, orch: &Orchestra, player: &Player, hostname: &str, now: DateTime<Utc>) -> Result<(), String> {
        let config = orch.config.as_ref();
        let prefix = log_prefix(Some(&self.name), None, Some(&player.name), Some(hostname));

        let candidate: SharedHost = match orch.hosts.get(hostname) {
            Some(shared) => {
                let host = shared.lock();
                if host.image().is_some() && host.image() != player.image.as_deref() {
                    return Err(format!(
                        "{}: Host object already exists with conflicting image",
                        hostname
                    ));
                }
                if host.tuning {
                    return Err(format!(
                        "host '{}' is tuning or pending tuning; try again soon",
                        hostname
                    ));
                }
                drop(host);
                shared
            }
            None => {
                debug!(
                    "{}| temporarily creating Host object with image {:?}",
                    prefix, player.image
                );
                match Host::placeholder(hostname, player.image.as_deref(), config) {
                    Ok(host) => Arc::new(Mutex::new(host)),
                    Err(e) => {
                        debug!(error = %e, "{}| placeholder rejected", prefix);
                        return Err(format!("{}: error creating Host object", hostname));
                    }
                }
            }
        };

        let (method, target, recent) = {
            let host = candidate.lock();
            (
                host.control_method_or_default(config).to_string(),
                host.control_target().to_string(),
                host.confirmed_within(now, config.host_confirmed_on_valid_secs),
            )
        };
        match config.requires_external_broker(&method) {
            None => {
                return Err(format!(
                    "{}: control_method '{}' is not properly registered",
                    hostname, method
                ))
            }
            Some(true) if config.broker_host_external.is_none() => {
                return Err(format!(
                    "host ('{}') requires an externally reachable broker, but broker_host_external is not configured",
                    hostname
                ))
            }
            Some(_) => {}
        }
        let Some(control) = orch.controls.get(&method) else {
            return Err(format!(
                "{}: no host control backend registered for '{}'",
                hostname, method
            ));
        };

        // only a real existence check refreshes the confirmation
        let (confirmed, checked) = match recent {
            Some(age) => {
                debug!(
                    "{}| confirmed to be on via {} {}s ago; not checking again",
                    prefix, method, age
                );
                (true, false)
            }
            None => match control.host_exists(&target) {
                Ok(exists) => (exists, exists),
                Err(e) => {
                    warn!(error = %e, "{}| existence check via {} failed", prefix, method);
                    (false, false)
                }
            },
        };

        if confirmed {
            let registered = orch.hosts.get_or_insert(candidate.lock().clone());
            let mut host = registered.lock();
            if checked {
                host.last_confirmed_on = Some(now);
            }
            host.pending_create = false;
            debug!("{}| appears to exist via {}", prefix, method);
            return Ok(());
        }
        if !self.create_hosts {
            return Err(format!(
                "host '{}' with control_name '{}' not found via (possibly default) control method '{}'",
                hostname, target, method
            ));
        }
        let registered = orch.hosts.get_or_insert(candidate.lock().clone());
        registered.lock().pending_create = true;
        debug!("{}| marked for creation", prefix);
        Ok(())
    }

    /// Prepares a run: adds the tuning measure and the all-hosts player,
    /// clears the previous run, and marks the score STARTED.
    pub fn start(&mut self, orch: &Orchestra) {
        let prefix = self.prefix();
        let allhosts = orch.config.conductor_allhosts_player_name.clone();

        if self.measure(TUNE_ORCHESTRA).is_none() {
            self.measures
                .insert(0, Measure::local(TUNE_ORCHESTRA, &allhosts, TUNE_HOST_TASK));
        }
        for measure in self.measures.iter_mut() {
            if measure.local_measure || measure.name == TUNE_ORCHESTRA {
                continue;
            }
            if !measure.depends_on.iter().any(|d| d == TUNE_ORCHESTRA) {
                debug!("{}| {}| adding '{}' dependency", prefix, measure.name, TUNE_ORCHESTRA);
                measure.depends_on.insert(0, TUNE_ORCHESTRA.to_string());
            }
        }

        // covers hosts not created yet; they were registered by validation
        let mut all_hosts = BTreeSet::new();
        for player in self.players.values() {
            if player.name == allhosts {
                continue;
            }
            for hostname in &player.hostnames {
                if orch.hosts.contains(hostname) {
                    all_hosts.insert(hostname.clone());
                } else {
                    warn!("{}| host '{}' not found in orchestra", prefix, hostname);
                }
            }
        }
        let conductor = self
            .players
            .entry(allhosts.clone())
            .or_insert_with(|| Player::named(&allhosts));
        conductor.hostnames = all_hosts.into_iter().collect();
        conductor.scale = conductor.hostnames.len();

        for measure in self.measures.iter_mut() {
            measure.reset();
        }
        self.state = TaskState::Started;
        self.status.clear();
        self.finished = false;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        self.unqueued = self.measures.iter().map(|m| m.name.clone()).collect();
        info!("{}| playing {} measures", prefix, self.measures.len());
    }

    /// Refreshes every unfinished measure, then folds them into the score's
    /// own state and status.
    pub fn evaluate_state(&mut self, broker: &dyn TaskBroker) {
        for measure in self.measures.iter_mut().filter(|m| !m.finished) {
            measure.evaluate_state(broker, &self.task_map, &mut self.stored_data, &self.name);
        }

        let mut not_success = 0;
        let mut unfinished = 0;
        for measure in &self.measures {
            if !measure.finished {
                unfinished += 1;
            }
            if measure.state != TaskState::Success {
                not_success += 1;
            }
            self.state = self.state.escalate(measure.state);
            if !measure.status.is_empty() {
                let by_player = measure
                    .status
                    .iter()
                    .map(|(player, by_task)| {
                        let by_host = by_task
                            .iter()
                            .map(|(key, msg)| {
                                let host = self
                                    .task_map
                                    .get(key)
                                    .map(|entry| entry.host_name.clone())
                                    .unwrap_or_else(|| key.clone());
                                (host, msg.clone())
                            })
                            .collect();
                        (player.clone(), by_host)
                    })
                    .collect();
                self.status.insert(measure.name.clone(), by_player);
            }
        }

        if not_success == 0 {
            self.state = TaskState::Success;
        }
        if unfinished == 0 && !self.finished {
            self.finished = true;
            self.finished_at = Some(Utc::now());
            info!("{}| finished with state {}", self.prefix(), self.state);
        }
    }

    /// Queues at most one measure whose dependencies are all finished.
    /// Measures behind a failed dependency fail without being dispatched.
    pub fn smart_queue(&mut self, orch: &Orchestra) -> Option<String> {
        let prefix = self.prefix();
        let mut to_queue = None;
        let mut dependency_failed = Vec::new();

        for name in self.unqueued.clone() {
            let Some(idx) = self.measure_index(&name) else {
                continue;
            };
            let proof = self.measures[idx].dependency_proof;
            let mut waiting = false;
            let mut failed_dep = None;
            for dep in &self.measures[idx].depends_on {
                let Some(dep_measure) = self.measure(dep) else {
                    continue;
                };
                if !dep_measure.finished {
                    waiting = true;
                }
                if dep_measure.state == TaskState::Failure && !proof {
                    failed_dep = Some(dep.clone());
                }
            }

            let measure = &mut self.measures[idx];
            if let Some(dep) = failed_dep {
                measure.record_failure("all", "all", format!("dependency failed ({})", dep));
                measure.finished = true;
                dependency_failed.push(name);
            } else if waiting {
                measure.state = TaskState::Deferred;
            } else {
                to_queue = Some(idx);
                break;
            }
        }

        let queued = to_queue.map(|idx| {
            self.queue_measure(idx, orch);
            let name = self.measures[idx].name.clone();
            self.unqueued.retain(|n| *n != name);
            name
        });
        for name in dependency_failed {
            warn!(
                "{}| measure '{}' failed because one or more of its dependencies failed",
                prefix, name
            );
            self.unqueued.retain(|n| *n != name);
        }
        queued
    }

    /// Dispatches a measure to each of its players. A replay starts from a
    /// clean measure.
    pub fn queue_measure(&mut self, idx: usize, orch: &Orchestra) {
        let measure = &mut self.measures[idx];
        measure.reset();
        measure.state = TaskState::Queued;
        debug!("{}| queueing measure {}", self.prefix(), self.measures[idx].name);
        for player_name in self.measures[idx].player_names.clone() {
            self.play_the_player(idx, &player_name, orch);
        }
    }

    fn play_the_player(&mut self, idx: usize, player_name: &str, orch: &Orchestra) {
        let measure_name = self.measures[idx].name.clone();
        let prefix = log_prefix(Some(&self.name), Some(&measure_name), Some(player_name), None);
        let mut rng = rand::thread_rng();

        let resolved = {
            let measure = &self.measures[idx];
            let ctx = ArgContext {
                score_name: &self.name,
                lazy_fetch_stored: measure.lazy_fetch_stored,
                stored: &self.stored_data,
                log_prefix: &prefix,
            };
            let delay = match &measure.start_delay {
                Some(delay) => delay.resolve(&mut rng),
                None => Ok(0),
            };
            delay.and_then(|delay| transform_args(&ctx, &measure.args, &mut rng).map(|args| (delay, args)))
        };
        let (delay, args) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                let msg = "Failed to queue measure -- bad special argument(s)";
                error!(error = %e, "{}| {}", prefix, msg);
                let measure = &mut self.measures[idx];
                measure.record_failure("all", "all", format!("{}; see logs for details", msg));
                measure.dispatch_failed.insert(player_name.to_string());
                return;
            }
        };
        info!(
            "{}| queueing measure {} with a delay of {} seconds",
            prefix, measure_name, delay
        );
        let shown = serde_json::to_string(&args).unwrap_or_default();
        debug!("{}| (transformed) args: {}", prefix, shown);

        let Some(player) = self.players.get(player_name) else {
            let measure = &mut self.measures[idx];
            measure.record_failure(player_name, "all", format!("unrecognized player: '{}'", player_name));
            measure.dispatch_failed.insert(player_name.to_string());
            return;
        };
        let local = self.measures[idx].local_measure;
        let task_name = self.measures[idx].task_name.clone();
        let mut dispatch = Dispatch {
            score_name: &self.name,
            hosts: &orch.hosts,
            broker: orch.broker.as_ref(),
            config: orch.config.as_ref(),
            task_map: &mut self.task_map,
        };
        let outcome = player.enqueue(&mut dispatch, &measure_name, local, &task_name, delay, &args);

        let measure = &mut self.measures[idx];
        match outcome {
            Ok(handle) => {
                measure.groups.insert(player_name.to_string(), handle);
            }
            Err(e) => {
                let msg = format!("failed to play measure {}: {}", measure_name, e);
                warn!("{}| {}", prefix, msg);
                measure.record_failure(player_name, "all", msg);
                measure.dispatch_failed.insert(player_name.to_string());
            }
        }
    }

    /// One scheduling pass. Returns true once the score has finished.
    pub fn tick(&mut self, orch: &Orchestra) -> bool {
        self.evaluate_state(orch.broker.as_ref());
        if self.finished {
            return true;
        }
        self.smart_queue(orch);
        false
    }

    /// Ends the run as FAILURE.
    pub fn fail(&mut self, msg: String) {
        self.state = TaskState::Failure;
        self.status
            .entry("all".to_string())
            .or_default()
            .entry("all".to_string())
            .or_default()
            .insert("all".to_string(), msg);
        self.finished = true;
        self.finished_at = Some(Utc::now());
    }

    /// Ends the run after an internal fault. The detail goes to the log only.
    pub fn abort(&mut self, detail: &dyn std::fmt::Display) {
        error!(error = %detail, "{}| scheduling loop aborted", self.name);
        self.fail(SCHEDULING_FAULT.to_string());
    }

    pub fn get_status(&self, broker: &dyn TaskBroker, short: bool) -> Value {
        let mut out = Map::new();
        out.insert("state".to_string(), json!(self.state));
        out.insert("finished".to_string(), json!(self.finished));
        if !self.status.is_empty() || !short {
            out.insert("status".to_string(), json!(self.status));
        }
        if !short {
            out.insert("started_at".to_string(), json!(self.started_at.map(|t| t.to_rfc3339())));
            out.insert("finished_at".to_string(), json!(self.finished_at.map(|t| t.to_rfc3339())));
            if let Some(at) = self.last_successful_roll_call {
                out.insert("last_successful_roll_call".to_string(), json!(at.to_rfc3339()));
            }
        }
        let measures: Map<String, Value> = self
            .measures
            .iter()
            .map(|m| (m.name.clone(), m.get_status(broker, short)))
            .collect();
        out.insert("measures".to_string(), Value::Object(measures));
        if !short {
            out.insert("stored_data".to_string(), self.stored_data.to_value());
        }
        Value::Object(out)
    }

    /// Hosts each measure runs on, by player, with per-measure and overall
    /// totals.
    pub fn host_totals(&self) -> Value {
        let mut out = Map::new();
        let mut total = 0;
        for measure in &self.measures {
            let mut by_player = Map::new();
            let mut subtotal = 0;
            for player_name in &measure.player_names {
                let scale = self.players.get(player_name).map(|p| p.scale).unwrap_or(0);
                by_player.insert(player_name.clone(), json!(scale));
                subtotal += scale;
            }
            by_player.insert("total".to_string(), json!(subtotal));
            total += subtotal;
            out.insert(measure.name.clone(), Value::Object(by_player));
        }
        out.insert("total".to_string(), json!(total));
        Value::Object(out)
    }

    /// Serialized score. `exclude_local` drops the conductor's player, the
    /// tuning measure and the implicit dependency on it; `yaml_fields_only`
    /// keeps only what a score file would contain.
    pub fn dump(&self, exclude_local: bool, yaml_fields_only: bool, allhosts_player: &str) -> Value {
        let mut data = serde_json::to_value(self).unwrap_or(Value::Null);
        let Value::Object(fields) = &mut data else {
            return data;
        };

        if exclude_local {
            if let Some(Value::Object(players)) = fields.get_mut("players") {
                players.remove(allhosts_player);
            }
            if let Some(Value::Array(measures)) = fields.get_mut("measures") {
                measures.retain(|m| m.get("name").and_then(Value::as_str) != Some(TUNE_ORCHESTRA));
                for measure in measures.iter_mut() {
                    if let Some(Value::Array(deps)) = measure.get_mut("depends_on") {
                        deps.retain(|d| d.as_str() != Some(TUNE_ORCHESTRA));
                    }
                }
            }
        }

        if yaml_fields_only {
            for key in SCORE_RUNTIME_FIELDS {
                fields.remove(key);
            }
            if let Some(Value::Array(measures)) = fields.get_mut("measures") {
                for measure in measures.iter_mut().filter_map(Value::as_object_mut) {
                    for key in RUNTIME_FIELDS {
                        measure.remove(key);
                    }
                }
            }
        }
        data
    }
}

/// Plays a started score to completion, one tick per poll interval. Ticks
/// run on the blocking pool since host checks may shell out. A tick that
/// panics ends the run as FAILURE.
pub async fn run_loop(score: SharedScore, orch: Orchestra) {
    let interval = orch.config.poll_interval();
    loop {
        let tick_score = score.clone();
        let tick_orch = orch.clone();
        let ticked = tokio::task::spawn_blocking(move || tick_score.lock().tick(&tick_orch)).await;
        match ticked {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => {
                score.lock().abort(&e);
                break;
            }
        }
        tokio::time::sleep(interval).await;
    }
}
