use anyhow::anyhow;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::broker::LocalBroker;
use crate::builtins::builtin_tasks;
use crate::bundle::CodeVersion;
use crate::config::JohannConfig;
use crate::error::{JohannError, JohannResponse, JohannResult};
use crate::host::HostRegistry;
use crate::host_control::HostControlRegistry;
use crate::loader::{load_score_file, load_score_str, LoadContext};
use crate::orchestra::Orchestra;
use crate::player::Player;
use crate::score::{run_loop, Score, SharedScore};
use crate::special_args::parse_deferred_stored;
use crate::task::{TaskHandler, TaskRegistry};

/// Changes posted along with a roll call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RollCallUpdate {
    #[serde(default)]
    pub create_hosts: Option<bool>,
    #[serde(default)]
    pub discard_hosts: Option<bool>,
    #[serde(default)]
    pub players: Option<Value>,
}

/// The control surface: score registry plus every externally triggered
/// action. Each action answers with a `JohannResponse`.
pub struct Conductor {
    orch: Orchestra,
    scores: RwLock<BTreeMap<String, SharedScore>>,
    tasks: RwLock<TaskRegistry>,
    code: Arc<CodeVersion>,
    local_broker: Option<LocalBroker>,
}

impl Conductor {
    pub fn new(orch: Orchestra, tasks: TaskRegistry, code: Arc<CodeVersion>) -> Self {
        Conductor {
            orch,
            scores: RwLock::new(BTreeMap::new()),
            tasks: RwLock::new(tasks),
            code,
            local_broker: None,
        }
    }

    /// Conductor whose tasks all run in this process. Must be called inside
    /// a tokio runtime.
    pub fn local(config: JohannConfig, controls: HostControlRegistry) -> anyhow::Result<Conductor> {
        let config = Arc::new(config);
        let code = Arc::new(CodeVersion::from_config(&config)?);
        let hosts = HostRegistry::new();
        let tasks = builtin_tasks(hosts.clone(), controls.clone(), config.clone(), code.clone());
        let broker = LocalBroker::new(tasks.clone())?;
        let orch = Orchestra::new(config, hosts, controls, Arc::new(broker.clone()));
        let mut conductor = Conductor::new(orch, tasks, code);
        conductor.local_broker = Some(broker);
        Ok(conductor)
    }

    pub fn orchestra(&self) -> &Orchestra {
        &self.orch
    }

    pub fn local_broker(&self) -> Option<&LocalBroker> {
        self.local_broker.as_ref()
    }

    /// Makes `name` available to score files and, for a local conductor,
    /// to the in-process broker.
    pub fn register_task(&self, name: &str, handler: Arc<dyn TaskHandler>) {
        self.tasks.write().register(name, handler.clone());
        if let Some(broker) = &self.local_broker {
            broker.register_task(name, handler);
        }
    }

    pub fn score_handle(&self, name: &str) -> Option<SharedScore> {
        self.scores.read().get(name).cloned()
    }

    fn shared_score(&self, name: &str) -> JohannResult<SharedScore> {
        self.score_handle(name)
            .ok_or_else(|| JohannError::unrecognized_score(name))
    }

    fn respond(&self, result: JohannResult<Value>) -> JohannResponse {
        JohannResponse::from_result(result, self.orch.config.debug)
    }

    fn respond_err(&self, err: &JohannError) -> JohannResponse {
        JohannResponse::from_error(err, self.orch.config.debug)
    }

    fn with_score<F>(&self, name: &str, f: F) -> JohannResponse
    where
        F: FnOnce(&Score) -> JohannResult<Value>,
    {
        let result = self.shared_score(name).and_then(|shared| f(&shared.lock()));
        self.respond(result)
    }

    /// Registers a score from YAML. `force` replaces a registered score of
    /// the same name unless it is playing.
    pub fn read_score_str(&self, raw_yaml: &str, file_name: &str, force: bool) -> JohannResponse {
        self.register_loaded(force, |ctx| load_score_str(raw_yaml, file_name, ctx))
    }

    pub fn read_score_file(&self, path: &Path, force: bool) -> JohannResponse {
        self.register_loaded(force, |ctx| load_score_file(path, ctx))
    }

    fn register_loaded<F>(&self, force: bool, load: F) -> JohannResponse
    where
        F: FnOnce(&LoadContext<'_>) -> JohannResult<(Score, Value)>,
    {
        let tasks = self.tasks.read();
        let mut scores = self.scores.write();
        let taken: BTreeSet<String> = if force {
            BTreeSet::new()
        } else {
            scores.keys().cloned().collect()
        };
        let ctx = LoadContext {
            tasks: &tasks,
            allhosts_player_name: &self.orch.config.conductor_allhosts_player_name,
            taken: &taken,
        };
        let (score, raw) = match load(&ctx) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "failed to read score");
                return self.respond_err(&e);
            }
        };
        if let Some(existing) = scores.get(&score.name) {
            if existing.lock().is_playing() {
                return self.respond_err(&JohannError::conflict("score already playing"));
            }
            warn!("force resetting score '{}'", score.name);
        }
        debug!("registered score '{}'", score.name);
        scores.insert(score.name.clone(), Arc::new(Mutex::new(score)));
        JohannResponse::ok(raw)
    }

    /// Score names and descriptions grouped by category.
    pub fn scores(&self) -> JohannResponse {
        let mut by_category: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for (name, shared) in self.scores.read().iter() {
            let score = shared.lock();
            by_category
                .entry(score.category.clone())
                .or_default()
                .push(json!({"name": name, "description": score.description}));
        }
        JohannResponse::ok(json!(by_category))
    }

    pub fn score(&self, name: &str) -> JohannResponse {
        let allhosts = self.orch.config.conductor_allhosts_player_name.clone();
        self.with_score(name, |score| Ok(score.dump(true, true, &allhosts)))
    }

    pub fn score_raw(&self, name: &str) -> JohannResponse {
        let allhosts = self.orch.config.conductor_allhosts_player_name.clone();
        self.with_score(name, |score| Ok(score.dump(false, false, &allhosts)))
    }

    pub fn score_status(&self, name: &str, short: bool) -> JohannResponse {
        let broker = self.orch.broker.clone();
        self.with_score(name, |score| Ok(score.get_status(broker.as_ref(), short)))
    }

    /// Progress in host units: per measure and overall, against the number
    /// of hosts each measure runs on.
    pub fn score_progress(&self, name: &str) -> JohannResponse {
        let broker = self.orch.broker.clone();
        self.with_score(name, |score| {
            let status = score.get_status(broker.as_ref(), false);
            let totals = score.host_totals();
            let mut measures = Map::new();
            let mut current = 0.0;
            let mut fails = 0;
            if let Some(by_measure) = status["measures"].as_object() {
                for (m_name, m_status) in by_measure {
                    let mut m_current = 0.0;
                    let mut m_fails = 0;
                    if let Some(groups) = m_status["task_status"].as_object() {
                        for group in groups.values() {
                            m_fails += group["failed_count"].as_u64().unwrap_or(0);
                            m_current += group["meta"]["current"].as_f64().unwrap_or(0.0);
                        }
                    }
                    current += m_current;
                    fails += m_fails;
                    measures.insert(
                        m_name.clone(),
                        json!({
                            "total": totals[m_name.as_str()]["total"],
                            "current": m_current,
                            "failed_count": m_fails,
                            "state": m_status["state"],
                        }),
                    );
                }
            }
            Ok(json!({
                "current": current,
                "total": totals["total"],
                "failed_count": fails,
                "state": status["state"],
                "status": status["state"],
                "measures": measures,
                "raw": status,
            }))
        })
    }

    pub fn measures(&self, name: &str) -> JohannResponse {
        self.with_score(name, |score| {
            Ok(json!(score.measures.iter().map(|m| m.name.as_str()).collect::<Vec<_>>()))
        })
    }

    pub fn measure(&self, score_name: &str, measure_name: &str) -> JohannResponse {
        self.with_score(score_name, |score| {
            score
                .measure(measure_name)
                .map(|m| m.dump())
                .ok_or_else(|| JohannError::not_found(format!("unrecognized measure '{}'", measure_name)))
        })
    }

    pub fn measure_status(&self, score_name: &str, measure_name: &str) -> JohannResponse {
        let broker = self.orch.broker.clone();
        self.with_score(score_name, |score| {
            score
                .measure(measure_name)
                .map(|m| m.get_status(broker.as_ref(), false))
                .ok_or_else(|| JohannError::not_found(format!("unrecognized measure '{}'", measure_name)))
        })
    }

    pub fn hosts(&self) -> JohannResponse {
        let mut out = Map::new();
        for host in self.orch.hosts.snapshot() {
            out.insert(host.name.clone(), json!({"name": host.name, "image": host.image()}));
        }
        JohannResponse::ok(Value::Object(out))
    }

    pub fn host(&self, name: &str) -> JohannResponse {
        match self.orch.hosts.get(name) {
            Some(host) => JohannResponse::ok(host.lock().dump()),
            None => self.respond_err(&JohannError::not_found(format!("unrecognized host '{}'", name))),
        }
    }

    /// Adds or updates hosts from `{"hosts": {name: descriptor}}`. Nothing
    /// is applied when any descriptor is invalid.
    pub fn add_hosts(&self, body: &Value) -> JohannResponse {
        let Some(descriptors) = body.get("hosts").and_then(Value::as_object) else {
            warn!("add_hosts: invalid format for key 'hosts'");
            return JohannResponse::failure(400, vec!["invalid format for key 'hosts'".to_string()]);
        };
        let (ok, errors, applied) = self.orch.hosts.update_hosts(descriptors, false, &self.orch.config);
        if ok {
            JohannResponse::ok(json!(applied))
        } else {
            JohannResponse::failure(400, errors)
        }
    }

    /// Seeds hosts from a JSON or YAML file shaped like an `add_hosts` body.
    /// Valid entries are applied even when others are rejected.
    pub fn read_hosts_file(&self, path: &Path) -> JohannResponse {
        if !path.is_file() {
            let msg = format!("Provided hosts file does not exist: '{}'", path.display());
            warn!("{}", msg);
            return JohannResponse::failure(400, vec![msg]);
        }
        let parsed = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read hosts file '{}': {}", path.display(), e))
            .and_then(|raw| {
                let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw)
                    .map_err(|e| anyhow!("unable to parse hosts file '{}': {}", path.display(), e))?;
                Ok(serde_json::to_value(yaml_value)?)
            });
        let body = match parsed {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "hosts file rejected");
                return JohannResponse::failure(400, vec![e.to_string()]);
            }
        };
        let Some(descriptors) = body.get("hosts").and_then(Value::as_object) else {
            let msg = format!("invalid format for hosts file '{}'", path.display());
            warn!("{}", msg);
            return JohannResponse::failure(400, vec![msg]);
        };
        let (ok, errors, applied) = self.orch.hosts.update_hosts(descriptors, true, &self.orch.config);
        if ok {
            debug!("hosts added/updated from '{}': {:?}", path.display(), applied);
            JohannResponse::ok(json!(applied))
        } else {
            let mut response = JohannResponse::failure(400, errors);
            response.data = Some(json!(applied));
            response
        }
    }

    fn apply_roll_call_update(&self, score: &mut Score, update: &RollCallUpdate) -> JohannResult<()> {
        let mut posted = Vec::new();
        match &update.players {
            Some(Value::Object(players)) => {
                for (p_name, p_data) in players {
                    let player: Player = serde_json::from_value(p_data.clone()).map_err(|e| {
                        JohannError::validation(format!("invalid player data provided ({}): {}", p_name, e))
                    })?;
                    if !score.players.contains_key(&player.name)
                        || player.name == self.orch.config.conductor_allhosts_player_name
                    {
                        return Err(JohannError::validation(format!("unrecognized player: '{}'", player.name)));
                    }
                    posted.push(player);
                }
            }
            _ => warn!("roll_call: missing or invalid format for key 'players'"),
        }

        if let Some(create_hosts) = update.create_hosts {
            score.create_hosts = create_hosts;
        }
        if let Some(discard_hosts) = update.discard_hosts {
            score.discard_hosts = discard_hosts;
        }
        let score_name = score.name.clone();
        for player in posted {
            if let Some(existing) = score.players.get_mut(&player.name) {
                if existing.copy_from(&player, &score_name) {
                    debug!("roll_call: updated player '{}'", player.name);
                }
            }
        }
        Ok(())
    }

    /// Applies posted changes, then checks that every player's hosts can be
    /// reached.
    pub fn roll_call(&self, name: &str, update: Option<&RollCallUpdate>) -> JohannResponse {
        let shared = match self.shared_score(name) {
            Ok(shared) => shared,
            Err(e) => return self.respond_err(&e),
        };
        let mut score = shared.lock();
        if score.is_playing() {
            return self.respond_err(&JohannError::conflict("score already playing"));
        }
        if let Some(update) = update {
            if let Err(e) = self.apply_roll_call_update(&mut score, update) {
                warn!("roll_call: {}", e);
                return self.respond_err(&e);
            }
        }
        let (ok, errors) = score.validate_create_host_mappings(&self.orch);
        if !ok {
            warn!("{}: errors validating host mappings: {:?}", name, errors);
            return JohannResponse::failure(400, errors);
        }
        score.last_successful_roll_call = Some(Utc::now());
        JohannResponse::ok_with_messages(
            vec!["roll_call successful; you are now free to cue the music".to_string()],
            None,
        )
    }

    /// Validates host mappings, starts the score, and spawns its scheduling
    /// loop on the current tokio runtime.
    pub fn cue_the_music(&self, name: &str) -> JohannResponse {
        let shared = match self.shared_score(name) {
            Ok(shared) => shared,
            Err(e) => return self.respond_err(&e),
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                return self.respond_err(&JohannError::Internal(anyhow!(
                    "cue_the_music must run inside a tokio runtime: {}",
                    e
                )))
            }
        };
        {
            let mut score = shared.lock();
            if score.is_playing() {
                return self.respond_err(&JohannError::conflict("score already playing"));
            }
            let (ok, errors) = score.validate_create_host_mappings(&self.orch);
            if !ok {
                warn!("{}: tuning failed; errors validating host mappings: {:?}", name, errors);
                return JohannResponse::failure(400, errors);
            }
            score.start(&self.orch);
        }
        runtime.spawn(run_loop(shared, self.orch.clone()));
        info!("{}: score is playing", name);
        JohannResponse::ok_with_messages(vec!["score is playing".to_string()], None)
    }

    /// Roll call and cue the music in one step.
    pub fn affrettando(&self, name: &str, update: Option<&RollCallUpdate>) -> JohannResponse {
        let response = self.roll_call(name, update);
        if !response.success {
            return response;
        }
        self.cue_the_music(name)
    }

    /// Queues one measure out of band.
    pub fn play_measure(&self, score_name: &str, measure_name: &str, force: bool) -> JohannResponse {
        let shared = match self.shared_score(score_name) {
            Ok(shared) => shared,
            Err(e) => return self.respond_err(&e),
        };
        let mut score = shared.lock();
        let Some(idx) = score.measures.iter().position(|m| m.name == measure_name) else {
            return self.respond_err(&JohannError::not_found(format!("unrecognized measure '{}'", measure_name)));
        };
        let msg = if score.measures[idx].started() {
            if !force {
                return self.respond_err(&JohannError::validation(
                    "measure already played/playing; to run anyway, include query param 'force=true'",
                ));
            }
            let msg = format!("Forcing re-play of measure '{}'", measure_name);
            warn!("{}", msg);
            msg
        } else {
            let msg = format!("Manually playing measure '{}'", measure_name);
            info!("{}", msg);
            msg
        };
        score.queue_measure(idx, &self.orch);
        JohannResponse::ok_with_messages(vec![msg], None)
    }

    /// Reads stored data at any depth. A `none` token (any case) at a level
    /// stands for an absent key.
    pub fn stored_data(
        &self,
        score_name: &str,
        key: Option<&str>,
        subkey: Option<&str>,
        subsubkey: Option<&str>,
        subsubsubkey: Option<&str>,
    ) -> JohannResponse {
        let shared = match self.shared_score(score_name) {
            Ok(shared) => shared,
            Err(e) => return self.respond_err(&e),
        };
        fn level(token: Option<&str>) -> Option<&str> {
            token.filter(|t| !t.eq_ignore_ascii_case("none"))
        }
        let fetched = shared
            .lock()
            .stored_data
            .fetch(level(key), level(subkey), level(subsubkey), level(subsubsubkey));
        match fetched {
            Ok(fetched) => {
                debug!("retrieve_stored_data: {:?}", fetched.message);
                JohannResponse::ok_with_messages(fetched.message.into_iter().collect(), Some(fetched.data))
            }
            Err(e) => {
                debug!("retrieve_stored_data: {}", e);
                self.respond_err(&e)
            }
        }
    }

    /// Resolves a `johann.stored.<score>.<key>...` reference the way a remote
    /// agent does for lazily fetched arguments.
    pub fn resolve_deferred(&self, raw: &str) -> JohannResponse {
        match parse_deferred_stored(raw) {
            Ok((score_name, path)) => self.stored_data(
                &score_name,
                Some(&path.key),
                path.subkey.as_deref(),
                path.subsubkey.as_deref(),
                path.subsubsubkey.as_deref(),
            ),
            Err(e) => self.respond_err(&e),
        }
    }

    pub fn codehash(&self) -> JohannResponse {
        JohannResponse::ok(json!(self.code.codehash))
    }

    /// Polls until the score finishes. Answers with its short status.
    pub async fn wait_for(&self, name: &str, timeout: Duration) -> JohannResponse {
        let shared = match self.shared_score(name) {
            Ok(shared) => shared,
            Err(e) => return self.respond_err(&e),
        };
        let started = Instant::now();
        loop {
            {
                let score = shared.lock();
                if score.finished {
                    return JohannResponse::ok(score.get_status(self.orch.broker.as_ref(), true));
                }
            }
            if started.elapsed() >= timeout {
                return self.respond_err(&JohannError::conflict(format!(
                    "timed out after {:?} waiting for score '{}'",
                    timeout, name
                )));
            }
            tokio::time::sleep(self.orch.config.poll_interval()).await;
        }
    }
}
