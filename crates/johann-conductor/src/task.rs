use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::state::{aggregate_states, TaskState};

pub const TUNE_HOST_TASK: &str = "johann.conductor_tasks.tune_host";
pub const REMOTE_CODEHASH_TASK: &str = "johann.tasks_util.remote_codehash";
pub const SELECT_RANDOM_TASK: &str = "johann.tasks_util.select_random";

/// Dispatch descriptor. The id is assigned before submission so callers can
/// record it ahead of time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSignature {
    pub task_id: String,
    pub task_name: String,
    pub queue: String,
    pub description: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub countdown_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    pub id: String,
    pub name: String,
    pub state: TaskState,
    /// PROGRESS payload: `current`, `total`, optional `interim_result`.
    pub meta: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retries: u32,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskStatus {
    pub fn pending(id: &str) -> Self {
        TaskStatus {
            id: id.to_string(),
            name: String::new(),
            state: TaskState::Pending,
            meta: None,
            result: None,
            error: None,
            retries: 0,
            finished_at: None,
        }
    }

    pub fn to_json(&self, short: bool) -> Value {
        let mut out = Map::new();
        out.insert("name".to_string(), json!(self.name));
        out.insert("state".to_string(), json!(self.state));
        let mut meta = json!({});
        match self.state {
            TaskState::Failure => {
                out.insert("status".to_string(), json!(self.error.clone().unwrap_or_default()));
            }
            TaskState::Success => {
                out.insert("result".to_string(), self.result.clone().unwrap_or(Value::Null));
            }
            TaskState::Progress => {
                meta = self.meta.clone().unwrap_or_else(|| json!({}));
            }
            _ => {}
        }
        out.insert("meta".to_string(), meta);
        if !short {
            out.insert("retries".to_string(), json!(self.retries));
            out.insert("id".to_string(), json!(self.id));
            if let Some(at) = self.finished_at {
                out.insert("finished_at".to_string(), json!(at.to_rfc3339()));
            }
        }
        Value::Object(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupHandle {
    pub id: String,
    pub task_ids: Vec<String>,
}

/// Task-execution substrate. Every call returns promptly; completion is
/// observed by polling `task_status`.
pub trait TaskBroker: Send + Sync {
    fn submit(&self, signature: TaskSignature) -> Result<()>;

    /// Unknown ids report PENDING.
    fn task_status(&self, task_id: &str) -> TaskStatus;

    fn submit_group(&self, signatures: Vec<TaskSignature>) -> Result<GroupHandle> {
        let handle = GroupHandle {
            id: Uuid::new_v4().to_string(),
            task_ids: signatures.iter().map(|s| s.task_id.clone()).collect(),
        };
        for signature in signatures {
            self.submit(signature)?;
        }
        Ok(handle)
    }
}

/// Receives state updates from running handlers.
pub trait StatusSink: Send + Sync {
    fn update(&self, task_id: &str, state: TaskState, meta: Option<Value>);
}

#[derive(Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub description: String,
    pub queue: String,
    pub broker: Arc<dyn TaskBroker>,
    sink: Arc<dyn StatusSink>,
}

impl TaskContext {
    pub fn new(signature: &TaskSignature, broker: Arc<dyn TaskBroker>, sink: Arc<dyn StatusSink>) -> Self {
        TaskContext {
            task_id: signature.task_id.clone(),
            description: signature.description.clone(),
            queue: signature.queue.clone(),
            broker,
            sink,
        }
    }

    pub fn update_state(&self, state: TaskState, meta: Option<Value>) {
        self.sink.update(&self.task_id, state, meta);
    }

    pub fn report_progress(&self, current: u64, total: u64, interim_result: Option<Value>) {
        let mut meta = json!({"current": current, "total": total});
        if let Some(interim) = interim_result {
            meta["interim_result"] = interim;
        }
        self.update_state(TaskState::Progress, Some(meta));
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: TaskContext, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value>;
}

/// Task name to handler. Names are resolved at load and dispatch time.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: BTreeMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        TaskRegistry::default()
    }

    pub fn register(&mut self, name: &str, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStatus {
    pub id: String,
    pub state: TaskState,
    pub finished: bool,
    /// Successful children.
    pub completed_count: usize,
    pub failed_count: usize,
    /// Failure messages by task id.
    pub status: BTreeMap<String, String>,
    /// Work done in task units: 1 per success plus `current/total` per task
    /// in PROGRESS.
    pub progress: f64,
    pub tasks: Vec<TaskStatus>,
}

impl GroupStatus {
    pub fn to_json(&self, short: bool) -> Value {
        let mut out = json!({
            "id": self.id,
            "state": self.state,
            "finished": self.finished,
            "completed_count": self.completed_count,
            "failed_count": self.failed_count,
            "status": self.status,
        });
        if !short {
            let mut tasks = Map::new();
            for task in &self.tasks {
                tasks.insert(task.id.clone(), task.to_json(false));
            }
            out["meta"] = json!({"current": self.progress});
            out["tasks"] = Value::Object(tasks);
        }
        out
    }
}

pub fn group_status(broker: &dyn TaskBroker, handle: &GroupHandle) -> GroupStatus {
    let tasks: Vec<TaskStatus> = handle.task_ids.iter().map(|id| broker.task_status(id)).collect();
    let mut failed_count = 0;
    let mut completed_count = 0;
    let mut status = BTreeMap::new();
    let mut progress = 0.0;

    for task in &tasks {
        match task.state {
            TaskState::Failure => {
                failed_count += 1;
                status.insert(task.id.clone(), task.error.clone().unwrap_or_default());
            }
            TaskState::Success => {
                completed_count += 1;
                progress += 1.0;
            }
            TaskState::Progress => match progress_fraction(task.meta.as_ref()) {
                Some(fraction) if fraction > 1.0 => {
                    warn!("{}: got task status current > total; ignoring", task.name);
                }
                Some(fraction) => progress += fraction,
                None => {
                    warn!(
                        "{}: task has status of 'progress' but missing or improper 'meta'",
                        task.name
                    );
                }
            },
            _ => {}
        }
    }

    GroupStatus {
        id: handle.id.clone(),
        state: aggregate_states(tasks.iter().map(|t| t.state)),
        finished: tasks.iter().all(|t| t.state.is_terminal()),
        completed_count,
        failed_count,
        status,
        progress,
        tasks,
    }
}

fn progress_fraction(meta: Option<&Value>) -> Option<f64> {
    let meta = meta?;
    let current = meta.get("current")?.as_f64()?;
    let total = meta.get("total")?.as_f64()?;
    if total <= 0.0 {
        return None;
    }
    Some(current / total)
}

/// Submits one task and waits for a terminal state. `Ok(None)` on timeout.
pub async fn call(broker: &dyn TaskBroker, signature: TaskSignature, timeout: Duration) -> Result<Option<TaskStatus>> {
    let task_id = signature.task_id.clone();
    broker.submit(signature)?;
    let poll = Duration::from_millis(50).min(timeout.max(Duration::from_millis(1)));
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = broker.task_status(&task_id);
        if status.state.is_terminal() {
            return Ok(Some(status));
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FixedBroker {
        statuses: Mutex<BTreeMap<String, TaskStatus>>,
    }

    impl FixedBroker {
        fn set(&self, id: &str, state: TaskState, meta: Option<Value>, error: Option<&str>) {
            let mut status = TaskStatus::pending(id);
            status.name = "t".to_string();
            status.state = state;
            status.meta = meta;
            status.error = error.map(str::to_string);
            self.statuses.lock().insert(id.to_string(), status);
        }
    }

    impl TaskBroker for FixedBroker {
        fn submit(&self, signature: TaskSignature) -> Result<()> {
            self.set(&signature.task_id, TaskState::Pending, None, None);
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

    fn handle(ids: &[&str]) -> GroupHandle {
        GroupHandle {
            id: "g".to_string(),
            task_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn group_success_requires_every_child() {
        let broker = FixedBroker::default();
        broker.set("a", TaskState::Success, None, None);
        broker.set("b", TaskState::Success, None, None);
        let status = group_status(&broker, &handle(&["a", "b"]));
        assert_eq!(status.state, TaskState::Success);
        assert!(status.finished);
        assert_eq!(status.completed_count, 2);
        assert_eq!(status.progress, 2.0);
    }

    #[test]
    fn group_failure_records_messages() {
        let broker = FixedBroker::default();
        broker.set("a", TaskState::Success, None, None);
        broker.set("b", TaskState::Failure, None, Some("boom"));
        let status = group_status(&broker, &handle(&["a", "b"]));
        assert_eq!(status.state, TaskState::Failure);
        assert!(status.finished);
        assert_eq!(status.failed_count, 1);
        assert_eq!(status.status.get("b").map(String::as_str), Some("boom"));
    }

    #[test]
    fn group_progress_sums_fractions() {
        let broker = FixedBroker::default();
        broker.set("a", TaskState::Progress, Some(json!({"current": 1, "total": 4})), None);
        broker.set("b", TaskState::Progress, Some(json!({"current": 9, "total": 4})), None);
        broker.set("c", TaskState::Progress, None, None);
        let status = group_status(&broker, &handle(&["a", "b", "c"]));
        assert_eq!(status.state, TaskState::Progress);
        assert!(!status.finished);
        assert_eq!(status.progress, 0.25);
        let body = status.to_json(false);
        assert_eq!(body["meta"]["current"], json!(0.25));
        assert!(status.to_json(true).get("tasks").is_none());
    }

    #[test]
    fn unknown_tasks_are_pending() {
        let broker = FixedBroker::default();
        let status = group_status(&broker, &handle(&["missing"]));
        assert_eq!(status.state, TaskState::Pending);
        assert!(!status.finished);
    }

    #[test]
    fn empty_group_is_finished_success() {
        let broker = FixedBroker::default();
        let status = group_status(&broker, &handle(&[]));
        assert_eq!(status.state, TaskState::Success);
        assert!(status.finished);
    }

    #[test]
    fn task_json_carries_state_specific_fields() {
        let mut status = TaskStatus::pending("x");
        status.state = TaskState::Failure;
        status.error = Some("bad".to_string());
        let body = status.to_json(true);
        assert_eq!(body["status"], json!("bad"));
        assert!(body.get("id").is_none());
        assert_eq!(status.to_json(false)["id"], json!("x"));
    }

    #[tokio::test]
    async fn call_times_out_on_pending_task() {
        let broker = FixedBroker::default();
        let signature = TaskSignature {
            task_id: "probe".to_string(),
            task_name: REMOTE_CODEHASH_TASK.to_string(),
            queue: "h1".to_string(),
            description: "probe".to_string(),
            args: Vec::new(),
            kwargs: Map::new(),
            countdown_secs: 0,
        };
        let out = call(&broker, signature, Duration::from_millis(20)).await.expect("call");
        assert!(out.is_none());
    }
}
