use anyhow::{anyhow, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::state::TaskState;
use crate::task::{StatusSink, TaskBroker, TaskContext, TaskHandler, TaskRegistry, TaskSignature, TaskStatus};

/// In-process task substrate. Every queue (the conductor's and one per host)
/// is served by tasks spawned on the current tokio runtime.
#[derive(Clone)]
pub struct LocalBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    registry: RwLock<TaskRegistry>,
    tasks: Mutex<BTreeMap<String, TaskStatus>>,
    history: Mutex<Vec<TaskSignature>>,
    offline_queues: Mutex<BTreeSet<String>>,
    parked: Mutex<Vec<TaskSignature>>,
    runtime: Handle,
}

impl LocalBroker {
    pub fn new(registry: TaskRegistry) -> Result<LocalBroker> {
        let runtime = Handle::try_current()
            .map_err(|e| anyhow!("local broker must be created inside a tokio runtime: {}", e))?;
        Ok(LocalBroker {
            inner: Arc::new(BrokerInner {
                registry: RwLock::new(registry),
                tasks: Mutex::new(BTreeMap::new()),
                history: Mutex::new(Vec::new()),
                offline_queues: Mutex::new(BTreeSet::new()),
                parked: Mutex::new(Vec::new()),
                runtime,
            }),
        })
    }

    pub fn register_task(&self, name: &str, handler: Arc<dyn TaskHandler>) {
        self.inner.registry.write().register(name, handler);
    }

    pub fn registry(&self) -> TaskRegistry {
        self.inner.registry.read().clone()
    }

    /// Every signature ever submitted, in submission order.
    pub fn submitted(&self) -> Vec<TaskSignature> {
        self.inner.history.lock().clone()
    }

    /// Tasks for an offline queue stay PENDING until it comes back online,
    /// like a host whose agent is not consuming.
    pub fn set_queue_online(&self, queue: &str, online: bool) {
        if !online {
            self.inner.offline_queues.lock().insert(queue.to_string());
            return;
        }
        self.inner.offline_queues.lock().remove(queue);
        let ready: Vec<TaskSignature> = {
            let mut parked = self.inner.parked.lock();
            let (ready, still): (Vec<_>, Vec<_>) = parked.drain(..).partition(|s| s.queue == queue);
            *parked = still;
            ready
        };
        for signature in ready {
            self.spawn(signature);
        }
    }

    fn spawn(&self, signature: TaskSignature) {
        let broker = self.clone();
        self.inner.runtime.spawn(async move {
            broker.execute(signature).await;
        });
    }

    async fn execute(&self, signature: TaskSignature) {
        if signature.countdown_secs > 0 {
            tokio::time::sleep(Duration::from_secs(signature.countdown_secs)).await;
        }
        let task_id = signature.task_id.clone();
        let handler = self.inner.registry.read().get(&signature.task_name);
        let Some(handler) = handler else {
            self.finish(&task_id, Err(anyhow!("unregistered task '{}'", signature.task_name)));
            return;
        };

        self.set_state(&task_id, TaskState::Started, None);
        let ctx = TaskContext::new(&signature, Arc::new(self.clone()), Arc::new(self.clone()));
        let TaskSignature { args, kwargs, .. } = signature;
        let run = tokio::spawn(async move { handler.run(ctx, args, kwargs).await });
        let outcome = match run.await {
            Ok(outcome) => outcome,
            Err(e) => Err(anyhow!("task aborted: {}", e)),
        };
        self.finish(&task_id, outcome);
    }

    fn set_state(&self, task_id: &str, state: TaskState, meta: Option<Value>) {
        let mut tasks = self.inner.tasks.lock();
        let Some(status) = tasks.get_mut(task_id) else {
            return;
        };
        if status.state.is_terminal() {
            return;
        }
        if state == TaskState::Retry {
            status.retries += 1;
        }
        status.state = state;
        if meta.is_some() {
            status.meta = meta;
        }
        trace!("task {} -> {}", task_id, state);
    }

    fn finish(&self, task_id: &str, outcome: Result<Value>) {
        let mut tasks = self.inner.tasks.lock();
        let Some(status) = tasks.get_mut(task_id) else {
            return;
        };
        status.finished_at = Some(Utc::now());
        match outcome {
            Ok(result) => {
                status.state = TaskState::Success;
                status.result = Some(result);
                debug!("task {} ({}) succeeded", task_id, status.name);
            }
            Err(e) => {
                status.state = TaskState::Failure;
                status.error = Some(format!("{:#}", e));
                warn!(error = %e, "task {} ({}) failed", task_id, status.name);
            }
        }
    }
}

impl TaskBroker for LocalBroker {
    fn submit(&self, signature: TaskSignature) -> Result<()> {
        let mut status = TaskStatus::pending(&signature.task_id);
        status.name = signature.task_name.clone();
        {
            let mut tasks = self.inner.tasks.lock();
            if tasks.contains_key(&signature.task_id) {
                return Err(anyhow!("duplicate task id {}", signature.task_id));
            }
            tasks.insert(signature.task_id.clone(), status);
        }
        self.inner.history.lock().push(signature.clone());

        if self.inner.offline_queues.lock().contains(&signature.queue) {
            self.inner.parked.lock().push(signature);
            return Ok(());
        }
        self.spawn(signature);
        Ok(())
    }

    fn task_status(&self, task_id: &str) -> TaskStatus {
        self.inner
            .tasks
            .lock()
            .get(task_id)
            .cloned()
            .unwrap_or_else(|| TaskStatus::pending(task_id))
    }
}

impl StatusSink for LocalBroker {
    fn update(&self, task_id: &str, state: TaskState, meta: Option<Value>) {
        self.set_state(task_id, state, meta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{call, TaskSignature};
    use async_trait::async_trait;
    use serde_json::{json, Map};

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn run(&self, ctx: TaskContext, args: Vec<Value>, _kwargs: Map<String, Value>) -> Result<Value> {
            ctx.report_progress(1, 2, None);
            Ok(json!({"queue": ctx.queue, "args": args}))
        }
    }

    struct Boom;

    #[async_trait]
    impl TaskHandler for Boom {
        async fn run(&self, _ctx: TaskContext, _args: Vec<Value>, _kwargs: Map<String, Value>) -> Result<Value> {
            Err(anyhow!("exploded"))
        }
    }

    fn signature(id: &str, task: &str, queue: &str) -> TaskSignature {
        TaskSignature {
            task_id: id.to_string(),
            task_name: task.to_string(),
            queue: queue.to_string(),
            description: format!("test.{}", id),
            args: vec![json!(1)],
            kwargs: Map::new(),
            countdown_secs: 0,
        }
    }

    fn broker() -> LocalBroker {
        let mut registry = TaskRegistry::new();
        registry.register("echo", Arc::new(Echo));
        registry.register("boom", Arc::new(Boom));
        LocalBroker::new(registry).expect("broker")
    }

    #[tokio::test]
    async fn runs_registered_handler_to_success() {
        let broker = broker();
        let status = call(&broker, signature("t1", "echo", "h1"), Duration::from_secs(2))
            .await
            .expect("call")
            .expect("finished");
        assert_eq!(status.state, TaskState::Success);
        assert_eq!(status.result, Some(json!({"queue": "h1", "args": [1]})));
        assert!(status.finished_at.is_some());
    }

    #[tokio::test]
    async fn handler_errors_and_unknown_tasks_fail() {
        let broker = broker();
        let status = call(&broker, signature("t1", "boom", "h1"), Duration::from_secs(2))
            .await
            .expect("call")
            .expect("finished");
        assert_eq!(status.state, TaskState::Failure);
        assert!(status.error.expect("error").contains("exploded"));

        let status = call(&broker, signature("t2", "nope", "h1"), Duration::from_secs(2))
            .await
            .expect("call")
            .expect("finished");
        assert!(status.error.expect("error").contains("unregistered task 'nope'"));
    }

    #[tokio::test]
    async fn offline_queue_parks_until_online() {
        let broker = broker();
        broker.set_queue_online("h1", false);
        let out = call(&broker, signature("t1", "echo", "h1"), Duration::from_millis(100))
            .await
            .expect("call");
        assert!(out.is_none());
        assert_eq!(broker.task_status("t1").state, TaskState::Pending);

        broker.set_queue_online("h1", true);
        for _ in 0..100 {
            if broker.task_status("t1").state == TaskState::Success {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.task_status("t1").state, TaskState::Success);
    }

    #[tokio::test]
    async fn rejects_duplicate_task_ids() {
        let broker = broker();
        broker.submit(signature("dup", "echo", "h1")).expect("first");
        let err = broker.submit(signature("dup", "echo", "h1")).expect_err("second");
        assert!(err.to_string().contains("duplicate task id"));
        assert_eq!(broker.submitted().len(), 1);
    }
}
