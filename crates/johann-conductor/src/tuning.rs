use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::agent::push_agent;
use crate::bundle::CodeVersion;
use crate::config::{JohannConfig, TuningConfig};
use crate::host::{Host, HostRegistry, SharedHost};
use crate::host_control::HostControlRegistry;
use crate::state::TaskState;
use crate::task::{call, TaskBroker, TaskContext, TaskHandler};

/// Outcome of one tuning attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TuneStep {
    Done,
    Retryable(String),
    Fatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(tuning: &TuningConfig) -> Self {
        RetryPolicy {
            max_retries: tuning.max_retries,
            backoff: Duration::from_millis(tuning.backoff_ms),
            backoff_max: Duration::from_millis(tuning.backoff_max_ms),
        }
    }

    /// `backoff * 2^retry`, capped at `backoff_max`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.backoff
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

#[derive(Debug, PartialEq)]
enum Probe {
    Match,
    Mismatch(String),
    Timeout,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Push {
    Install,
    Update,
}

/// Holds `host.tuning` for the lifetime of a push.
struct TuningGuard {
    host: SharedHost,
}

impl TuningGuard {
    fn engage(host: SharedHost) -> Self {
        host.lock().tuning = true;
        TuningGuard { host }
    }
}

impl Drop for TuningGuard {
    fn drop(&mut self) {
        self.host.lock().tuning = false;
    }
}

/// Brings a host's agent to the conductor's code version.
pub struct TuneHostTask {
    hosts: HostRegistry,
    controls: HostControlRegistry,
    config: Arc<JohannConfig>,
    code: Arc<CodeVersion>,
}

impl TuneHostTask {
    pub fn new(
        hosts: HostRegistry,
        controls: HostControlRegistry,
        config: Arc<JohannConfig>,
        code: Arc<CodeVersion>,
    ) -> Self {
        TuneHostTask {
            hosts,
            controls,
            config,
            code,
        }
    }

    async fn probe(&self, broker: &dyn TaskBroker, host: &Host, phase: &str) -> Probe {
        let signature = host.task_signature(
            "_",
            "_",
            &format!("tune_orchestra.remote_codehash.{}", phase),
            &self.config.remote_codehash_task,
            0,
            Vec::new(),
            Map::new(),
        );
        match call(broker, signature, self.config.tuning.probe_timeout()).await {
            Ok(Some(status)) if status.state == TaskState::Success => {
                let remote = status
                    .result
                    .as_ref()
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                debug!("{}: received codehash '{}'", host.name, remote);
                if remote == self.code.codehash {
                    Probe::Match
                } else {
                    Probe::Mismatch(remote)
                }
            }
            Ok(Some(status)) => Probe::Failed(format!(
                "{}: remote codehash request failed: {}",
                host.name,
                status.error.unwrap_or_default()
            )),
            Ok(None) => Probe::Timeout,
            Err(e) => Probe::Failed(format!("{}: remote codehash request failed: {}", host.name, e)),
        }
    }

    pub async fn tune_once(&self, ctx: &TaskContext, name: &str) -> TuneStep {
        let prefix = &ctx.description;
        if name == self.config.conductor_local_host_name {
            info!("{}: unnecessary to tune {}", prefix, name);
            return TuneStep::Done;
        }
        let Some(shared) = self.hosts.get(name) else {
            return TuneStep::Fatal(format!("{}: unrecognized host '{}'", prefix, name));
        };
        let host = shared.lock().clone();
        let method = host.control_method_or_default(&self.config).to_string();
        if self.config.requires_external_broker(&method).is_none() {
            return TuneStep::Fatal(format!("{}: unrecognized control method '{}'", prefix, method));
        }
        let Some(control) = self.controls.get(&method) else {
            return TuneStep::Fatal(format!(
                "{}: control method '{}' is not properly registered",
                prefix, method
            ));
        };
        debug!("{}: tuning host '{}'", prefix, name);

        let broker = ctx.broker.clone();
        let push = match self.probe(broker.as_ref(), &host, "pre").await {
            Probe::Match => {
                debug!("{} does not require update or install", name);
                return TuneStep::Done;
            }
            Probe::Mismatch(_) => {
                info!("{}: code hash mismatch", name);
                Push::Update
            }
            Probe::Timeout => {
                info!("{}: timed out waiting for remote codehash; assuming agent missing or not running", name);
                if !self.config.host_auto_install {
                    debug!("{}: auto install disabled; leaving host as is", name);
                    return TuneStep::Done;
                }
                Push::Install
            }
            Probe::Failed(msg) => return TuneStep::Retryable(msg),
        };

        if shared.lock().is_playing(broker.as_ref()) {
            return TuneStep::Retryable(format!(
                "{} is currently playing a score and cannot update the agent",
                name
            ));
        }

        {
            let _tuning = TuningGuard::engage(shared.clone());
            let config = self.config.clone();
            let code = self.code.clone();
            let target = host.clone();
            let pushed = tokio::task::spawn_blocking(move || {
                push_agent(control.as_ref(), &target, &config, &code, push == Push::Update)
            })
            .await;
            match pushed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return TuneStep::Retryable(format!("{:#}", e)),
                Err(e) => return TuneStep::Retryable(format!("{}: agent push aborted: {}", name, e)),
            }
            debug!("{}: giving the agent some time to start up", name);
            tokio::time::sleep(self.config.tuning.settle()).await;
        }

        match self.probe(broker.as_ref(), &host, "post").await {
            Probe::Match => {
                info!("{} successfully tuned", name);
                TuneStep::Done
            }
            Probe::Mismatch(remote) => {
                debug!("{} vs {}", self.code.codehash, remote);
                let msg = format!("{}: push failed; code hash mismatch", name);
                warn!("{}", msg);
                TuneStep::Retryable(msg)
            }
            Probe::Timeout => {
                let msg = format!("{}: push failed; timed out waiting for remote codehash", name);
                warn!("{}", msg);
                TuneStep::Retryable(msg)
            }
            Probe::Failed(msg) => TuneStep::Retryable(msg),
        }
    }
}

#[async_trait]
impl TaskHandler for TuneHostTask {
    async fn run(&self, ctx: TaskContext, _args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value> {
        let name = kwargs
            .get("target_host")
            .and_then(|h| h.get("hostname"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("{}: tune_host requires target_host.hostname", ctx.description))?
            .to_string();
        let policy = RetryPolicy::from_config(&self.config.tuning);
        let mut retries = 0;
        loop {
            match self.tune_once(&ctx, &name).await {
                TuneStep::Done => return Ok(json!({"hostname": name, "retries": retries})),
                TuneStep::Fatal(msg) => return Err(anyhow!(msg)),
                TuneStep::Retryable(msg) if retries >= policy.max_retries => {
                    return Err(anyhow!("{} (gave up after {} retries)", msg, retries));
                }
                TuneStep::Retryable(msg) => {
                    let delay = policy.delay_for(retries);
                    retries += 1;
                    warn!("{}: retry {} in {:?}: {}", ctx.description, retries, delay, msg);
                    ctx.update_state(
                        TaskState::Retry,
                        Some(json!({"error": msg, "retries": retries, "countdown_ms": delay.as_millis() as u64})),
                    );
                    tokio::time::sleep(delay).await;
                    ctx.update_state(TaskState::Started, None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;
    use crate::host_control::MemoryHostControl;
    use crate::task::{TaskRegistry, TaskSignature, TUNE_HOST_TASK};
    use chrono::Utc;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Codehash {
        answers: Vec<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for Codehash {
        async fn run(&self, _ctx: TaskContext, _args: Vec<Value>, _kwargs: Map<String, Value>) -> Result<Value> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            let answer = self.answers.get(i).or(self.answers.last()).cloned().unwrap_or_default();
            Ok(json!(answer))
        }
    }

    struct Fixture {
        broker: LocalBroker,
        control: Arc<MemoryHostControl>,
        hosts: HostRegistry,
        code: Arc<CodeVersion>,
        root: std::path::PathBuf,
    }

    fn fixture(tag: &str, answers: impl Fn(&str) -> Vec<String>) -> Fixture {
        let root = std::env::temp_dir().join(format!(
            "johann_tuning_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(root.join("agent")).expect("mkdir");
        fs::write(root.join("agent").join("main.py"), "pass\n").expect("write");
        let mut config = JohannConfig {
            source_root: root.clone(),
            bundle_dir: root.join("bundles"),
            default_control_method: "MEMORY".to_string(),
            ..JohannConfig::default()
        };
        config.tuning.probe_timeout_ms = 200;
        config.tuning.settle_ms = 0;
        config.tuning.backoff_ms = 1;
        config.tuning.agent_start_wait_ms = 0;
        let config = Arc::new(config);
        let code = Arc::new(CodeVersion::from_config(&config).expect("code"));

        let hosts = HostRegistry::new();
        hosts.get_or_insert(Host::placeholder("h1", None, &config).expect("host"));
        let control = Arc::new(MemoryHostControl::new("MEMORY").with_hosts(["h1"]));
        let mut controls = HostControlRegistry::new();
        controls.register(control.clone());

        let mut registry = TaskRegistry::new();
        registry.register(
            TUNE_HOST_TASK,
            Arc::new(TuneHostTask::new(hosts.clone(), controls, config.clone(), code.clone())),
        );
        registry.register(
            &config.remote_codehash_task,
            Arc::new(Codehash {
                answers: answers(&code.codehash),
                calls: AtomicUsize::new(0),
            }),
        );
        let broker = LocalBroker::new(registry).expect("broker");
        Fixture {
            broker,
            control,
            hosts,
            code,
            root,
        }
    }

    fn tune_signature(host: &str) -> TaskSignature {
        let mut kwargs = Map::new();
        kwargs.insert("target_host".to_string(), json!({"hostname": host}));
        TaskSignature {
            task_id: uuid::Uuid::new_v4().to_string(),
            task_name: TUNE_HOST_TASK.to_string(),
            queue: "johann_conductor".to_string(),
            description: format!("test.LOCAL.tune_orchestra.{}", host),
            args: Vec::new(),
            kwargs,
            countdown_secs: 0,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_secs(3),
            backoff_max: Duration::from_secs(10),
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(3));
        assert_eq!(policy.delay_for(1), Duration::from_secs(6));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn matching_host_needs_no_push() {
        let fx = fixture("match", |hash| vec![hash.to_string()]);
        let status = call(&fx.broker, tune_signature("h1"), Duration::from_secs(5))
            .await
            .expect("call")
            .expect("finished");
        assert_eq!(status.state, TaskState::Success);
        assert!(fx.control.pushes().is_empty());
        let _ = fs::remove_dir_all(&fx.root);
    }

    #[tokio::test]
    async fn stale_host_is_updated_then_verified() {
        let fx = fixture("update", |hash| vec!["stale".to_string(), hash.to_string()]);
        let status = call(&fx.broker, tune_signature("h1"), Duration::from_secs(5))
            .await
            .expect("call")
            .expect("finished");
        assert_eq!(status.state, TaskState::Success, "{:?}", status.error);
        let pushes = fx.control.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].1, format!("johann.{}.zip", fx.code.codehash));
        // update skips dependency installation
        assert!(!fx.control.commands().iter().any(|c| c.cmd.contains("pip install")));
        let host = fx.hosts.get("h1").expect("host");
        assert!(!host.lock().tuning);
        let _ = fs::remove_dir_all(&fx.root);
    }

    #[tokio::test]
    async fn unreachable_host_is_installed_and_fails_after_retries() {
        let fx = fixture("offline", |hash| vec![hash.to_string()]);
        fx.broker.set_queue_online("h1", false);
        let status = call(&fx.broker, tune_signature("h1"), Duration::from_secs(10))
            .await
            .expect("call")
            .expect("finished");
        assert_eq!(status.state, TaskState::Failure);
        let error = status.error.expect("error");
        assert!(error.contains("timed out waiting for remote codehash"), "{}", error);
        assert!(error.contains("gave up after 2 retries"), "{}", error);
        assert_eq!(status.retries, 2);
        assert!(fx.control.commands().iter().any(|c| c.cmd.contains("pip install")));
        let _ = fs::remove_dir_all(&fx.root);
    }

    #[tokio::test]
    async fn conductor_host_and_unknown_hosts() {
        let fx = fixture("local", |hash| vec![hash.to_string()]);
        let status = call(&fx.broker, tune_signature("johann_conductor"), Duration::from_secs(5))
            .await
            .expect("call")
            .expect("finished");
        assert_eq!(status.state, TaskState::Success);

        let status = call(&fx.broker, tune_signature("ghost"), Duration::from_secs(5))
            .await
            .expect("call")
            .expect("finished");
        assert_eq!(status.state, TaskState::Failure);
        assert!(status.error.expect("error").contains("unrecognized host 'ghost'"));
        assert_eq!(status.retries, 0);
        let _ = fs::remove_dir_all(&fx.root);
    }
}
