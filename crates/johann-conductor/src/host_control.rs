use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::agent::AGENT_ENTRYPOINT;
use crate::host::Host;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    pub environment: BTreeMap<String, String>,
    pub privileged: bool,
    pub workdir: Option<String>,
    pub detach: bool,
    /// Best effort; backends may ignore it.
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn privileged() -> Self {
        RunOptions {
            privileged: true,
            ..RunOptions::default()
        }
    }

    pub fn in_dir(workdir: &str) -> Self {
        RunOptions {
            workdir: Some(workdir.to_string()),
            ..RunOptions::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CmdOutput {
    /// `None` for detached commands.
    pub exit_code: Option<i32>,
    pub output: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Backend that can reach hosts directly: list them, check existence, copy
/// files in and run commands.
pub trait HostControl: Send + Sync {
    fn method(&self) -> &str;
    fn host_names(&self) -> Result<Vec<String>>;
    fn host_exists(&self, control_name: &str) -> Result<bool>;
    /// Copies `archive` into `dest_dir` on the host, keeping its file name.
    fn put_archive(&self, host: &Host, archive: &Path, dest_dir: &str) -> Result<()>;
    fn run_cmd(&self, host: &Host, cmd: &str, opts: &RunOptions) -> Result<CmdOutput>;
}

#[derive(Clone, Default)]
pub struct HostControlRegistry {
    backends: BTreeMap<String, Arc<dyn HostControl>>,
}

impl HostControlRegistry {
    pub fn new() -> Self {
        HostControlRegistry::default()
    }

    pub fn register(&mut self, backend: Arc<dyn HostControl>) {
        self.backends.insert(backend.method().to_string(), backend);
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn HostControl>> {
        self.backends.get(method).cloned()
    }

    /// Names known to every backend. Backend failures are logged and skipped.
    pub fn all_host_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for (method, backend) in &self.backends {
            match backend.host_names() {
                Ok(found) => {
                    debug!("Found {} hosts via {}", found.len(), method);
                    names.extend(found);
                }
                Err(e) => error!(error = %e, "{}: failed to list hosts", method),
            }
        }
        names
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCmd {
    pub host: String,
    pub cmd: String,
    pub opts: RunOptions,
}

#[derive(Debug, Default)]
struct MemoryState {
    hosts: BTreeSet<String>,
    running: BTreeSet<String>,
    pushes: Vec<(String, String, String)>,
    commands: Vec<RecordedCmd>,
    failing: Vec<String>,
}

/// Hosts that live only in memory. Commands are recorded and answered with
/// canned output; the agent is "running" between a start and a stop command.
pub struct MemoryHostControl {
    method: String,
    python_version: String,
    os_name: String,
    state: Mutex<MemoryState>,
}

impl MemoryHostControl {
    pub fn new(method: &str) -> Self {
        MemoryHostControl {
            method: method.to_string(),
            python_version: "3.7".to_string(),
            os_name: "Linux".to_string(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn with_hosts<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().hosts.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn add_host(&self, name: &str) {
        self.state.lock().hosts.insert(name.to_string());
    }

    /// Commands containing `needle` exit 1.
    pub fn fail_commands_containing(&self, needle: &str) {
        self.state.lock().failing.push(needle.to_string());
    }

    pub fn pushes(&self) -> Vec<(String, String, String)> {
        self.state.lock().pushes.clone()
    }

    pub fn commands(&self) -> Vec<RecordedCmd> {
        self.state.lock().commands.clone()
    }

    pub fn agent_running(&self, host: &str) -> bool {
        self.state.lock().running.contains(host)
    }
}

impl HostControl for MemoryHostControl {
    fn method(&self) -> &str {
        &self.method
    }

    fn host_names(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().hosts.iter().cloned().collect())
    }

    fn host_exists(&self, control_name: &str) -> Result<bool> {
        Ok(self.state.lock().hosts.contains(control_name))
    }

    fn put_archive(&self, host: &Host, archive: &Path, dest_dir: &str) -> Result<()> {
        let mut state = self.state.lock();
        let target = host.control_target().to_string();
        if !state.hosts.contains(&target) {
            return Err(anyhow!("{}: no such host '{}'", self.method, target));
        }
        let file_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| anyhow!("archive path has no file name: {}", archive.display()))?;
        state.pushes.push((host.name.clone(), file_name, dest_dir.to_string()));
        Ok(())
    }

    fn run_cmd(&self, host: &Host, cmd: &str, opts: &RunOptions) -> Result<CmdOutput> {
        let mut state = self.state.lock();
        let target = host.control_target().to_string();
        if !state.hosts.contains(&target) {
            return Err(anyhow!("{}: no such host '{}'", self.method, target));
        }
        state.commands.push(RecordedCmd {
            host: host.name.clone(),
            cmd: cmd.to_string(),
            opts: opts.clone(),
        });

        if state.failing.iter().any(|needle| cmd.contains(needle.as_str())) {
            return Ok(CmdOutput {
                exit_code: Some(1),
                output: "simulated failure".to_string(),
            });
        }
        let reply = |code: i32, output: &str| CmdOutput {
            exit_code: Some(code),
            output: output.to_string(),
        };
        if cmd.starts_with("pgrep") {
            let running = state.running.contains(&host.name);
            return Ok(reply(if running { 0 } else { 1 }, ""));
        }
        if cmd.starts_with("pkill") {
            state.running.remove(&host.name);
            return Ok(reply(0, ""));
        }
        if opts.detach && cmd.contains(AGENT_ENTRYPOINT) {
            state.running.insert(host.name.clone());
            return Ok(CmdOutput {
                exit_code: None,
                output: String::new(),
            });
        }
        if cmd.contains("--version") {
            return Ok(reply(0, &self.python_version));
        }
        if cmd.starts_with("uname") {
            return Ok(reply(0, &self.os_name));
        }
        Ok(reply(0, ""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JohannConfig;

    #[test]
    fn memory_control_tracks_agent_lifecycle() {
        let control = MemoryHostControl::new("MEMORY").with_hosts(["h1"]);
        let host = Host::placeholder("h1", None, &JohannConfig::default()).expect("host");
        assert!(control.host_exists("h1").expect("exists"));
        assert!(!control.host_exists("h2").expect("exists"));

        let start = RunOptions {
            detach: true,
            ..RunOptions::default()
        };
        let out = control
            .run_cmd(&host, &format!("python3 {}", AGENT_ENTRYPOINT), &start)
            .expect("start");
        assert_eq!(out.exit_code, None);
        assert!(control.agent_running("h1"));
        let out = control
            .run_cmd(&host, "pgrep -f johann", &RunOptions::default())
            .expect("pgrep");
        assert!(out.success());
        control
            .run_cmd(&host, "pkill -f johann", &RunOptions::privileged())
            .expect("pkill");
        assert!(!control.agent_running("h1"));
        assert_eq!(control.commands().len(), 3);
    }

    #[test]
    fn memory_control_rejects_unknown_hosts_and_simulates_failures() {
        let control = MemoryHostControl::new("MEMORY").with_hosts(["h1"]);
        let config = JohannConfig::default();
        let ghost = Host::placeholder("ghost", None, &config).expect("host");
        let err = control
            .run_cmd(&ghost, "true", &RunOptions::default())
            .expect_err("unknown host");
        assert!(err.to_string().contains("no such host 'ghost'"));

        let host = Host::placeholder("h1", None, &config).expect("host");
        control.fail_commands_containing("pip install");
        let out = control
            .run_cmd(&host, "python3 -m pip install -r requirements.txt", &RunOptions::default())
            .expect("run");
        assert_eq!(out.exit_code, Some(1));
    }

    #[test]
    fn registry_merges_host_names() {
        let mut registry = HostControlRegistry::new();
        registry.register(Arc::new(MemoryHostControl::new("MEMORY").with_hosts(["a", "b"])));
        registry.register(Arc::new(MemoryHostControl::new("OTHER").with_hosts(["c"])));
        let mut names = registry.all_host_names();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(registry.get("MEMORY").is_some());
        assert!(registry.get("DOCKER").is_none());
    }
}
