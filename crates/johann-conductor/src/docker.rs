use anyhow::{anyhow, Result};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

use crate::host::Host;
use crate::host_control::{CmdOutput, HostControl, RunOptions};

pub const DOCKER_METHOD: &str = "DOCKER";

/// Drives containers through the `docker` CLI.
pub struct DockerHostControl {
    binary: String,
}

impl Default for DockerHostControl {
    fn default() -> Self {
        DockerHostControl {
            binary: "docker".to_string(),
        }
    }
}

impl DockerHostControl {
    pub fn new(binary: &str) -> Self {
        DockerHostControl {
            binary: binary.to_string(),
        }
    }

    fn running_container_names(&self) -> Result<Vec<String>> {
        let output = Command::new(&self.binary)
            .args(["ps", "--format", "{{.Names}}"])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| anyhow!("failed to run {} ps: {}", self.binary, e))?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} ps failed: {}",
                self.binary,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(parse_container_names(&String::from_utf8_lossy(&output.stdout)))
    }

    fn exec_command(&self, host: &Host, cmd: &str, opts: &RunOptions) -> Command {
        let mut command = Command::new(&self.binary);
        command.arg("exec");
        if opts.detach {
            command.arg("-d");
        }
        if opts.privileged {
            command.arg("--privileged");
        }
        // Privileged commands run as the container's default user.
        if let Some(user) = host.user.as_deref().filter(|_| !opts.privileged) {
            command.args(["-u", user]);
        }
        if let Some(dir) = &opts.workdir {
            command.args(["-w", dir]);
        }
        for (key, value) in &opts.environment {
            command.arg("-e").arg(format!("{}={}", key, value));
        }
        command.arg(host.control_target());
        command.args(["/bin/sh", "-c", cmd]);
        command
    }
}

fn parse_container_names(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| line.trim().trim_start_matches('/'))
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

impl HostControl for DockerHostControl {
    fn method(&self) -> &str {
        DOCKER_METHOD
    }

    fn host_names(&self) -> Result<Vec<String>> {
        self.running_container_names()
    }

    fn host_exists(&self, control_name: &str) -> Result<bool> {
        Ok(self
            .running_container_names()?
            .iter()
            .any(|name| name == control_name))
    }

    fn put_archive(&self, host: &Host, archive: &Path, dest_dir: &str) -> Result<()> {
        let dest = format!("{}:{}/", host.control_target(), dest_dir.trim_end_matches('/'));
        debug!("{}: docker cp {} {}", host.name, archive.display(), dest);
        let status = Command::new(&self.binary)
            .arg("cp")
            .arg(archive)
            .arg(&dest)
            .stdin(Stdio::null())
            .status()
            .map_err(|e| anyhow!("failed to run {} cp: {}", self.binary, e))?;
        if !status.success() {
            return Err(anyhow!(
                "{}: copying {} to {} failed with {}",
                host.name,
                archive.display(),
                dest,
                status
            ));
        }
        Ok(())
    }

    fn run_cmd(&self, host: &Host, cmd: &str, opts: &RunOptions) -> Result<CmdOutput> {
        if opts.timeout.is_some() && !opts.detach {
            warn!("{}: docker exec does not support a timeout; ignoring", host.name);
        }
        debug!(
            "{}: {} (detach={}, privileged={}, workdir={:?})",
            host.name, cmd, opts.detach, opts.privileged, opts.workdir
        );
        let output = self
            .exec_command(host, cmd, opts)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| anyhow!("failed to run {} exec: {}", self.binary, e))?;
        if opts.detach {
            return Ok(CmdOutput {
                exit_code: None,
                output: String::new(),
            });
        }
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(CmdOutput {
            exit_code: output.status.code(),
            output: text.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JohannConfig;

    #[test]
    fn parses_ps_output() {
        let names = parse_container_names("/alpha\nbeta\n\n  gamma  \n");
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn exec_command_uses_control_name_and_options() {
        let config = JohannConfig::default();
        let mut host = Host::placeholder("h1", Some("johann_player"), &config).expect("host");
        host.control_name = Some("container_1".to_string());
        let mut opts = RunOptions::in_dir("/opt/johann/johann");
        opts.environment.insert("A".to_string(), "1".to_string());
        let command = DockerHostControl::default().exec_command(&host, "ls", &opts);
        let args: Vec<String> = command
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            args,
            vec!["exec", "-u", "johann", "-w", "/opt/johann/johann", "-e", "A=1", "container_1", "/bin/sh", "-c", "ls"]
        );
    }

    #[test]
    fn privileged_exec_drops_user() {
        let config = JohannConfig::default();
        let host = Host::placeholder("h1", Some("johann_player"), &config).expect("host");
        let command = DockerHostControl::default().exec_command(&host, "mkdir -p /x", &RunOptions::privileged());
        let args: Vec<String> = command
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert!(args.contains(&"--privileged".to_string()));
        assert!(!args.contains(&"-u".to_string()));
    }
}
