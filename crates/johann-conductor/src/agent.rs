use anyhow::{anyhow, Result};
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bundle::{sha256_file, CodeVersion};
use crate::config::JohannConfig;
use crate::host::{AgentVariant, Host, HostOs};
use crate::host_control::{CmdOutput, HostControl, RunOptions};

pub const AGENT_ENTRYPOINT: &str = "johann_main.py";
const DEVUDP_CONTROL_ADDR: &str = "/dev/udp/127.0.0.1/31337";

fn run_checked(control: &dyn HostControl, host: &Host, cmd: &str, opts: &RunOptions, what: &str) -> Result<CmdOutput> {
    let out = control.run_cmd(host, cmd, opts)?;
    if !out.success() {
        return Err(anyhow!("{}: {}: {}", host.name, what, out.output));
    }
    Ok(out)
}

fn python_path<'a>(host: &'a Host, config: &'a JohannConfig) -> &'a str {
    host.python_path
        .as_deref()
        .unwrap_or(config.default_python_path.as_str())
}

pub fn probe_python_version(control: &dyn HostControl, host: &Host, config: &JohannConfig) -> Result<String> {
    let cmd = format!(
        "{} --version | cut -d ' ' -f2 | cut -d. -f1-2",
        python_path(host, config)
    );
    let out = run_checked(control, host, &cmd, &RunOptions::default(), "failed to get valid python version")?;
    let version = out.output.trim().to_string();
    if version.is_empty() {
        return Err(anyhow!("{}: failed to get valid python version; no output", host.name));
    }
    Ok(version)
}

pub fn probe_os(control: &dyn HostControl, host: &Host) -> Result<HostOs> {
    let out = run_checked(control, host, "uname -s", &RunOptions::default(), "failed to determine OS and none provided")?;
    match out.output.trim().to_ascii_uppercase().as_str() {
        "LINUX" => Ok(HostOs::Linux),
        "WINDOWS" | "WINDOWS_NT" => Ok(HostOs::Windows),
        other => Err(anyhow!("{}: Unsupported OS '{}'", host.name, other)),
    }
}

fn agent_is_running(control: &dyn HostControl, host: &Host) -> Result<bool> {
    let out = control.run_cmd(host, &format!("pgrep -f {}", AGENT_ENTRYPOINT), &RunOptions::default())?;
    Ok(out.success())
}

fn stop_agent(control: &dyn HostControl, host: &Host, deploy: &str) -> Result<()> {
    match host.agent_variant.unwrap_or(AgentVariant::None) {
        AgentVariant::None => {
            control.run_cmd(host, &format!("pkill -f {}", AGENT_ENTRYPOINT), &RunOptions::privileged())?;
        }
        AgentVariant::Devudp => {
            let cmd = format!("/bin/bash -c \"echo -n 'disable johann_player' > {}\"", DEVUDP_CONTROL_ADDR);
            run_checked(control, host, &cmd, &RunOptions::in_dir(deploy), "possible issues disabling agent")?;
        }
    }
    Ok(())
}

fn start_agent(control: &dyn HostControl, host: &Host, config: &JohannConfig) -> Result<()> {
    let deploy = config.deploy_path.as_str();
    match host.agent_variant.unwrap_or(AgentVariant::None) {
        AgentVariant::None => {
            let mut opts = RunOptions::in_dir(deploy);
            opts.detach = true;
            opts.environment.insert("JOHANN_DETACH".to_string(), "True".to_string());
            opts.environment.insert("PYTHONPATH".to_string(), deploy.to_string());
            control.run_cmd(host, &format!("{} {}", python_path(host, config), AGENT_ENTRYPOINT), &opts)?;
        }
        AgentVariant::Devudp => {
            let cmd = format!("/bin/bash -c \"echo -n 'enable johann_player' > {}\"", DEVUDP_CONTROL_ADDR);
            run_checked(control, host, &cmd, &RunOptions::in_dir(deploy), "possible issues enabling agent")?;
        }
    }
    Ok(())
}

/// Host-specific settings written to the agent's `.env`.
pub fn agent_env(host: &Host, config: &JohannConfig) -> Vec<(String, String)> {
    let mut env = vec![("JOHANN_QUEUE_ID".to_string(), host.name.clone())];
    if config.debug {
        env.push(("DEBUG".to_string(), "1".to_string()));
    }
    if let Some(user) = &host.user {
        env.push(("JOHANN_USER".to_string(), user.clone()));
    }
    let method = host.control_method_or_default(config);
    if config.requires_external_broker(method) == Some(true) {
        if let Some(broker) = &config.broker_host_external {
            env.push(("JOHANN_BROKER_HOST".to_string(), broker.clone()));
        }
    }
    env
}

fn push_offline_archive(control: &dyn HostControl, host: &Host, archive: &Path, deploy: &str) -> Result<()> {
    let file_name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("offline package archive has no file name"))?;
    let local_hash = sha256_file(archive)?;
    let remote = control.run_cmd(
        host,
        &format!("sha256sum {}/minirepo/{}", deploy, file_name),
        &RunOptions::default(),
    )?;
    let remote_hash = remote.output.split_whitespace().next().unwrap_or_default();
    if remote.success() && remote_hash == local_hash {
        info!("{}: offline package archive already present with matching hash {}", host.name, local_hash);
        return Ok(());
    }
    info!("{}: pushing offline package archive; this can take some time", host.name);
    control.put_archive(host, archive, &format!("{}/minirepo", deploy))?;
    run_checked(
        control,
        host,
        &format!("tar -xzf {} ", file_name),
        &RunOptions::in_dir(&format!("{}/minirepo", deploy)),
        "unpacking offline package archive failed",
    )?;
    Ok(())
}

/// Installs (or with `update_only`, updates) the agent on `host` and
/// restarts it. Blocking; run it off the async runtime.
pub fn push_agent(
    control: &dyn HostControl,
    host: &Host,
    config: &JohannConfig,
    code: &CodeVersion,
    update_only: bool,
) -> Result<()> {
    if update_only {
        info!("{}: updating agent via '{}'", host.name, host.control_target());
    } else {
        info!("{}: installing agent via '{}'", host.name, host.control_target());
    }
    let python = python_path(host, config).to_string();

    let python_ver = match &host.python_ver {
        Some(v) => v.clone(),
        None => probe_python_version(control, host, config)?,
    };
    if !config.supports_python(&python_ver) {
        return Err(anyhow!("{}: invalid python version: {}", host.name, python_ver));
    }
    let os = match host.os {
        Some(os) => os,
        None => probe_os(control, host)?,
    };
    if os != HostOs::Linux {
        return Err(anyhow!("{}: Unsupported OS '{:?}'", host.name, os));
    }
    let deploy = config.deploy_path.as_str();
    debug!("{}: workdir {}; tempdir {}", host.name, deploy, config.temp_path);

    let bundle = code.ensure_bundle()?;
    let bundle_name = bundle
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("bundle path has no file name"))?;

    if !update_only {
        debug!("{}: ensuring target directories exist", host.name);
        for dir in [format!("{}/minirepo", deploy), config.temp_path.clone()] {
            run_checked(
                control,
                host,
                &format!("mkdir -p {}", dir),
                &RunOptions::privileged(),
                "failed to make dir for agent",
            )?;
        }
        if let Some(user) = &host.user {
            run_checked(
                control,
                host,
                &format!("chown {} {} {}/minirepo", user, deploy, deploy),
                &RunOptions::privileged(),
                "failed to set dir permissions for agent workpath",
            )?;
        }
    }

    stop_agent(control, host, deploy)?;

    debug!("{}: pushing bundle {}", host.name, bundle_name);
    control
        .put_archive(host, &bundle, deploy)
        .map_err(|e| anyhow!("{}: pushing of bundle failed: {}", host.name, e))?;
    run_checked(
        control,
        host,
        &format!("{} -m zipfile -e {} .", python, bundle_name),
        &RunOptions::in_dir(deploy),
        "unpacking bundle failed",
    )?;

    if !update_only {
        let mut pip = format!("{} -m pip install", python);
        if host.user.is_some() {
            pip.push_str(" --user");
        }
        if host.pip_offline_install {
            let archive = config
                .pip_offline_archive
                .as_deref()
                .ok_or_else(|| anyhow!("{}: offline install requested but no package archive configured", host.name))?;
            push_offline_archive(control, host, archive, deploy)?;
            pip.push_str(" --no-index -f minirepo");
        } else {
            pip.push_str(" --retries=2 --timeout=5");
        }
        pip.push_str(" -r requirements.txt --disable-pip-version-check");
        run_checked(
            control,
            host,
            &pip,
            &RunOptions::in_dir(deploy),
            "possible issues installing pip requirements",
        )?;
    }

    if agent_is_running(control, host)? {
        return Err(anyhow!("{}: agent is still running after stop; something is wrong", host.name));
    }

    let conf = agent_env(host, config)
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("\n");
    run_checked(
        control,
        host,
        &format!("echo '{}' > .env", conf),
        &RunOptions::in_dir(deploy),
        "writing .env for agent failed",
    )?;

    start_agent(control, host, config)?;

    let wait = Duration::from_millis(config.tuning.agent_start_wait_ms);
    let interval = Duration::from_secs(2).min(wait);
    if !interval.is_zero() {
        debug!("{}: waiting up to {:?} for agent to start", host.name, wait);
        let mut waited = Duration::ZERO;
        while waited < wait {
            thread::sleep(interval);
            waited += interval;
            if agent_is_running(control, host)? {
                debug!("{}: agent started", host.name);
                return Ok(());
            }
        }
    }
    if agent_is_running(control, host)? {
        debug!("{}: agent started", host.name);
        return Ok(());
    }
    warn!("{}: agent did not start", host.name);
    Err(anyhow!("{} had issues starting the agent", host.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_control::MemoryHostControl;
    use chrono::Utc;
    use std::fs;
    use std::path::PathBuf;

    fn fixture(tag: &str) -> (JohannConfig, CodeVersion, PathBuf) {
        let root = std::env::temp_dir().join(format!(
            "johann_agent_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(root.join("agent")).expect("mkdir");
        fs::write(root.join("agent").join(AGENT_ENTRYPOINT), "pass\n").expect("write");
        let mut config = JohannConfig {
            source_root: root.clone(),
            bundle_dir: root.join("bundles"),
            ..JohannConfig::default()
        };
        config.tuning.agent_start_wait_ms = 0;
        let code = CodeVersion::from_config(&config).expect("code");
        (config, code, root)
    }

    fn host(config: &JohannConfig) -> Host {
        Host::placeholder("h1", Some("johann_player"), config).expect("host")
    }

    #[test]
    fn install_sets_up_dirs_installs_and_starts() {
        let (config, code, root) = fixture("install");
        let control = MemoryHostControl::new("MEMORY").with_hosts(["h1"]);
        push_agent(&control, &host(&config), &config, &code, false).expect("install");

        let cmds: Vec<String> = control.commands().into_iter().map(|c| c.cmd).collect();
        assert!(cmds.iter().any(|c| c.starts_with("mkdir -p /opt/johann/johann/minirepo")));
        assert!(cmds.iter().any(|c| c.starts_with("chown johann")));
        assert!(cmds.iter().any(|c| c.contains("pip install --user --retries=2")));
        assert!(cmds.iter().any(|c| c.contains("JOHANN_QUEUE_ID=h1")));
        assert!(control.agent_running("h1"));
        let pushes = control.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].1, format!("johann.{}.zip", code.codehash));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn update_skips_install_only_steps() {
        let (config, code, root) = fixture("update");
        let control = MemoryHostControl::new("MEMORY").with_hosts(["h1"]);
        push_agent(&control, &host(&config), &config, &code, true).expect("update");
        let cmds: Vec<String> = control.commands().into_iter().map(|c| c.cmd).collect();
        assert!(!cmds.iter().any(|c| c.starts_with("mkdir")));
        assert!(!cmds.iter().any(|c| c.contains("pip install")));
        assert!(control.agent_running("h1"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn probes_missing_python_and_os() {
        let (config, code, root) = fixture("probe");
        let control = MemoryHostControl::new("MEMORY").with_hosts(["h1"]);
        let bare = Host::placeholder("h1", None, &config).expect("host");
        assert!(bare.python_ver.is_none());
        assert!(bare.os.is_none());
        push_agent(&control, &bare, &config, &code, true).expect("update");
        let cmds: Vec<String> = control.commands().into_iter().map(|c| c.cmd).collect();
        assert!(cmds.iter().any(|c| c.contains("--version")));
        assert!(cmds.iter().any(|c| c == "uname -s"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn pip_failure_aborts_before_start() {
        let (config, code, root) = fixture("pip");
        let control = MemoryHostControl::new("MEMORY").with_hosts(["h1"]);
        control.fail_commands_containing("pip install");
        let err = push_agent(&control, &host(&config), &config, &code, false).expect_err("pip");
        assert!(err.to_string().contains("possible issues installing pip requirements"));
        assert!(!control.agent_running("h1"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn external_broker_lands_in_env_when_required() {
        let mut config = JohannConfig::default();
        config.control_methods.insert("DOCKER".to_string(), true);
        config.broker_host_external = Some("10.1.1.1".to_string());
        let env = agent_env(&host(&config), &config);
        assert!(env.contains(&("JOHANN_BROKER_HOST".to_string(), "10.1.1.1".to_string())));
        assert!(env.contains(&("JOHANN_USER".to_string(), "johann".to_string())));
    }
}
