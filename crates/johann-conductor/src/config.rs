use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::host::{AgentVariant, HostOs};

pub const ENV_PREFIX: &str = "JOHANN_";

/// Per-image defaults applied to hosts that run a known image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageParams {
    pub user: Option<String>,
    pub pwd_env: Option<String>,
    pub os: Option<HostOs>,
    pub python_path: Option<String>,
    pub python_ver: Option<String>,
    pub agent_variant: Option<AgentVariant>,
    pub control_method: Option<String>,
    pub pip_offline_install: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub probe_timeout_ms: u64,
    pub settle_ms: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_max_ms: u64,
    pub agent_start_wait_ms: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        TuningConfig {
            probe_timeout_ms: 10_000,
            settle_ms: 15_000,
            max_retries: 2,
            backoff_ms: 3_000,
            backoff_max_ms: 600_000,
            agent_start_wait_ms: 15_000,
        }
    }
}

impl TuningConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JohannConfig {
    pub debug: bool,
    pub poll_interval_ms: u64,
    pub host_confirmed_on_valid_secs: i64,
    pub allow_empty_player_hosts: bool,
    pub host_auto_install: bool,
    pub conductor_allhosts_player_name: String,
    pub conductor_local_host_name: String,
    pub conductor_queue_id: String,
    pub broker_host_external: Option<String>,
    /// Registered control methods, each flagged with whether hosts reached
    /// through it need an externally reachable broker address.
    pub control_methods: BTreeMap<String, bool>,
    pub default_control_method: String,
    pub default_os: HostOs,
    pub default_python_path: String,
    pub default_agent_variant: AgentVariant,
    pub default_pip_offline_install: bool,
    pub supported_python_versions: Vec<String>,
    pub host_image_params: BTreeMap<String, ImageParams>,
    pub deploy_path: String,
    pub temp_path: String,
    pub pip_offline_archive: Option<PathBuf>,
    pub source_root: PathBuf,
    pub bundle_dir: PathBuf,
    pub codehash_files: Vec<String>,
    pub remote_codehash_task: String,
    pub tuning: TuningConfig,
}

impl Default for JohannConfig {
    fn default() -> Self {
        let mut control_methods = BTreeMap::new();
        control_methods.insert("DOCKER".to_string(), false);
        control_methods.insert("MEMORY".to_string(), false);

        let mut host_image_params = BTreeMap::new();
        host_image_params.insert(
            "johann_player".to_string(),
            ImageParams {
                user: Some("johann".to_string()),
                pwd_env: None,
                os: Some(HostOs::Linux),
                python_path: Some("/usr/local/bin/python3".to_string()),
                python_ver: Some("3.7".to_string()),
                agent_variant: Some(AgentVariant::None),
                control_method: Some("DOCKER".to_string()),
                pip_offline_install: Some(false),
            },
        );

        JohannConfig {
            debug: false,
            poll_interval_ms: 1_000,
            host_confirmed_on_valid_secs: 30,
            allow_empty_player_hosts: true,
            host_auto_install: true,
            conductor_allhosts_player_name: "conductor_allhosts".to_string(),
            conductor_local_host_name: "johann_conductor".to_string(),
            conductor_queue_id: "johann_conductor".to_string(),
            broker_host_external: None,
            control_methods,
            default_control_method: "DOCKER".to_string(),
            default_os: HostOs::Linux,
            default_python_path: "/usr/local/bin/python3".to_string(),
            default_agent_variant: AgentVariant::None,
            default_pip_offline_install: false,
            supported_python_versions: vec!["3.6".to_string(), "3.7".to_string()],
            host_image_params,
            deploy_path: "/opt/johann/johann".to_string(),
            temp_path: "/tmp".to_string(),
            pip_offline_archive: None,
            source_root: PathBuf::from("."),
            bundle_dir: std::env::temp_dir().join("johann_bundles"),
            codehash_files: vec!["agent/**/*".to_string(), "requirements.txt".to_string()],
            remote_codehash_task: crate::task::REMOTE_CODEHASH_TASK.to_string(),
            tuning: TuningConfig::default(),
        }
    }
}

impl JohannConfig {
    /// Reads the YAML config (defaults when no path is given), then applies
    /// `JOHANN_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<JohannConfig> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .map_err(|e| anyhow!("failed to read config {}: {}", path.display(), e))?;
                JohannConfig::from_yaml_str(&raw)?
            }
            None => JohannConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_yaml_str(raw: &str) -> Result<JohannConfig> {
        if raw.trim().is_empty() {
            return Ok(JohannConfig::default());
        }
        serde_yaml::from_str(raw).map_err(|e| anyhow!("invalid config: {}", e))
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = var("DEBUG") {
            self.debug = parse_bool_env("JOHANN_DEBUG", &v)?;
        }
        if let Some(v) = var("POLL_INTERVAL_MS") {
            self.poll_interval_ms = v
                .trim()
                .parse()
                .map_err(|_| anyhow!("JOHANN_POLL_INTERVAL_MS must be an integer: {}", v))?;
        }
        if let Some(v) = var("HOST_CONFIRMED_ON_VALID_SECS") {
            self.host_confirmed_on_valid_secs = v.trim().parse().map_err(|_| {
                anyhow!("JOHANN_HOST_CONFIRMED_ON_VALID_SECS must be an integer: {}", v)
            })?;
        }
        if let Some(v) = var("ALLOW_EMPTY_PLAYER_HOSTS") {
            self.allow_empty_player_hosts = parse_bool_env("JOHANN_ALLOW_EMPTY_PLAYER_HOSTS", &v)?;
        }
        if let Some(v) = var("HOST_AUTO_INSTALL") {
            self.host_auto_install = parse_bool_env("JOHANN_HOST_AUTO_INSTALL", &v)?;
        }
        if let Some(v) = var("BROKER_HOST_EXTERNAL") {
            let v = v.trim().to_string();
            self.broker_host_external = if v.is_empty() { None } else { Some(v) };
        }
        if let Some(v) = var("CONDUCTOR_QUEUE_ID") {
            self.conductor_queue_id = v;
        }
        if let Some(v) = var("SOURCE_ROOT") {
            self.source_root = PathBuf::from(v);
        }
        if let Some(v) = var("BUNDLE_DIR") {
            self.bundle_dir = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `None` when the control method is not registered.
    pub fn requires_external_broker(&self, control_method: &str) -> Option<bool> {
        self.control_methods.get(control_method).copied()
    }

    pub fn image_params(&self, image: Option<&str>) -> Option<&ImageParams> {
        image.and_then(|name| self.host_image_params.get(name))
    }

    pub fn supports_python(&self, version: &str) -> bool {
        self.supported_python_versions.iter().any(|v| v == version)
    }
}

fn parse_bool_env(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(anyhow!("{} must be a boolean, got '{}'", name, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = JohannConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.host_confirmed_on_valid_secs, 30);
        assert!(config.allow_empty_player_hosts);
        assert!(config.host_auto_install);
        assert_eq!(config.conductor_allhosts_player_name, "conductor_allhosts");
        assert_eq!(config.requires_external_broker("DOCKER"), Some(false));
        assert_eq!(config.requires_external_broker("SSH"), None);
        assert!(config.supports_python("3.7"));
        assert!(!config.supports_python("2.7"));
        assert_eq!(config.tuning.max_retries, 2);
    }

    #[test]
    fn yaml_overrides_only_named_fields() {
        let raw = "poll_interval_ms: 50\ntuning:\n  settle_ms: 0\ncontrol_methods:\n  DOCKER: true\n";
        let config = JohannConfig::from_yaml_str(raw).expect("config");
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.tuning.settle_ms, 0);
        assert_eq!(config.tuning.probe_timeout_ms, 10_000);
        assert_eq!(config.requires_external_broker("DOCKER"), Some(true));
        assert_eq!(config.conductor_local_host_name, "johann_conductor");
    }

    #[test]
    fn env_overrides_apply_with_prefix() {
        let mut config = JohannConfig::default();
        config
            .apply_env(|key| match key {
                "JOHANN_DEBUG" => Some("true".to_string()),
                "JOHANN_POLL_INTERVAL_MS" => Some("25".to_string()),
                "JOHANN_BROKER_HOST_EXTERNAL" => Some("10.0.0.5".to_string()),
                _ => None,
            })
            .expect("env");
        assert!(config.debug);
        assert_eq!(config.poll_interval_ms, 25);
        assert_eq!(config.broker_host_external.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn env_override_rejects_garbage() {
        let mut config = JohannConfig::default();
        let err = config
            .apply_env(|key| (key == "JOHANN_HOST_AUTO_INSTALL").then(|| "maybe".to_string()))
            .expect_err("bad bool");
        assert!(err.to_string().contains("JOHANN_HOST_AUTO_INSTALL"));
    }
}
