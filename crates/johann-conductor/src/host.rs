use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::JohannConfig;
use crate::error::{JohannError, JohannResult};
use crate::log_prefix;
use crate::task::{TaskBroker, TaskSignature};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostOs {
    Linux,
    Windows,
}

/// Which agent build a host runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentVariant {
    None,
    Devudp,
}

/// Host description as supplied by a hosts file, `add_hosts`, or a
/// placeholder created during validation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostSpec {
    #[serde(rename = "hostname", default)]
    pub name: String,
    #[serde(default)]
    pub control_name: Option<String>,
    #[serde(default)]
    pub johann_id: Option<Uuid>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pwd_env: Option<String>,
    #[serde(default)]
    pub os: Option<HostOs>,
    #[serde(default)]
    pub python_path: Option<String>,
    #[serde(default, deserialize_with = "lax_string")]
    pub python_ver: Option<String>,
    #[serde(default)]
    pub agent_variant: Option<AgentVariant>,
    #[serde(default)]
    pub control_method: Option<String>,
    #[serde(default)]
    pub pip_offline_install: Option<bool>,
}

/// Accepts `3.7` as well as `"3.7"`.
fn lax_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

/// Letters, digits, `_`, `-` and `.`; must not start with `-` or `.`.
pub fn is_safe_host_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Host {
    #[serde(rename = "hostname")]
    pub name: String,
    pub control_name: Option<String>,
    pub johann_id: Option<Uuid>,
    image: Option<String>,
    pub user: Option<String>,
    pub pwd_env: Option<String>,
    pub os: Option<HostOs>,
    pub python_path: Option<String>,
    pub python_ver: Option<String>,
    pub agent_variant: Option<AgentVariant>,
    pub control_method: Option<String>,
    pub pip_offline_install: bool,
    pub tuning: bool,
    pub pending_create: bool,
    /// Finished ids may be pruned at any time; only running tasks are
    /// guaranteed to be listed.
    #[serde(rename = "task_ids")]
    pub active_task_ids: Vec<String>,
    pub last_confirmed_on: Option<DateTime<Utc>>,
}

impl Host {
    pub fn from_spec(spec: HostSpec, config: &JohannConfig) -> JohannResult<Host> {
        if !is_safe_host_name(&spec.name) {
            return Err(JohannError::validation(format!(
                "Name '{}' does not appear to be a valid hostname",
                spec.name
            )));
        }
        if let Some(control_name) = &spec.control_name {
            if !is_safe_host_name(control_name) {
                return Err(JohannError::validation(format!(
                    "Control name '{}' does not appear to be valid",
                    control_name
                )));
            }
        }
        if let Some(ver) = &spec.python_ver {
            if !config.supports_python(ver) {
                return Err(JohannError::validation(format!(
                    "Unsupported python version '{}'",
                    ver
                )));
            }
        }
        if let Some(method) = &spec.control_method {
            if config.requires_external_broker(method).is_none() {
                return Err(JohannError::validation(format!(
                    "Control method '{}' is invalid",
                    method
                )));
            }
        }

        debug!("Creating Host object for '{}'", spec.name);
        let mut host = Host {
            name: spec.name,
            control_name: spec.control_name,
            johann_id: spec.johann_id,
            image: spec.image,
            user: spec.user,
            pwd_env: spec.pwd_env,
            os: spec.os,
            python_path: spec.python_path,
            python_ver: spec.python_ver,
            agent_variant: spec.agent_variant,
            control_method: spec.control_method,
            pip_offline_install: spec.pip_offline_install.unwrap_or(false),
            tuning: false,
            pending_create: false,
            active_task_ids: Vec::new(),
            last_confirmed_on: None,
        };
        host.fill_unset_from_image(config);
        Ok(host)
    }

    pub fn placeholder(name: &str, image: Option<&str>, config: &JohannConfig) -> JohannResult<Host> {
        Host::from_spec(
            HostSpec {
                name: name.to_string(),
                image: image.map(str::to_string),
                ..HostSpec::default()
            },
            config,
        )
    }

    pub fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }

    fn fill_unset_from_image(&mut self, config: &JohannConfig) {
        let params = config.image_params(self.image()).cloned().unwrap_or_default();
        if self.user.is_none() {
            self.user = params.user;
        }
        if self.pwd_env.is_none() {
            self.pwd_env = params.pwd_env;
        }
        // Left unset without image params so the OS is probed at install time.
        if self.os.is_none() {
            self.os = params.os;
        }
        if self.python_path.is_none() {
            self.python_path = Some(params.python_path.unwrap_or_else(|| config.default_python_path.clone()));
        }
        if self.python_ver.is_none() {
            self.python_ver = params.python_ver;
        }
        if self.agent_variant.is_none() {
            self.agent_variant = Some(params.agent_variant.unwrap_or(config.default_agent_variant));
        }
        if self.control_method.is_none() {
            self.control_method =
                Some(params.control_method.unwrap_or_else(|| config.default_control_method.clone()));
        }
        if !self.pip_offline_install {
            self.pip_offline_install = params
                .pip_offline_install
                .unwrap_or(config.default_pip_offline_install);
        }
    }

    /// Switches the image and re-derives image-dependent fields. Returns true
    /// when the new image has registered params (or nothing changed).
    pub fn set_image(&mut self, image: Option<&str>, config: &JohannConfig) -> bool {
        if self.image.as_deref() == image {
            return true;
        }
        self.image = image.map(str::to_string);
        let known = config.image_params(image);
        let params = known.cloned().unwrap_or_default();
        self.user = params.user;
        self.pwd_env = params.pwd_env;
        self.os = Some(params.os.unwrap_or(config.default_os));
        self.python_path = Some(params.python_path.unwrap_or_else(|| config.default_python_path.clone()));
        self.agent_variant = Some(params.agent_variant.unwrap_or(config.default_agent_variant));
        self.control_method =
            Some(params.control_method.unwrap_or_else(|| config.default_control_method.clone()));
        self.pip_offline_install = params
            .pip_offline_install
            .unwrap_or(config.default_pip_offline_install);
        known.is_some()
    }

    /// Updates descriptor fields from `other` in place. Name, control name
    /// and runtime flags are left alone.
    pub fn copy_from(&mut self, other: &Host, config: &JohannConfig) {
        if other.name != self.name {
            warn!(
                "copy_from() called with host '{}' for host '{}'",
                other.name, self.name
            );
        }
        if other.image != self.image {
            debug!("{}| updating image from {:?} to {:?}", self.name, self.image, other.image);
            self.set_image(other.image(), config);
        }
        self.user = other.user.clone();
        self.pwd_env = other.pwd_env.clone();
        self.os = other.os;
        self.python_path = other.python_path.clone();
        self.python_ver = other.python_ver.clone();
        self.agent_variant = other.agent_variant;
        self.control_method = other.control_method.clone();
        self.pip_offline_install = other.pip_offline_install;
    }

    pub fn control_method_or_default<'a>(&'a self, config: &'a JohannConfig) -> &'a str {
        self.control_method
            .as_deref()
            .unwrap_or(config.default_control_method.as_str())
    }

    pub fn control_target(&self) -> &str {
        self.control_name.as_deref().unwrap_or(self.name.as_str())
    }

    pub fn confirmed_within(&self, now: DateTime<Utc>, ttl_secs: i64) -> Option<i64> {
        self.last_confirmed_on
            .map(|at| (now - at).num_seconds())
            .filter(|age| *age < ttl_secs)
    }

    pub fn prune_finished_tasks(&mut self, broker: &dyn TaskBroker) {
        self.active_task_ids
            .retain(|id| !broker.task_status(id).state.is_terminal());
    }

    pub fn is_playing(&mut self, broker: &dyn TaskBroker) -> bool {
        self.prune_finished_tasks(broker);
        !self.active_task_ids.is_empty()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn task_signature(
        &self,
        score_name: &str,
        player_name: &str,
        measure_name: &str,
        task_name: &str,
        countdown_secs: u64,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> TaskSignature {
        let prefix = log_prefix(Some(score_name), Some(measure_name), Some(player_name), Some(&self.name));
        if self.tuning {
            warn!(
                "{}| host is tuning or pending tuning; tasks queued now may be interrupted",
                prefix
            );
        }
        let signature = TaskSignature {
            task_id: Uuid::new_v4().to_string(),
            task_name: task_name.to_string(),
            queue: self.name.clone(),
            description: format!("{}.{}.{}.{}", score_name, player_name, self.name, measure_name),
            args,
            kwargs,
            countdown_secs,
        };
        debug!("{}| task signature created for {} ({})", prefix, task_name, signature.task_id);
        signature
    }

    pub fn dump(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

pub type SharedHost = Arc<Mutex<Host>>;

/// Process-wide host table. Names handed out by `reserve_names` stay
/// reserved so concurrent validations never synthesize the same name.
#[derive(Clone, Default)]
pub struct HostRegistry {
    hosts: Arc<RwLock<BTreeMap<String, SharedHost>>>,
    reserved: Arc<Mutex<BTreeSet<String>>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        HostRegistry::default()
    }

    pub fn get(&self, name: &str) -> Option<SharedHost> {
        self.hosts.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hosts.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.hosts.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.read().is_empty()
    }

    /// Inserts unless a host of that name exists; returns the registered one.
    /// A reservation for the name ends once the host is registered.
    pub fn get_or_insert(&self, host: Host) -> SharedHost {
        let name = host.name.clone();
        let registered = {
            let mut hosts = self.hosts.write();
            hosts
                .entry(name.clone())
                .or_insert_with(|| Arc::new(Mutex::new(host)))
                .clone()
        };
        self.reserved.lock().remove(&name);
        registered
    }

    pub fn snapshot(&self) -> Vec<Host> {
        self.hosts.read().values().map(|h| h.lock().clone()).collect()
    }

    /// Runs `assign` with every name currently taken (registered, reserved,
    /// or listed in `external`) and reserves whatever it adds.
    pub fn reserve_names<F>(&self, external: &[String], assign: F)
    where
        F: FnOnce(&mut BTreeSet<String>),
    {
        let mut reserved = self.reserved.lock();
        let mut taken: BTreeSet<String> = reserved.clone();
        taken.extend(self.names());
        taken.extend(external.iter().cloned());
        let before = taken.clone();
        assign(&mut taken);
        reserved.extend(taken.difference(&before).cloned());
    }

    /// Drops reservations that will never be registered.
    pub fn release_names(&self, names: &[String]) {
        let mut reserved = self.reserved.lock();
        for name in names {
            reserved.remove(name);
        }
    }

    #[cfg(test)]
    pub(crate) fn reserved_count(&self) -> usize {
        self.reserved.lock().len()
    }

    /// Adds or updates hosts from a `{name: descriptor}` map. With
    /// `allow_invalid` false nothing is applied when any descriptor is bad.
    pub fn update_hosts(
        &self,
        descriptors: &Map<String, Value>,
        allow_invalid: bool,
        config: &JohannConfig,
    ) -> (bool, Vec<String>, Vec<String>) {
        let mut valid = Vec::new();
        let mut errors = Vec::new();
        for (name, raw) in descriptors {
            let mut raw = raw.clone();
            if let Value::Object(fields) = &mut raw {
                fields
                    .entry("hostname".to_string())
                    .or_insert_with(|| Value::String(name.clone()));
            }
            let parsed = serde_json::from_value::<HostSpec>(raw)
                .map_err(|e| JohannError::validation(e.to_string()))
                .and_then(|spec| Host::from_spec(spec, config));
            match parsed {
                Ok(host) => valid.push(host),
                Err(e) => {
                    let msg = format!("invalid host data provided ({}): {}", name, e);
                    warn!("{}", msg);
                    errors.push(msg);
                }
            }
        }
        if !errors.is_empty() && !allow_invalid {
            return (false, errors, Vec::new());
        }

        let mut applied = Vec::new();
        for host in valid {
            let name = host.name.clone();
            match self.get(&name) {
                Some(existing) => {
                    let mut existing = existing.lock();
                    existing.copy_from(&host, config);
                    debug!("updated host '{}'", name);
                }
                None => {
                    self.get_or_insert(host);
                    debug!("added host '{}'", name);
                }
            }
            applied.push(name);
        }
        (errors.is_empty(), errors, applied)
    }
}
