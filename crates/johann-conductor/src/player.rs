use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::JohannConfig;
use crate::host::HostRegistry;
use crate::log_prefix;
use crate::task::{GroupHandle, TaskBroker, TaskSignature};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlayerDef {
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub scale: Option<i64>,
}

/// A named group of hosts that measures are dispatched to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PlayerDef")]
pub struct Player {
    pub name: String,
    pub image: Option<String>,
    #[serde(rename = "hosts")]
    pub hostnames: Vec<String>,
    pub scale: usize,
}

impl From<PlayerDef> for Player {
    fn from(def: PlayerDef) -> Self {
        let scale = match def.scale {
            Some(scale) if scale >= 0 => scale as usize,
            _ => def.hosts.len().max(1),
        };
        Player {
            name: def.name,
            image: def.image,
            hostnames: def.hosts,
            scale,
        }
    }
}

/// Where a dispatched task belongs, keyed by task id in the score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMapEntry {
    pub measure_name: String,
    pub player_name: String,
    pub host_name: String,
}

/// What a player needs from its score and the orchestra to dispatch.
pub struct Dispatch<'a> {
    pub score_name: &'a str,
    pub hosts: &'a HostRegistry,
    pub broker: &'a dyn TaskBroker,
    pub config: &'a JohannConfig,
    pub task_map: &'a mut BTreeMap<String, TaskMapEntry>,
}

impl Player {
    pub fn named(name: &str) -> Self {
        Player::from(PlayerDef {
            name: name.to_string(),
            ..PlayerDef::default()
        })
    }

    /// Applies an update posted for this player. `false` when nothing changed.
    pub fn copy_from(&mut self, other: &Player, score_name: &str) -> bool {
        let prefix = log_prefix(Some(score_name), None, Some(&self.name), None);
        if other.name != self.name {
            warn!("{}| copy_from() called with player '{}'", prefix, other.name);
        }
        let mut changed = false;
        if other.hostnames != self.hostnames {
            debug!("{}| updating hostnames from {:?} to {:?}", prefix, self.hostnames, other.hostnames);
            self.hostnames = other.hostnames.clone();
            changed = true;
        }
        if other.scale != self.scale {
            debug!("{}| updating scale from {} to {}", prefix, self.scale, other.scale);
            self.scale = other.scale;
            changed = true;
        }
        if other.image != self.image {
            debug!("{}| updating image from {:?} to {:?}", prefix, self.image, other.image);
            self.image = other.image.clone();
            changed = true;
        }
        changed
    }

    #[allow(clippy::too_many_arguments)]
    fn local_signature(
        &self,
        dispatch: &Dispatch<'_>,
        measure_name: &str,
        host_dump: Value,
        host_name: &str,
        task_name: &str,
        delay_secs: u64,
        args: Vec<Value>,
    ) -> TaskSignature {
        let description = format!("{}.LOCAL.{}.{}", dispatch.score_name, measure_name, host_name);
        let mut kwargs = Map::new();
        kwargs.insert("target_host".to_string(), host_dump);
        let signature = TaskSignature {
            task_id: Uuid::new_v4().to_string(),
            task_name: task_name.to_string(),
            queue: dispatch.config.conductor_queue_id.clone(),
            description,
            args,
            kwargs,
            countdown_secs: delay_secs,
        };
        trace!("{}| local task signature created for {}", signature.description, task_name);
        signature
    }

    /// Dispatches `task_name` to every host of this player as one group.
    /// Nothing is submitted unless every host resolves.
    pub fn enqueue(
        &self,
        dispatch: &mut Dispatch<'_>,
        measure_name: &str,
        local: bool,
        task_name: &str,
        delay_secs: u64,
        args: &[Value],
    ) -> Result<GroupHandle, String> {
        let prefix = log_prefix(Some(dispatch.score_name), Some(measure_name), Some(&self.name), None);
        let mut signatures = Vec::with_capacity(self.hostnames.len());
        for hostname in &self.hostnames {
            let Some(shared) = dispatch.hosts.get(hostname) else {
                let msg = format!("{} not found in dictionary of hosts", hostname);
                warn!("{}| {}", prefix, msg);
                return Err(msg);
            };
            let host = shared.lock();
            let signature = if local {
                self.local_signature(
                    dispatch,
                    measure_name,
                    host.dump(),
                    &host.name,
                    task_name,
                    delay_secs,
                    args.to_vec(),
                )
            } else {
                if host.pending_create {
                    let msg = format!("{} still pending creation", host.name);
                    warn!("{}| {}", prefix, msg);
                    return Err(msg);
                }
                host.task_signature(
                    dispatch.score_name,
                    &self.name,
                    measure_name,
                    task_name,
                    delay_secs,
                    args.to_vec(),
                    Map::new(),
                )
            };
            signatures.push((hostname.clone(), signature));
        }

        let placed: Vec<(String, String)> = signatures
            .iter()
            .map(|(hostname, signature)| (hostname.clone(), signature.task_id.clone()))
            .collect();
        let signatures = signatures.into_iter().map(|(_, s)| s).collect();
        let handle = dispatch.broker.submit_group(signatures).map_err(|e| {
            let msg = format!("failed to submit task group: {}", e);
            warn!("{}| {}", prefix, msg);
            msg
        })?;

        // bookkeeping only for groups the broker accepted
        for (hostname, task_id) in placed {
            if !local {
                if let Some(shared) = dispatch.hosts.get(&hostname) {
                    let mut host = shared.lock();
                    host.prune_finished_tasks(dispatch.broker);
                    host.active_task_ids.push(task_id.clone());
                }
            }
            dispatch.task_map.insert(
                task_id,
                TaskMapEntry {
                    measure_name: measure_name.to_string(),
                    player_name: self.name.clone(),
                    host_name: hostname,
                },
            );
        }
        Ok(handle)
    }
}
