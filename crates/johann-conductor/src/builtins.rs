use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::bundle::CodeVersion;
use crate::config::JohannConfig;
use crate::host::HostRegistry;
use crate::host_control::HostControlRegistry;
use crate::task::{TaskContext, TaskHandler, TaskRegistry, SELECT_RANDOM_TASK, TUNE_HOST_TASK};
use crate::tuning::TuneHostTask;

/// Answers with the code version this process runs.
pub struct RemoteCodehashTask {
    codehash: String,
}

impl RemoteCodehashTask {
    pub fn new(codehash: &str) -> Self {
        RemoteCodehashTask {
            codehash: codehash.to_string(),
        }
    }
}

#[async_trait]
impl TaskHandler for RemoteCodehashTask {
    async fn run(&self, _ctx: TaskContext, _args: Vec<Value>, _kwargs: Map<String, Value>) -> Result<Value> {
        Ok(json!(self.codehash))
    }
}

/// Picks `num_select` distinct items from a list, or from a mapping's values.
/// The result maps selection order to item.
pub struct SelectRandomTask;

pub fn select_random(prefix: &str, select_from: &Value, num_select: usize) -> Result<Value> {
    let pool: Vec<&Value> = match select_from {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => map.values().collect(),
        other => return Err(anyhow!("{}: cannot select from {}", prefix, other)),
    };
    let mut order: Vec<usize> = (0..pool.len()).collect();
    order.shuffle(&mut rand::thread_rng());

    let mut chosen: Vec<&Value> = Vec::with_capacity(num_select);
    for index in order {
        if chosen.len() == num_select {
            break;
        }
        if !chosen.contains(&pool[index]) {
            chosen.push(pool[index]);
        }
    }
    if chosen.len() < num_select {
        return Err(anyhow!(
            "{}: less than requested {} unique items to choose from",
            prefix,
            num_select
        ));
    }
    let out: Map<String, Value> = chosen
        .into_iter()
        .enumerate()
        .map(|(i, item)| (i.to_string(), item.clone()))
        .collect();
    Ok(Value::Object(out))
}

#[async_trait]
impl TaskHandler for SelectRandomTask {
    async fn run(&self, ctx: TaskContext, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value> {
        let select_from = kwargs
            .get("select_from")
            .or_else(|| args.first())
            .ok_or_else(|| anyhow!("{}: select_from is required", ctx.description))?;
        let num_select = kwargs
            .get("num_select")
            .or_else(|| args.get(1))
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("{}: num_select must be a non-negative integer", ctx.description))?;
        select_random(&ctx.description, select_from, num_select as usize)
    }
}

/// Task registry with every task the conductor ships.
pub fn builtin_tasks(
    hosts: HostRegistry,
    controls: HostControlRegistry,
    config: Arc<JohannConfig>,
    code: Arc<CodeVersion>,
) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register(
        &config.remote_codehash_task,
        Arc::new(RemoteCodehashTask::new(&code.codehash)),
    );
    registry.register(SELECT_RANDOM_TASK, Arc::new(SelectRandomTask));
    registry.register(
        TUNE_HOST_TASK,
        Arc::new(TuneHostTask::new(hosts, controls, config, code)),
    );
    registry
}
