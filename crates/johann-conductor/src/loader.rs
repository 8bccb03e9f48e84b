use jsonschema::JSONSchema;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{JohannError, JohannResult};
use crate::measure::Measure;
use crate::player::Player;
use crate::score::{Score, TUNE_ORCHESTRA};
use crate::task::TaskRegistry;

const SCORE_SCHEMA: &str = include_str!("../schemas/score_v1.jsonschema");

/// A score file as written, before semantic checks.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoreFile {
    pub name: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default = "default_version", deserialize_with = "version_string")]
    pub version: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub create_hosts: bool,
    #[serde(default)]
    pub discard_hosts: bool,
    pub players: BTreeMap<String, Player>,
    pub measures: Vec<Measure>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_category() -> String {
    "none".to_string()
}

/// YAML reads `version: 1.0` as a number.
fn version_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

/// What the loader needs to know about the conductor it loads for.
pub struct LoadContext<'a> {
    pub tasks: &'a TaskRegistry,
    pub allhosts_player_name: &'a str,
    /// Names of scores already registered.
    pub taken: &'a BTreeSet<String>,
}

fn schema_errors(json_value: &Value) -> JohannResult<()> {
    let schema_json: Value = serde_json::from_str(SCORE_SCHEMA)
        .map_err(|e| JohannError::Internal(anyhow::anyhow!("score schema is not valid JSON: {}", e)))?;
    let schema = JSONSchema::compile(&schema_json)
        .map_err(|e| JohannError::Internal(anyhow::anyhow!("score schema failed to compile: {}", e)))?;
    if let Err(errors) = schema.validate(json_value) {
        let mut msgs = Vec::new();
        for e in errors {
            msgs.push(format!("{} (at '{}')", e, e.instance_path));
        }
        return Err(JohannError::validation(msgs.join("; ")));
    }
    Ok(())
}

/// Cross-field rules the schema cannot express. Every violation is reported.
pub fn validate_score_file(file: &ScoreFile, ctx: &LoadContext<'_>) -> JohannResult<()> {
    let mut errors = Vec::new();

    if ctx.taken.contains(&file.name) {
        errors.push(format!("There is already a score with name '{}'", file.name));
    }
    for (key, player) in &file.players {
        if *key != player.name {
            errors.push(format!(
                "player key '{}' does not match player name '{}'",
                key, player.name
            ));
        }
        if player.name == ctx.allhosts_player_name {
            errors.push(format!("player name '{}' is reserved", player.name));
        }
    }

    let names: Vec<&str> = file.measures.iter().map(|m| m.name.as_str()).collect();
    let unique: BTreeSet<&str> = names.iter().copied().collect();
    if unique.len() != names.len() {
        errors.push("Duplicate measure name(s)".to_string());
    }
    if unique.contains(TUNE_ORCHESTRA) {
        errors.push(format!("measure name '{}' is reserved", TUNE_ORCHESTRA));
    }

    let mut bad_deps = Vec::new();
    for measure in &file.measures {
        let name = &measure.name;
        for player in &measure.player_names {
            if !file.players.contains_key(player) {
                errors.push(format!("Unrecognized player '{}' in measure '{}'", player, name));
            }
        }
        if measure.depends_on.iter().any(|d| d == name) {
            errors.push(format!("measure '{}': You cannot depend on yourself", name));
        }
        bad_deps.extend(
            measure
                .depends_on
                .iter()
                .filter(|d| !unique.contains(d.as_str()))
                .cloned(),
        );
        if let Some(delay) = &measure.start_delay {
            if let Err(e) = delay.validate() {
                errors.push(format!("measure '{}': {}", name, e));
            }
        }
        if measure.start_delay.is_none() && measure.depends_on.is_empty() {
            errors.push(format!(
                "measure '{}': Input data must specify one or both of 'start_delay' and 'depends_on'",
                name
            ));
        }
        if measure.store_interim_results && measure.store_as.is_none() {
            errors.push(format!(
                "measure '{}': 'store_as' must be specified if 'store_interim_results' is True",
                name
            ));
        }
        if measure.store_singleton {
            if measure.store_as.is_none() {
                errors.push(format!(
                    "measure '{}': 'store_as' must be specified if 'store_singleton' is True",
                    name
                ));
            }
            if measure.player_names.len() > 1 {
                warn!(
                    "measure '{}': 'store_singleton' with more than one player will likely cause data loss",
                    name
                );
            }
        }
        if !ctx.tasks.contains(&measure.task_name) {
            errors.push(format!("measure '{}': unrecognized task '{}'", name, measure.task_name));
        }
    }
    if !bad_deps.is_empty() {
        errors.push(format!("Invalid values for depends_on: {:?}", bad_deps));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(JohannError::validation(errors.join("; ")))
    }
}

/// Parses, schema-checks and validates a score. `file_name` is used when the
/// file does not carry its own.
pub fn load_score_str(raw_yaml: &str, file_name: &str, ctx: &LoadContext<'_>) -> JohannResult<(Score, Value)> {
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(raw_yaml)
        .map_err(|e| JohannError::validation(format!("score '{}' YAML failed to parse: {}", file_name, e)))?;
    let json_value: Value = serde_json::to_value(yaml_value)
        .map_err(|e| JohannError::validation(format!("score '{}' is not representable as JSON: {}", file_name, e)))?;
    schema_errors(&json_value).map_err(|e| match e {
        JohannError::Validation(msg) => {
            JohannError::validation(format!("score '{}' failed validation: {}", file_name, msg))
        }
        other => other,
    })?;
    let file: ScoreFile = serde_json::from_value(json_value.clone())
        .map_err(|e| JohannError::validation(format!("score '{}' failed validation: {}", file_name, e)))?;
    validate_score_file(&file, ctx)
        .map_err(|e| JohannError::validation(format!("score '{}' failed validation: {}", file_name, e)))?;

    let ScoreFile {
        name,
        file_name: declared,
        version,
        category,
        description,
        create_hosts,
        discard_hosts,
        players,
        measures,
    } = file;
    let mut score = Score::new(&name, players.into_values().collect(), measures);
    score.file_name = declared.unwrap_or_else(|| file_name.to_string());
    score.version = version;
    score.category = category;
    score.description = description;
    score.create_hosts = create_hosts;
    score.discard_hosts = discard_hosts;
    debug!("read score '{}' from {}", score.name, score.file_name);
    Ok((score, json_value))
}

pub fn load_score_file(path: &Path, ctx: &LoadContext<'_>) -> JohannResult<(Score, Value)> {
    let raw = fs::read_to_string(path).map_err(|e| {
        JohannError::Internal(anyhow::anyhow!("failed to read score '{}': {}", path.display(), e))
    })?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    load_score_str(&raw, &file_name, ctx)
}
