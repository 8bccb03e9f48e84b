use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{JohannError, JohannResult};

/// Results a score has stored for later measures, keyed by `store_as`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoredData {
    entries: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedData {
    pub message: Option<String>,
    pub data: Value,
}

impl StoredData {
    pub fn new() -> Self {
        StoredData::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.entries.clone())
    }

    /// Stores `results` under `key`, or under `key[player]` when a player is
    /// given. Overwrites with a different value are logged.
    pub fn store(&mut self, key: &str, player: Option<&str>, results: Value, log_prefix: &str) {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));

        match player {
            Some(player) => {
                if !entry.is_object() {
                    *entry = Value::Object(Map::new());
                }
                if let Value::Object(by_player) = entry {
                    if let Some(previous) = by_player.get(player) {
                        if previous != &results {
                            info!(
                                "{}| Overwriting stored data key {}[{}]. Previous value: {}",
                                log_prefix, key, player, previous
                            );
                        }
                    }
                    debug!("{}| Stored {}[{}]: {}", log_prefix, key, player, results);
                    by_player.insert(player.to_string(), results);
                }
            }
            None => {
                if !is_empty_value(entry) && entry != &results {
                    info!(
                        "{}| Overwriting stored data key {}. Previous value: {}",
                        log_prefix, key, entry
                    );
                }
                debug!("{}| Stored {}: {}", log_prefix, key, results);
                *entry = results;
            }
        }
    }

    /// Four-level lookup: key, then player (exact names only), then host and
    /// value levels, which also accept a decimal position into a list or into
    /// a map's values in insertion order when no literal key matches.
    pub fn fetch(
        &self,
        key: Option<&str>,
        subkey: Option<&str>,
        subsubkey: Option<&str>,
        subsubsubkey: Option<&str>,
    ) -> JohannResult<FetchedData> {
        let Some(key) = non_empty(key) else {
            return Ok(FetchedData {
                message: None,
                data: self.to_value(),
            });
        };
        let data = self
            .entries
            .get(key)
            .ok_or_else(|| JohannError::validation(format!("failed to fetch stored data key {}", key)))?;

        let Some(subkey) = non_empty(subkey) else {
            return Ok(fetched(key, data));
        };
        let data = data
            .as_object()
            .and_then(|by_player| by_player.get(subkey))
            .ok_or_else(|| {
                JohannError::validation(format!(
                    "failed to fetch data subkey {} from stored data at {}",
                    subkey, key
                ))
            })?;

        let at = format!("{}.{}", key, subkey);
        let Some(subsubkey) = non_empty(subsubkey) else {
            return Ok(fetched(&at, data));
        };
        let data = descend(data, subsubkey, &at)?;

        let at = format!("{}.{}", at, subsubkey);
        let Some(subsubsubkey) = non_empty(subsubsubkey) else {
            return Ok(fetched(&at, &data));
        };
        let data = descend(&data, subsubsubkey, &at)?;
        Ok(fetched(&format!("{}.{}", at, subsubsubkey), &data))
    }
}

fn non_empty(token: Option<&str>) -> Option<&str> {
    token.filter(|t| !t.is_empty())
}

fn fetched(path: &str, data: &Value) -> FetchedData {
    FetchedData {
        message: Some(format!("fetched stored data key {} as {}", path, data)),
        data: data.clone(),
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn descend(data: &Value, token: &str, at: &str) -> JohannResult<Value> {
    let missing = || {
        JohannError::validation(format!(
            "failed to fetch data subkey {} from stored data at {}",
            token, at
        ))
    };
    let out_of_bounds = || {
        JohannError::validation(format!(
            "failed to fetch data subkey {} from stored data at {} (index out of bounds)",
            token, at
        ))
    };
    let position = token
        .chars()
        .all(|c| c.is_ascii_digit())
        .then(|| token.parse::<usize>().ok())
        .flatten();

    match data {
        Value::Object(map) => {
            if let Some(value) = map.get(token) {
                return Ok(value.clone());
            }
            let index = position.ok_or_else(missing)?;
            map.values().nth(index).cloned().ok_or_else(out_of_bounds)
        }
        Value::Array(items) => {
            let index = position.ok_or_else(missing)?;
            items.get(index).cloned().ok_or_else(out_of_bounds)
        }
        _ => Err(JohannError::validation(format!(
            "failed to fetch data subkey {} from stored data at {} (data not iterable)",
            token, at
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> StoredData {
        let mut stored = StoredData::new();
        stored.store("r", Some("p1"), json!({"h1": 10, "h2": [1, 2, 3]}), "test");
        stored.store("single", None, json!({"a": 1}), "test");
        stored
    }

    #[test]
    fn fetch_without_key_returns_everything() {
        let stored = sample();
        let all = stored.fetch(None, None, None, None).expect("all");
        assert_eq!(all.data, stored.to_value());
        assert!(all.message.is_none());
    }

    #[test]
    fn stored_player_results_round_trip() {
        let stored = sample();
        let fetched = stored.fetch(Some("r"), Some("p1"), None, None).expect("p1");
        assert_eq!(fetched.data, json!({"h1": 10, "h2": [1, 2, 3]}));
        assert!(fetched.message.expect("message").contains("r.p1"));
        let singleton = stored.fetch(Some("single"), None, None, None).expect("single");
        assert_eq!(singleton.data, json!({"a": 1}));
    }

    #[test]
    fn host_level_accepts_name_or_position() {
        let stored = sample();
        let by_name = stored.fetch(Some("r"), Some("p1"), Some("h1"), None).expect("h1");
        assert_eq!(by_name.data, json!(10));
        let by_index = stored.fetch(Some("r"), Some("p1"), Some("0"), None).expect("index 0");
        assert_eq!(by_index.data, json!(10));
        let nested = stored
            .fetch(Some("r"), Some("p1"), Some("h2"), Some("2"))
            .expect("nested index");
        assert_eq!(nested.data, json!(3));
    }

    #[test]
    fn literal_key_wins_over_position() {
        let mut stored = StoredData::new();
        stored.store("r", Some("p1"), json!({"h1": "first", "1": "literal"}), "test");
        let fetched = stored.fetch(Some("r"), Some("p1"), Some("1"), None).expect("literal");
        assert_eq!(fetched.data, json!("literal"));
    }

    #[test]
    fn fetch_failures_are_client_errors() {
        let stored = sample();
        let err = stored.fetch(Some("nope"), None, None, None).expect_err("missing key");
        assert_eq!(err.status_code(), 400);
        assert!(err.to_string().contains("failed to fetch stored data key nope"));

        let err = stored.fetch(Some("r"), Some("0"), None, None).expect_err("no positional player");
        assert!(err.to_string().contains("subkey 0"));

        let err = stored.fetch(Some("r"), Some("p1"), Some("9"), None).expect_err("oob");
        assert!(err.to_string().contains("index out of bounds"));

        let err = stored
            .fetch(Some("r"), Some("p1"), Some("h1"), Some("x"))
            .expect_err("scalar");
        assert!(err.to_string().contains("data not iterable"));
    }

    #[test]
    fn singleton_store_replaces_value() {
        let mut stored = StoredData::new();
        stored.store("k", None, json!(1), "test");
        stored.store("k", None, json!(2), "test");
        assert_eq!(stored.get("k"), Some(&json!(2)));
    }

    #[test]
    fn player_store_keeps_other_players() {
        let mut stored = StoredData::new();
        stored.store("k", Some("p1"), json!({"h": 1}), "test");
        stored.store("k", Some("p2"), json!({"h": 2}), "test");
        stored.store("k", Some("p1"), json!({"h": 3}), "test");
        assert_eq!(stored.get("k"), Some(&json!({"p1": {"h": 3}, "p2": {"h": 2}})));
    }
}
