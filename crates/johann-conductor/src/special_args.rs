use rand::Rng;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{JohannError, JohannResult};
use crate::stored::StoredData;

pub const SPECIAL_ARG_PREFIX: &str = "johann.";
pub const SPECIAL_ARG_TYPES: [&str; 2] = ["random", "stored"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecialArg {
    Random { low: u64, high: u64 },
    Stored(StoredPath),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPath {
    pub key: String,
    pub subkey: Option<String>,
    pub subsubkey: Option<String>,
    pub subsubsubkey: Option<String>,
}

impl StoredPath {
    fn from_parts(parts: &[&str]) -> JohannResult<StoredPath> {
        if parts.is_empty() || parts.len() > 4 {
            return Err(JohannError::validation("too many subkeys"));
        }
        let part = |i: usize| parts.get(i).map(|s| s.to_string());
        Ok(StoredPath {
            key: parts[0].to_string(),
            subkey: part(1),
            subsubkey: part(2),
            subsubsubkey: part(3),
        })
    }

    pub fn dotted(&self) -> String {
        let mut out = self.key.clone();
        for part in [&self.subkey, &self.subsubkey, &self.subsubsubkey]
            .into_iter()
            .flatten()
        {
            out.push('.');
            out.push_str(part);
        }
        out
    }

    pub fn fetch_from(&self, stored: &StoredData) -> JohannResult<crate::stored::FetchedData> {
        stored.fetch(
            Some(&self.key),
            self.subkey.as_deref(),
            self.subsubkey.as_deref(),
            self.subsubsubkey.as_deref(),
        )
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// `\w+(-\w+)*`
fn is_key_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .split('-')
            .all(|piece| !piece.is_empty() && piece.chars().all(is_word_char))
}

pub fn is_special_arg(raw: &str) -> bool {
    raw.starts_with(SPECIAL_ARG_PREFIX)
}

pub fn parse_special_arg(raw: &str) -> JohannResult<SpecialArg> {
    let rest = raw
        .strip_prefix(SPECIAL_ARG_PREFIX)
        .ok_or_else(|| JohannError::validation("not a special argument"))?;
    let arg_type: String = rest.chars().take_while(|c| is_word_char(*c)).collect();
    if arg_type.is_empty() {
        return Err(JohannError::validation("not a special argument"));
    }
    if !SPECIAL_ARG_TYPES.contains(&arg_type.as_str()) {
        return Err(JohannError::validation(format!(
            "unrecognized special argument type '{}'",
            arg_type
        )));
    }
    let body = &rest[arg_type.len()..];

    match arg_type.as_str() {
        "stored" => {
            let parts: Vec<&str> = body
                .strip_prefix('.')
                .map(|b| b.split('.').collect())
                .unwrap_or_default();
            if parts.is_empty() || !parts.iter().all(|p| is_key_segment(p)) {
                return Err(JohannError::validation("invalid special argument"));
            }
            Ok(SpecialArg::Stored(StoredPath::from_parts(&parts)?))
        }
        _ => {
            let (low, high) = body
                .strip_prefix('.')
                .and_then(|b| b.split_once('-'))
                .ok_or_else(|| JohannError::validation("invalid special argument"))?;
            let low = parse_bound(low)?;
            let high = parse_bound(high)?;
            if low > high {
                return Err(JohannError::validation(
                    "range's lower bound must be less than its upper bound",
                ));
            }
            Ok(SpecialArg::Random { low, high })
        }
    }
}

fn parse_bound(raw: &str) -> JohannResult<u64> {
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit()) {
        return Err(JohannError::validation("invalid special argument"));
    }
    raw.parse()
        .map_err(|_| JohannError::validation(format!("random bound {} is out of range", raw)))
}

/// A deferred stored reference handed to a remote agent:
/// `johann.stored.<score>.<key>[.<subkey>...]`.
pub fn parse_deferred_stored(raw: &str) -> JohannResult<(String, StoredPath)> {
    let body = raw
        .strip_prefix("johann.stored.")
        .ok_or_else(|| JohannError::validation("not a deferred stored argument"))?;
    let parts: Vec<&str> = body.split('.').collect();
    if parts.len() < 2 || !parts.iter().all(|p| is_key_segment(p)) {
        return Err(JohannError::validation("invalid deferred stored argument"));
    }
    Ok((parts[0].to_string(), StoredPath::from_parts(&parts[1..])?))
}

pub struct ArgContext<'a> {
    pub score_name: &'a str,
    pub lazy_fetch_stored: bool,
    pub stored: &'a StoredData,
    pub log_prefix: &'a str,
}

/// Resolves special arguments anywhere inside `args`, descending into lists
/// and maps. Other values pass through untouched.
pub fn transform_args<R: Rng>(ctx: &ArgContext<'_>, args: &[Value], rng: &mut R) -> JohannResult<Vec<Value>> {
    args.iter().map(|a| transform_value(ctx, a, rng)).collect()
}

pub fn transform_value<R: Rng>(ctx: &ArgContext<'_>, value: &Value, rng: &mut R) -> JohannResult<Value> {
    match value {
        Value::String(s) if is_special_arg(s) => transform_arg(ctx, s, rng),
        Value::Array(items) => Ok(Value::Array(transform_args(ctx, items, rng)?)),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), transform_value(ctx, v, rng)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn transform_arg<R: Rng>(ctx: &ArgContext<'_>, raw: &str, rng: &mut R) -> JohannResult<Value> {
    let parsed = parse_special_arg(raw).map_err(|e| {
        debug!("{}| Failed to transform special argument '{}': {}", ctx.log_prefix, raw, e);
        e
    })?;
    match parsed {
        SpecialArg::Stored(path) => {
            if ctx.lazy_fetch_stored {
                return Ok(Value::String(format!(
                    "johann.stored.{}.{}",
                    ctx.score_name,
                    path.dotted()
                )));
            }
            let fetched = path.fetch_from(ctx.stored)?;
            if let Some(msg) = fetched.message {
                debug!("{}| {}", ctx.log_prefix, msg);
            }
            Ok(fetched.data)
        }
        SpecialArg::Random { low, high } => {
            let drawn = rng.gen_range(low..=high);
            debug!("{}| '{}' randomized to {}", ctx.log_prefix, raw, drawn);
            Ok(Value::from(drawn))
        }
    }
}
