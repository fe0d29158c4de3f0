//! Inter-step reference resolution.
//!
//! Step inputs may carry `${ref:<step_id>.<path>}` tokens that point into the
//! output of a completed step. Resolution is a pure function over the input
//! value and the completed outputs:
//!
//! - a string that is exactly one token is replaced by the referenced value
//!   with its JSON type preserved;
//! - a token embedded in a longer string is interpolated as text;
//! - `path` is dot-separated, numeric segments index into arrays, and an
//!   empty path (`${ref:step-1}`) selects the whole output.

use std::collections::{BTreeSet, HashMap};

use serde_json::{Map, Value};
use thiserror::Error;

const TOKEN_OPEN: &str = "${ref:";
const TOKEN_CLOSE: char = '}';

/// A reference that cannot be satisfied from the completed outputs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("unresolved reference '{token}': step '{step_id}' has no completed output")]
    MissingStep { token: String, step_id: String },

    #[error("unresolved reference '{token}': path '{path}' not found in output of step '{step_id}'")]
    MissingPath {
        token: String,
        step_id: String,
        path: String,
    },

    #[error("malformed reference in '{0}'")]
    Malformed(String),
}

/// A parsed `${ref:step.path}` token.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Reference<'a> {
    token: &'a str,
    step_id: &'a str,
    path: &'a str,
}

/// Split a token body (`step.path`) into its step id and path.
fn parse_body<'a>(token: &'a str, body: &'a str) -> Result<Reference<'a>, ResolveError> {
    let (step_id, path) = body.split_once('.').unwrap_or((body, ""));
    if step_id.is_empty() {
        return Err(ResolveError::Malformed(token.to_string()));
    }
    Ok(Reference {
        token,
        step_id,
        path,
    })
}

/// Find the next token at or after `from`. Returns `(start, end, reference)`
/// with `end` exclusive.
fn next_token(s: &str, from: usize) -> Result<Option<(usize, usize, Reference<'_>)>, ResolveError> {
    let Some(offset) = s[from..].find(TOKEN_OPEN) else {
        return Ok(None);
    };
    let start = from + offset;
    let body_start = start + TOKEN_OPEN.len();
    let Some(close) = s[body_start..].find(TOKEN_CLOSE) else {
        return Err(ResolveError::Malformed(s.to_string()));
    };
    let end = body_start + close + 1;
    let reference = parse_body(&s[start..end], &s[body_start..end - 1])?;
    Ok(Some((start, end, reference)))
}

fn lookup(reference: &Reference<'_>, completed: &HashMap<String, Value>) -> Result<Value, ResolveError> {
    let data = completed
        .get(reference.step_id)
        .ok_or_else(|| ResolveError::MissingStep {
            token: reference.token.to_string(),
            step_id: reference.step_id.to_string(),
        })?;

    let missing = || ResolveError::MissingPath {
        token: reference.token.to_string(),
        step_id: reference.step_id.to_string(),
        path: reference.path.to_string(),
    };

    let mut current = data;
    if !reference.path.is_empty() {
        for segment in reference.path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment).ok_or_else(missing)?,
                Value::Array(items) => segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get(i))
                    .ok_or_else(missing)?,
                _ => return Err(missing()),
            };
        }
    }
    Ok(current.clone())
}

fn resolve_str(s: &str, completed: &HashMap<String, Value>) -> Result<Value, ResolveError> {
    let Some((start, end, reference)) = next_token(s, 0)? else {
        return Ok(Value::String(s.to_string()));
    };

    // Whole-string token keeps the referenced value's type.
    if start == 0 && end == s.len() {
        return lookup(&reference, completed);
    }

    let mut out = String::with_capacity(s.len());
    out.push_str(&s[..start]);
    out.push_str(&value_to_string(&lookup(&reference, completed)?));
    let mut cursor = end;
    while let Some((start, end, reference)) = next_token(s, cursor)? {
        out.push_str(&s[cursor..start]);
        out.push_str(&value_to_string(&lookup(&reference, completed)?));
        cursor = end;
    }
    out.push_str(&s[cursor..]);
    Ok(Value::String(out))
}

/// Resolve every reference token in `value` against completed step outputs
/// (step id to the step's response `data`).
pub fn resolve_references(value: &Value, completed: &HashMap<String, Value>) -> Result<Value, ResolveError> {
    match value {
        Value::String(s) => resolve_str(s, completed),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_references(item, completed))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_references(item, completed)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

/// Step ids referenced anywhere inside `value`.
pub fn referenced_steps(value: &Value) -> Result<BTreeSet<String>, ResolveError> {
    let mut steps = BTreeSet::new();
    collect_refs(value, &mut steps)?;
    Ok(steps)
}

fn collect_refs(value: &Value, steps: &mut BTreeSet<String>) -> Result<(), ResolveError> {
    match value {
        Value::String(s) => {
            let mut cursor = 0;
            while let Some((_, end, reference)) = next_token(s, cursor)? {
                steps.insert(reference.step_id.to_string());
                cursor = end;
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_refs(item, steps)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_refs(item, steps)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Render a JSON value as interpolation text.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Objects and arrays interpolate as compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
