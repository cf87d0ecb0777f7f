// src/core/extract.rs — JSON candidate discovery and schema validation
//
// The model may wrap its JSON in prose, code fences, or several attempts.
// We scan for decodable objects, validate them in discovery order, and
// when nothing validates we re-run the strict whole-text path so the
// surfaced error carries the most specific schema violation.

use std::collections::BTreeMap;
use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::infra::errors::{RllmError, SchemaViolation};

/// Which schema a validation failure should be attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Input,
    Output,
}

/// Validate `instance` against `schema`, delegating to the `jsonschema`
/// crate. The first violation is surfaced with its instance and schema
/// paths.
pub fn validate_instance(instance: &Value, schema: &Value, phase: Phase) -> Result<(), RllmError> {
    let validator = jsonschema::validator_for(schema).map_err(|e| RllmError::Precondition {
        message: format!(
            "{} is not a valid JSON Schema: {e}",
            match phase {
                Phase::Input => "input_schema",
                Phase::Output => "output_schema",
            }
        ),
        details: Value::Null,
    })?;

    if validator.is_valid(instance) {
        return Ok(());
    }

    let violation = validator
        .iter_errors(instance)
        .next()
        .map(|err| SchemaViolation {
            instance_path: err.instance_path().to_string(),
            schema_path: err.schema_path().to_string(),
            reason: err.to_string(),
        })
        .unwrap_or_else(|| SchemaViolation {
            instance_path: String::new(),
            schema_path: String::new(),
            reason: "instance does not satisfy schema".to_string(),
        });

    Err(match phase {
        Phase::Input => RllmError::InputSchema {
            violation,
            schema: schema.clone(),
            payload: instance.clone(),
        },
        Phase::Output => RllmError::OutputSchema {
            violation,
            schema: schema.clone(),
            payload: instance.clone(),
        },
    })
}

/// Discover JSON object candidates in raw model text.
///
/// At every `{` position a forgiving decode consumes exactly one JSON
/// value; object results are collected, deduplicated by canonical
/// sorted-key serialization, first-seen order preserved.
pub fn candidates(text: &str) -> Vec<Map<String, Value>> {
    let stripped = text.trim();
    let mut out: Vec<Map<String, Value>> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for (idx, ch) in stripped.char_indices() {
        if ch != '{' {
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&stripped[idx..]).into_iter::<Value>();
        if let Some(Ok(Value::Object(map))) = stream.next() {
            let key = canonical(&Value::Object(map.clone()));
            if seen.insert(key) {
                out.push(map);
            }
        }
    }
    out
}

/// Strict whole-text parse: the trimmed text must be a single JSON value
/// with a top-level object. On a parse failure we still salvage the first
/// decodable value from any `{` position before giving up, so that prose
/// wrappers produce the more specific "must be an object" error when the
/// embedded value is not an object.
pub fn parse_payload(text: &str) -> Result<Map<String, Value>, RllmError> {
    let stripped = text.trim();
    match serde_json::from_str::<Value>(stripped) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(RllmError::NotAnObject {
            actual: json_type_name(&other),
            payload: other,
        }),
        Err(parse_err) => {
            for (idx, ch) in stripped.char_indices() {
                if ch != '{' {
                    continue;
                }
                let mut stream =
                    serde_json::Deserializer::from_str(&stripped[idx..]).into_iter::<Value>();
                match stream.next() {
                    Some(Ok(Value::Object(map))) => return Ok(map),
                    Some(Ok(other)) => {
                        return Err(RllmError::NotAnObject {
                            actual: json_type_name(&other),
                            payload: other,
                        });
                    }
                    _ => continue,
                }
            }
            Err(RllmError::NotJson {
                reason: parse_err.to_string(),
                payload: stripped.to_string(),
            })
        }
    }
}

/// Return the single best schema-valid object in `text`.
///
/// Candidates are validated in discovery order and the first match wins.
/// When none validates, the strict path runs again so the error carries
/// the most specific violation instead of "no candidate matched".
pub fn extract_validated(text: &str, output_schema: &Value) -> Result<Map<String, Value>, RllmError> {
    let found = candidates(text);

    if found.is_empty() {
        let obj = parse_payload(text)?;
        validate_instance(&Value::Object(obj.clone()), output_schema, Phase::Output)?;
        return Ok(obj);
    }

    tracing::debug!(candidates = found.len(), "validating JSON candidates");
    for candidate in found {
        let value = Value::Object(candidate);
        if validate_instance(&value, output_schema, Phase::Output).is_ok() {
            if let Value::Object(map) = value {
                return Ok(map);
            }
        }
    }

    // No candidate validated; surface the strict path's diagnostics.
    let obj = parse_payload(text)?;
    validate_instance(&Value::Object(obj.clone()), output_schema, Phase::Output)?;
    Ok(obj)
}

/// Canonical (sorted-key) serialization used for deduplication.
fn canonical(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, sort(v))).collect();
                serde_json::to_value(sorted).unwrap_or(Value::Null)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(value).to_string()
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
