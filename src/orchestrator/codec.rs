//! Typed argument encoding and allow-list enforcement.
//!
//! Arguments are JSON values. A value that stands for a concrete domain type
//! is wrapped as `{"$type": "<name>", "$value": <payload>}`. When a block is
//! recorded, every type name reachable from its arguments and code becomes
//! the block's allow-list; at execution time nothing outside that list is
//! decoded.

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::models::block::{BlockCode, BlockParams};
use crate::{AppError, Result};

/// Key carrying the type name of a typed value.
pub const TYPE_KEY: &str = "$type";

/// Key carrying the payload of a typed value.
pub const VALUE_KEY: &str = "$value";

/// Wrap `value` as a typed argument named `type_name`.
///
/// # Errors
///
/// Returns `AppError::Serialization` if `value` cannot be encoded.
pub fn typed<T: Serialize>(type_name: &str, value: &T) -> Result<Value> {
    Ok(json!({ TYPE_KEY: type_name, VALUE_KEY: serde_json::to_value(value)? }))
}

/// Decode a typed argument, checking its type name.
///
/// # Errors
///
/// Returns `AppError::Serialization` if `value` is not a typed value of
/// `type_name` or its payload does not decode into `T`.
pub fn untyped<T: DeserializeOwned>(value: &Value, type_name: &str) -> Result<T> {
    match type_of(value) {
        Some(found) if found == type_name => {
            let payload = value.get(VALUE_KEY).cloned().unwrap_or(Value::Null);
            Ok(serde_json::from_value(payload)?)
        }
        Some(found) => Err(AppError::Serialization(format!(
            "expected {type_name}, found {found}"
        ))),
        None => Err(AppError::Serialization(format!(
            "expected {type_name}, found untyped value"
        ))),
    }
}

fn type_of(value: &Value) -> Option<&str> {
    value.as_object()?.get(TYPE_KEY)?.as_str()
}

fn walk<'a>(value: &'a Value, found: &mut Vec<&'a str>) {
    match value {
        Value::Object(map) => {
            if let Some(name) = map.get(TYPE_KEY).and_then(Value::as_str) {
                found.push(name);
            }
            for child in map.values() {
                walk(child, found);
            }
        }
        Value::Array(items) => {
            for child in items {
                walk(child, found);
            }
        }
        _ => {}
    }
}

/// Type names reachable from `values`.
#[must_use]
pub fn collect_types<'a>(values: impl IntoIterator<Item = &'a Value>) -> BTreeSet<String> {
    let mut found = Vec::new();
    for value in values {
        walk(value, &mut found);
    }
    found.into_iter().map(str::to_owned).collect()
}

/// Type names a block's code needs at decode time.
#[must_use]
pub fn code_types(code: &BlockCode) -> BTreeSet<String> {
    match code {
        BlockCode::Closure { .. } => BTreeSet::new(),
        BlockCode::Invokable { type_name, state } => {
            let mut types = collect_types([state]);
            types.insert(type_name.clone());
            types
        }
        BlockCode::ClassName { class } => BTreeSet::from([class.clone()]),
    }
}

fn ensure_allowed(value: &Value, allowed: &[String]) -> Result<()> {
    let mut found = Vec::new();
    walk(value, &mut found);
    match found.into_iter().find(|name| !allowed.iter().any(|a| a == name)) {
        Some(name) => Err(AppError::Disallowed(name.to_owned())),
        None => Ok(()),
    }
}

/// Validate the argument rows of `params` against its allow-list and return
/// one argument vector per invocation: the base arguments alone, or the base
/// arguments followed by each dataset row.
///
/// # Errors
///
/// Returns `AppError::Disallowed` if any argument references a type that is
/// not allow-listed.
pub fn decode_invocations(params: &BlockParams) -> Result<Vec<Vec<Value>>> {
    for value in params.args.iter().chain(params.dataset.iter().flatten()) {
        ensure_allowed(value, &params.allowed_types)?;
    }

    if params.dataset.is_empty() {
        return Ok(vec![params.args.clone()]);
    }
    Ok(params
        .dataset
        .iter()
        .map(|row| params.args.iter().chain(row).cloned().collect())
        .collect())
}

/// Validate `code` against the allow-list.
///
/// # Errors
///
/// Returns `AppError::Disallowed` if the code names a type outside `allowed`.
pub fn decode_code(code: &BlockCode, allowed: &[String]) -> Result<()> {
    match code_types(code)
        .into_iter()
        .find(|name| !allowed.iter().any(|a| a == name))
    {
        Some(name) => Err(AppError::Disallowed(name)),
        None => Ok(()),
    }
}
