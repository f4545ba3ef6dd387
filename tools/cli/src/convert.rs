//! Typing of `configset` values.

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde_json::Value;
use std::path::Path;

/// How a property value given on the command line is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ValueType {
    /// Stored as-is.
    String,
    /// Parsed as an integer.
    Int,
    /// Inline YAML or JSON list.
    List,
    /// Inline YAML or JSON mapping.
    Dict,
    /// Path of a YAML file whose document is stored.
    Yaml,
    /// Path of a JSON file whose document is stored.
    Json,
}

fn parse_inline(value: &str) -> Result<Value> {
    serde_yaml_ng::from_str(value).with_context(|| format!("Unable to parse value: {}", value))
}

/// Convert `value` to the JSON value stored for `value_type`.
pub fn convert(value: &str, value_type: ValueType) -> Result<Value> {
    match value_type {
        ValueType::String => Ok(Value::String(value.to_string())),
        ValueType::Int => {
            let number: i64 = value
                .trim()
                .parse()
                .with_context(|| format!("Value {} is not an integer", value))?;
            Ok(Value::from(number))
        }
        ValueType::List => {
            let parsed = parse_inline(value)?;
            if !parsed.is_array() {
                bail!("Value {} is not a list", value);
            }
            Ok(parsed)
        }
        ValueType::Dict => {
            let parsed = parse_inline(value)?;
            if !parsed.is_object() {
                bail!("Value {} is not a dict", value);
            }
            Ok(parsed)
        }
        ValueType::Yaml => {
            let data = read(Path::new(value))?;
            serde_yaml_ng::from_str(&data)
                .with_context(|| format!("Invalid YAML document in {}", value))
        }
        ValueType::Json => {
            let data = read(Path::new(value))?;
            serde_json::from_str(&data).with_context(|| format!("Invalid JSON document in {}", value))
        }
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Unable to read {}", path.display()))
}
