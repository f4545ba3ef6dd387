//! Template rendering against the objects of a vault scope.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tera::{Context, Tera};
use tracing::{debug, info};

use crate::store::ObjectStore;
use s3vault_common::{Error, Result};

/// Renders templates with every vault object exposed by name.
///
/// A template made of a single `{{ name }}` expression, with no filter and
/// naming an existing object, is not rendered at all: the object content is
/// returned byte for byte so that binary payloads survive.
pub struct TemplateRenderer {
    tera: Tera,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    /// Create a renderer with the serialization filters registered.
    pub fn new() -> Self {
        let mut tera = Tera::default();
        tera.register_filter("to_json", to_json_filter);
        tera.register_filter("to_nice_json", to_nice_json_filter);
        tera.register_filter("to_yaml", to_yaml_filter);
        tera.register_filter("b64encode", b64encode_filter);
        tera.register_filter("b64decode", b64decode_filter);
        Self { tera }
    }

    /// Object name a raw-copy template refers to, if the template is one.
    pub fn raw_copy_source(template: &str) -> Option<&str> {
        let inner = template
            .trim()
            .strip_prefix("{{")?
            .strip_suffix("}}")?;
        if inner.contains('|') {
            return None;
        }
        Some(inner.trim()).filter(|name| !name.is_empty())
    }

    /// Render `template` against the objects of `store` plus `extra`.
    ///
    /// Caller variables take precedence over objects of the same name.
    pub async fn render(
        &mut self,
        template: &str,
        store: &mut ObjectStore,
        extra: &Map<String, Value>,
    ) -> Result<Vec<u8>> {
        if let Some(source) = Self::raw_copy_source(template) {
            if store.contains(source).await? {
                info!("Template is a raw copy of {}", source);
                let object = store.get_object(source).await?;
                return Ok(object.raw().await?.to_vec());
            }
        }

        let mut context = Context::new();
        let objects = store.objects().await?;
        for object in objects.iter_mut() {
            let value = template_value(object.raw().await?);
            context.insert(object.name(), &value);
        }
        for (name, value) in extra {
            context.insert(name.as_str(), value);
        }
        debug!(
            "Rendering template with {} objects and {} extra variables",
            objects.len(),
            extra.len()
        );

        self.tera
            .render_str(template, &context)
            .map(String::into_bytes)
            .map_err(|e| Error::Template(describe_tera_error(&e)))
    }
}

/// Structured content is exposed as a structure, anything else as text.
fn template_value(raw: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(raw) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => value,
        _ => Value::String(String::from_utf8_lossy(raw).into_owned()),
    }
}

fn describe_tera_error(error: &tera::Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn to_json_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    serde_json::to_string(value)
        .map(Value::String)
        .map_err(|e| tera::Error::msg(format!("to_json: {}", e)))
}

fn to_nice_json_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    serde_json::to_string_pretty(value)
        .map(Value::String)
        .map_err(|e| tera::Error::msg(format!("to_nice_json: {}", e)))
}

fn to_yaml_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    serde_yaml_ng::to_string(value)
        .map(Value::String)
        .map_err(|e| tera::Error::msg(format!("to_yaml: {}", e)))
}

fn b64encode_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let text = value
        .as_str()
        .ok_or_else(|| tera::Error::msg("b64encode: expected a string"))?;
    Ok(Value::String(STANDARD.encode(text)))
}

fn b64decode_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let text = value
        .as_str()
        .ok_or_else(|| tera::Error::msg("b64decode: expected a string"))?;
    let decoded = STANDARD
        .decode(text.trim())
        .map_err(|e| tera::Error::msg(format!("b64decode: {}", e)))?;
    String::from_utf8(decoded)
        .map(Value::String)
        .map_err(|e| tera::Error::msg(format!("b64decode: {}", e)))
}
