//! Editor round-trip for config objects.

use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;
use serde_json::Value;
use std::io::Write;
use tokio::process::Command;
use tracing::{debug, info};

/// Format a config is shown in while being edited.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum EditFormat {
    Yaml,
    Json,
}

impl EditFormat {
    fn suffix(self) -> &'static str {
        match self {
            EditFormat::Yaml => ".yml",
            EditFormat::Json => ".json",
        }
    }

    /// Serialize `document` for editing.
    pub fn render(self, document: &Value) -> Result<String> {
        Ok(match self {
            EditFormat::Yaml => serde_yaml_ng::to_string(document)?,
            EditFormat::Json => serde_json::to_string_pretty(document)? + "\n",
        })
    }

    /// Parse edited text; the result must be a mapping.
    pub fn parse(self, text: &str) -> Result<Value> {
        let parsed: Value = match self {
            EditFormat::Yaml => serde_yaml_ng::from_str(text).map_err(|e| anyhow!(e.to_string())),
            EditFormat::Json => serde_json::from_str(text).map_err(|e| anyhow!(e.to_string())),
        }
        .map_err(|e| anyhow!("Invalid content, nothing will be saved: {}", e))?;

        if !parsed.is_object() {
            bail!("Config must be a mapping, nothing will be saved");
        }
        Ok(parsed)
    }
}

/// Editor command from `$VISUAL`, then `$EDITOR`, then `vi`.
pub fn editor_command() -> String {
    ["VISUAL", "EDITOR"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "vi".to_string())
}

/// Let the user edit `document`.
///
/// Returns `None` when the content is left unchanged.
pub async fn edit(document: &Value, format: EditFormat) -> Result<Option<Value>> {
    let mut file = tempfile::Builder::new()
        .prefix("s3vault-")
        .suffix(format.suffix())
        .tempfile()
        .context("Unable to create temporary file")?;
    file.write_all(format.render(document)?.as_bytes())?;
    file.flush()?;

    let editor = editor_command();
    let mut parts = editor.split_whitespace();
    let program = parts.next().unwrap_or("vi");
    debug!("Opening {} with {}", file.path().display(), editor);
    let status = Command::new(program)
        .args(parts)
        .arg(file.path())
        .status()
        .await
        .with_context(|| format!("Unable to run editor {}", editor))?;
    if !status.success() {
        bail!("Editor {} exited with {}, nothing will be saved", editor, status);
    }

    let text = tokio::fs::read_to_string(file.path()).await?;
    let edited = format.parse(&text)?;
    if &edited == document {
        info!("Config left unmodified.");
        return Ok(None);
    }
    Ok(Some(edited))
}
