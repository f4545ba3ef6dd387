//! Command implementations.

use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

use crate::convert::{self, ValueType};
use crate::editor::{self, EditFormat};
use crate::{Cli, Commands, KeyArgs};
use s3vault_common::{RemoteCoordinates, VaultLocation};
use s3vault_config::{PolicyGenerator, VaultConfig, EXAMPLE_CONFIG};
use s3vault_connection::{ConnectionFactory, SessionRequest, TokenFactory};
use s3vault_storage::ObjectMetadata;
use s3vault_vault::{KeySelection, S3Vault};

/// Dispatch the parsed command line.
pub async fn run(cli: Cli) -> Result<()> {
    let creates_session = matches!(cli.command, Commands::Session { .. });
    // A new session is always created from the ambient credentials.
    let token = if creates_session {
        None
    } else {
        TokenFactory::new().ok().and_then(|factory| factory.token())
    };
    let factory = ConnectionFactory::new(cli.disable_instance_context)
        .with_region(cli.region)
        .with_profile(cli.profile)
        .with_token(token);

    match cli.command {
        Commands::Template {
            template,
            dest,
            remote,
        } => cmd_template(&factory, &template, dest.as_deref(), &remote).await,

        Commands::Push { src, remote, keys } => cmd_push(&factory, &src, &remote, &keys).await,

        Commands::Get {
            remote,
            dest,
            metadata,
        } => cmd_get(&factory, &remote, dest.as_deref(), metadata).await,

        Commands::Configset {
            remote,
            key,
            value,
            value_type,
            keys,
        } => cmd_configset(&factory, &remote, &key, &value, value_type, &keys).await,

        Commands::Configget { remote, key } => cmd_configget(&factory, &remote, &key).await,

        Commands::Configedit {
            remote,
            format,
            keys,
        } => cmd_configedit(&factory, &remote, format, &keys).await,

        Commands::Session {
            role_name,
            role_arn,
            external_id,
            no_external_id,
        } => {
            let external_id = if no_external_id {
                None
            } else {
                match external_id {
                    Some(id) => Some(id),
                    None => prompt_external_id()?,
                }
            };
            let request = SessionRequest {
                role_name,
                role_arn,
                external_id,
            };
            cmd_session(&factory, &request).await
        }

        Commands::Init { output } => cmd_init(output.as_deref()),

        Commands::Cloudformation {
            config,
            output,
            lookup_keys,
        } => cmd_cloudformation(&factory, &config, output.as_deref(), lookup_keys).await,
    }
}

fn prompt_external_id() -> Result<Option<String>> {
    let external_id = rpassword::prompt_password("External ID (empty for none): ")
        .context("Failed to read external id")?;
    Ok(Some(external_id).filter(|id| !id.is_empty()))
}

async fn open_vault(factory: &ConnectionFactory, location: VaultLocation) -> Result<S3Vault> {
    let storage = factory
        .object_storage()
        .await
        .context("Unable to connect to S3")?;
    let key_service = factory
        .key_service()
        .await
        .context("Unable to connect to KMS")?;
    let metadata = factory
        .metadata()
        .await
        .context("Unable to read execution context")?;
    Ok(S3Vault::new(location, storage, key_service).with_metadata(metadata))
}

fn parse_remote(remote: &str) -> Result<RemoteCoordinates> {
    RemoteCoordinates::parse(remote).with_context(|| format!("Invalid remote {}", remote))
}

/// Coordinates that must name an object.
fn parse_object(remote: &str) -> Result<(VaultLocation, String)> {
    let coordinates = parse_remote(remote)?;
    match coordinates.name {
        Some(name) => Ok((coordinates.location, name)),
        None => bail!("Remote {} does not name an object", remote),
    }
}

fn write_output(dest: Option<&Path>, data: &[u8]) -> Result<()> {
    match dest {
        Some(path) => std::fs::write(path, data)
            .with_context(|| format!("Unable to write {}", path.display())),
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(data)?;
            stdout.flush()?;
            Ok(())
        }
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Process environment, exposed to templates as `environment`.
fn template_variables() -> Map<String, Value> {
    let environment: Map<String, Value> = std::env::vars()
        .map(|(name, value)| (name, Value::String(value)))
        .collect();
    let mut variables = Map::new();
    variables.insert("environment".to_string(), Value::Object(environment));
    variables
}

async fn cmd_template(
    factory: &ConnectionFactory,
    template: &Path,
    dest: Option<&Path>,
    remote: &str,
) -> Result<()> {
    let coordinates = parse_remote(remote)?;
    info!(
        "Rendering {} with objects of {}",
        template.display(),
        coordinates.location
    );
    let vault = open_vault(factory, coordinates.location).await?;
    let rendered = vault
        .render_template(template, &template_variables())
        .await
        .context("Failed to render template")?;
    write_output(dest, &rendered)
}

async fn cmd_push(
    factory: &ConnectionFactory,
    src: &Path,
    remote: &str,
    keys: &KeyArgs,
) -> Result<()> {
    let coordinates = parse_remote(remote)?;
    let name = match coordinates.name {
        Some(name) => name,
        None => src
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .with_context(|| format!("No object name for {}", src.display()))?,
    };

    let vault = open_vault(factory, coordinates.location).await?;
    let metadata = vault
        .put_file(src, &name, &keys.selection())
        .await
        .context("Failed to upload file")?;
    println!(
        "Uploaded {} to {}{}",
        src.display(),
        vault.location(),
        name
    );
    print_json(&serde_json::to_value(&metadata)?)
}

async fn cmd_get(
    factory: &ConnectionFactory,
    remote: &str,
    dest: Option<&Path>,
    metadata: bool,
) -> Result<()> {
    let (location, name) = parse_object(remote)?;
    let vault = open_vault(factory, location).await?;

    if metadata {
        let header = vault
            .get_file_metadata(&name)
            .await
            .context("Failed to read object metadata")?;
        return print_json(&serde_json::to_value(&header)?);
    }

    let content = vault
        .get_file(&name)
        .await
        .context("Failed to download object")?;
    write_output(dest, &content)
}

async fn cmd_configset(
    factory: &ConnectionFactory,
    remote: &str,
    key: &str,
    value: &str,
    value_type: ValueType,
    keys: &KeyArgs,
) -> Result<()> {
    let (location, config) = parse_object(remote)?;
    let value = convert::convert(value, value_type)?;
    let vault = open_vault(factory, location).await?;
    vault
        .set_property(&config, key, value, &keys.selection())
        .await
        .with_context(|| format!("Failed to set {} in {}", key, config))?;
    info!("Property {} of {} updated", key, config);
    Ok(())
}

async fn cmd_configget(factory: &ConnectionFactory, remote: &str, key: &str) -> Result<()> {
    let (location, config) = parse_object(remote)?;
    let vault = open_vault(factory, location).await?;
    let value = vault
        .get_property(&config, key)
        .await
        .with_context(|| format!("Failed to read {} from {}", key, config))?;
    print_json(&value)
}

async fn cmd_configedit(
    factory: &ConnectionFactory,
    remote: &str,
    format: EditFormat,
    keys: &KeyArgs,
) -> Result<()> {
    let (location, config) = parse_object(remote)?;
    let vault = open_vault(factory, location).await?;

    let (document, selection) = match vault.get_file(&config).await {
        Ok(raw) => {
            let document: Value = serde_json::from_slice(&raw).with_context(|| {
                format!("Config {} is not a JSON document, it cannot be edited", config)
            })?;
            let header = vault.get_file_metadata(&config).await?;
            (document, existing_key(&config, &header)?)
        }
        Err(e) if e.is_not_found() => {
            if !keys.is_explicit() {
                bail!(
                    "Config {} does not exist, --kms-alias or --kms-arn is required to create it",
                    config
                );
            }
            warn!("Config {} does not exist, starting from an example", config);
            (json!({"example": "editme"}), keys.selection())
        }
        Err(e) => return Err(e).context("Failed to read config"),
    };

    match editor::edit(&document, format).await? {
        Some(edited) => {
            vault
                .put_config(&config, &edited, &selection)
                .await
                .context("Failed to save config")?;
            info!("Config {} saved", config);
        }
        None => info!("Nothing to save for {}", config),
    }
    Ok(())
}

/// Key an existing config is re-encrypted with.
fn existing_key(config: &str, header: &ObjectMetadata) -> Result<KeySelection> {
    let key_arn = header.kms_key_id().ok_or_else(|| {
        s3vault_common::Error::UnencryptedObject(format!("Config {} is not encrypted", config))
    })?;
    Ok(KeySelection::arn(key_arn))
}

async fn cmd_session(factory: &ConnectionFactory, request: &SessionRequest) -> Result<()> {
    let token_factory = TokenFactory::new()?;
    let identity = factory
        .identity_service()
        .await
        .context("Unable to connect to STS")?;
    let metadata = factory
        .metadata()
        .await
        .context("Unable to read execution context")?;
    let region = factory.region().await?;

    let token = token_factory
        .generate_token(request, identity.as_ref(), metadata.as_ref(), region)
        .await
        .context("Failed to create session")?;
    println!(
        "Session token written to {}, valid until {}",
        token_factory.path().display(),
        token.expiration
    );
    Ok(())
}

fn cmd_init(output: Option<&Path>) -> Result<()> {
    write_output(output, EXAMPLE_CONFIG.as_bytes())?;
    if let Some(path) = output {
        info!("Example configuration written to {}", path.display());
    }
    Ok(())
}

async fn cmd_cloudformation(
    factory: &ConnectionFactory,
    config: &Path,
    output: Option<&Path>,
    lookup_keys: bool,
) -> Result<()> {
    let config = VaultConfig::load(config).context("Failed to load vault configuration")?;
    let mut generator = PolicyGenerator::new(&config)?;
    if lookup_keys {
        let key_service = factory
            .key_service()
            .await
            .context("Unable to connect to KMS")?;
        generator = generator.with_key_service(key_service);
    }
    let template = generator
        .generate()
        .await
        .context("Failed to generate template")?;
    write_output(output, format!("{}\n", template).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object() {
        let (location, name) = parse_object("bucket/role/web/app.json").unwrap();
        assert_eq!(location.bucket(), "bucket");
        assert_eq!(location.path_prefix(), "role/web");
        assert_eq!(name, "app.json");

        assert!(parse_object("bucket/role/web/").is_err());
    }

    #[test]
    fn test_existing_key_requires_encryption() {
        let header = ObjectMetadata::default();
        let err = existing_key("app.json", &header).unwrap_err();
        let kind = err
            .downcast_ref::<s3vault_common::Error>()
            .map(s3vault_common::Error::kind);
        assert_eq!(kind, Some("UnencryptedObjectError"));

        let header = ObjectMetadata {
            kms_key_id: Some("arn:aws:kms:eu-west-1:1:key/abc".to_string()),
            ..ObjectMetadata::default()
        };
        let selection = existing_key("app.json", &header).unwrap();
        assert_eq!(
            selection.key_arn.as_deref(),
            Some("arn:aws:kms:eu-west-1:1:key/abc")
        );
    }

    #[test]
    fn test_template_variables_expose_environment() {
        std::env::set_var("S3VAULT_TEMPLATE_TEST", "value");
        let variables = template_variables();
        assert_eq!(
            variables["environment"]["S3VAULT_TEMPLATE_TEST"],
            json!("value")
        );
    }

    #[test]
    fn test_init_writes_example() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.yml");
        cmd_init(Some(&path)).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, EXAMPLE_CONFIG);
        assert!(VaultConfig::from_yaml_str(&written).is_ok());
    }
}
