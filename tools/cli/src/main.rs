//! S3Vault CLI - KMS encrypted configuration and secrets stored in S3.
//!
//! Remote locations are written `<bucket>/<path>/[<name>]`: a trailing `/`
//! addresses the scope itself, otherwise the last segment is the object.

mod commands;
mod convert;
mod editor;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use convert::ValueType;
use editor::EditFormat;
use s3vault_vault::KeySelection;

#[derive(Parser)]
#[command(name = "s3v")]
#[command(about = "S3Vault - KMS encrypted configuration and secrets on S3")]
#[command(version)]
struct Cli {
    /// Log level.
    #[arg(short = 'L', long, value_enum, default_value_t = LogLevel::Info, global = true)]
    log_level: LogLevel,

    /// Named AWS profile to use.
    #[arg(long, global = true)]
    profile: Option<String>,

    /// AWS region; taken from the profile or the instance otherwise.
    #[arg(long, global = true)]
    region: Option<String>,

    /// Do not query the EC2 instance metadata.
    #[arg(long, visible_aliases = ["local", "no-ec2"], global = true)]
    disable_instance_context: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Key used for writes.
#[derive(Args, Debug, Clone)]
struct KeyArgs {
    /// KMS key alias.
    #[arg(short = 'k', long, conflicts_with = "kms_arn")]
    kms_alias: Option<String>,

    /// KMS key ARN.
    #[arg(long)]
    kms_arn: Option<String>,

    /// Role whose key alias is used when no alias is given.
    #[arg(long)]
    role_name: Option<String>,
}

impl KeyArgs {
    fn selection(&self) -> KeySelection {
        KeySelection {
            key_arn: self.kms_arn.clone(),
            key_alias: self.kms_alias.clone(),
            role_name: self.role_name.clone(),
        }
    }

    fn is_explicit(&self) -> bool {
        self.kms_alias.is_some() || self.kms_arn.is_some()
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Render a template with the objects of a vault path.
    Template {
        /// Template file.
        #[arg(short, long)]
        template: PathBuf,

        /// Output file (default: stdout).
        #[arg(short, long)]
        dest: Option<PathBuf>,

        /// Vault path, `<bucket>/<path>/`.
        #[arg(short, long)]
        remote: String,
    },

    /// Upload a file to the vault.
    #[command(visible_alias = "obj-push")]
    Push {
        /// Local file.
        #[arg(short, long)]
        src: PathBuf,

        /// Destination, `<bucket>/<path>/[<name>]`; the file name is used
        /// when no name is given.
        #[arg(short, long)]
        remote: String,

        #[command(flatten)]
        keys: KeyArgs,
    },

    /// Download an object from the vault.
    #[command(visible_aliases = ["pull", "obj-pull"])]
    Get {
        /// Object, `<bucket>/<path>/<name>`.
        #[arg(short, long)]
        remote: String,

        /// Output file (default: stdout).
        #[arg(short, long)]
        dest: Option<PathBuf>,

        /// Print the object metadata instead of its content.
        #[arg(long)]
        metadata: bool,
    },

    /// Set a property of a config object.
    #[command(visible_aliases = ["conf-set", "set"])]
    Configset {
        /// Config object, `<bucket>/<path>/<name>`.
        #[arg(short, long)]
        remote: String,

        /// Property as a dot-path, e.g. `db.host`.
        #[arg(short = 'K', long)]
        key: String,

        /// Property value.
        #[arg(short, long)]
        value: String,

        /// How the value is interpreted.
        #[arg(short = 'T', long = "type", value_enum, default_value_t = ValueType::String)]
        value_type: ValueType,

        #[command(flatten)]
        keys: KeyArgs,
    },

    /// Print a property of a config object.
    #[command(visible_alias = "conf-get")]
    Configget {
        /// Config object, `<bucket>/<path>/<name>`.
        #[arg(short, long)]
        remote: String,

        /// Property as a dot-path.
        #[arg(short = 'K', long)]
        key: String,
    },

    /// Edit a config object in $VISUAL or $EDITOR.
    #[command(visible_aliases = ["conf-edit", "edit"])]
    Configedit {
        /// Config object, `<bucket>/<path>/<name>`.
        #[arg(short, long)]
        remote: String,

        /// Format shown in the editor.
        #[arg(short, long, value_enum, default_value_t = EditFormat::Yaml)]
        format: EditFormat,

        #[command(flatten)]
        keys: KeyArgs,
    },

    /// Assume a role and cache the session token.
    Session {
        /// Role name, expanded with the current account id.
        #[arg(short = 'n', long, required_unless_present = "role_arn")]
        role_name: Option<String>,

        /// Role ARN.
        #[arg(short, long)]
        role_arn: Option<String>,

        /// External id; prompted for when omitted.
        #[arg(short, long, conflicts_with = "no_external_id")]
        external_id: Option<String>,

        /// Assume the role without an external id.
        #[arg(long)]
        no_external_id: bool,
    },

    /// Write an example vault configuration.
    Init {
        /// Output file (default: stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Generate a CloudFormation template from a vault configuration.
    #[command(visible_alias = "policy")]
    Cloudformation {
        /// Vault configuration file.
        #[arg(short, long)]
        config: PathBuf,

        /// Output file (default: stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Reference keys that already exist instead of declaring them.
        #[arg(long)]
        lookup_keys: bool,
    },
}

fn init_logging(level: LogLevel) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn report(err: &anyhow::Error) {
    let kind = err
        .downcast_ref::<s3vault_common::Error>()
        .map(s3vault_common::Error::kind)
        .unwrap_or("Error");
    error!("{}. Error: {} / {}", err, kind, err.root_cause());
    debug!("{:?}", err);
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_level) {
        eprintln!("Unable to set up logging: {}", e);
        return ExitCode::FAILURE;
    }

    match commands::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_local_alias() {
        let cli = Cli::try_parse_from(["s3v", "--local", "init"]).unwrap();
        assert!(cli.disable_instance_context);
        let cli = Cli::try_parse_from(["s3v", "init", "--no-ec2"]).unwrap();
        assert!(cli.disable_instance_context);
    }

    #[test]
    fn test_log_level_values() {
        let cli = Cli::try_parse_from(["s3v", "-L", "warning", "init"]).unwrap();
        assert_eq!(cli.log_level.directive(), "warn");
        assert!(Cli::try_parse_from(["s3v", "-L", "trace", "init"]).is_err());
    }

    #[test]
    fn test_kms_alias_conflicts_with_arn() {
        let result = Cli::try_parse_from([
            "s3v", "push", "-s", "f", "-r", "b/p/", "-k", "web", "--kms-arn", "arn",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_command_aliases() {
        for args in [
            vec!["s3v", "obj-push", "-s", "f", "-r", "b/p/"],
            vec!["s3v", "pull", "-r", "b/p/n"],
            vec!["s3v", "set", "-r", "b/p/n", "-K", "a.b", "-v", "1", "-T", "int"],
            vec!["s3v", "edit", "-r", "b/p/n"],
            vec!["s3v", "policy", "-c", "vault.yml"],
        ] {
            assert!(Cli::try_parse_from(args.iter().copied()).is_ok(), "{:?}", args);
        }
    }

    #[test]
    fn test_session_requires_role() {
        assert!(Cli::try_parse_from(["s3v", "session", "--no-external-id"]).is_err());
        assert!(Cli::try_parse_from(["s3v", "session", "-r", "arn:aws:iam::1:role/x"]).is_ok());
    }

    #[test]
    fn test_key_args_selection() {
        let keys = KeyArgs {
            kms_alias: Some("web".to_string()),
            kms_arn: None,
            role_name: Some("api".to_string()),
        };
        let selection = keys.selection();
        assert_eq!(selection.key_alias.as_deref(), Some("web"));
        assert_eq!(selection.role_name.as_deref(), Some("api"));
        assert!(keys.is_explicit());
    }
}
