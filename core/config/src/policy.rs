//! Infrastructure template generation.
//!
//! Roles, keys, groups, the bucket policy and the stack outputs are rendered
//! as separate fragments and spliced into a single CloudFormation document.

use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tera::{Context, Tera};
use tracing::{debug, info};

use crate::config::VaultConfig;
use crate::role::Role;
use s3vault_common::{Error, Result};
use s3vault_connection::{alias_id, KeyService};

const TEMPLATES: [(&str, &str); 7] = [
    ("macros.tera", include_str!("../templates/macros.tera")),
    ("roles.tera", include_str!("../templates/roles.tera")),
    ("kms.tera", include_str!("../templates/kms.tera")),
    ("groups.tera", include_str!("../templates/groups.tera")),
    (
        "bucket_policy.tera",
        include_str!("../templates/bucket_policy.tera"),
    ),
    ("outputs.tera", include_str!("../templates/outputs.tera")),
    (
        "cloudformation.tera",
        include_str!("../templates/cloudformation.tera"),
    ),
];

/// Resource fragments, in document order, with their log line.
const RESOURCE_FRAGMENTS: [(&str, &str); 4] = [
    ("roles.tera", "Generating IAM roles and policies"),
    ("kms.tera", "Generating KMS resources"),
    ("groups.tera", "Generating IAM groups"),
    ("bucket_policy.tera", "Generating S3 bucket policy"),
];

const READ_KMS_ACTIONS: [&str; 2] = ["kms:Decrypt", "kms:DescribeKey"];
const WRITE_KMS_ACTIONS: [&str; 4] = [
    "kms:Encrypt",
    "kms:GenerateDataKey*",
    "kms:ReEncrypt*",
    "kms:DescribeKey",
];

/// CloudFormation logical id for `value`.
///
/// `-` is treated as `_`, every `_`-separated token gets an upper-case first
/// letter, and anything that is not ASCII alphanumeric is dropped.
pub fn cfsanitize(value: &str) -> String {
    value
        .replace('-', "_")
        .split('_')
        .flat_map(|token| {
            let mut chars = token.chars();
            let first = chars.next().map(|c| c.to_ascii_uppercase());
            first.into_iter().chain(chars)
        })
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

fn cfsanitize_filter(value: &Value, _args: &HashMap<String, Value>) -> tera::Result<Value> {
    let text = value
        .as_str()
        .ok_or_else(|| tera::Error::msg("cfsanitize: expected a string"))?;
    Ok(Value::String(cfsanitize(text)))
}

fn push_unique(target: &mut Vec<String>, values: &[&str]) {
    for value in values {
        if !target.iter().any(|existing| existing == value) {
            target.push(value.to_string());
        }
    }
}

/// Bare key name of an alias, without any `alias/` prefix.
fn key_name(alias: &str) -> String {
    alias_id(alias)
        .strip_prefix("alias/")
        .unwrap_or(alias)
        .to_string()
}

#[derive(Debug, Serialize)]
struct RoleView {
    name: String,
    paths: Vec<String>,
    privileges: Vec<String>,
    key_name: String,
    key_arn: Option<String>,
    managed_policies: Vec<String>,
    list_prefixes: Vec<String>,
    object_arns: Vec<String>,
    s3_actions: Vec<String>,
    kms_actions: Vec<String>,
}

impl RoleView {
    fn new(config: &VaultConfig, role: &Role, key_arn: Option<String>) -> Self {
        let paths = config.paths_for(role).to_vec();
        let mut list_prefixes = Vec::new();
        let mut object_arns = Vec::new();
        for path in &paths {
            list_prefixes.push(format!("{}/", path));
            list_prefixes.push(format!("{}/*", path));
            object_arns.push(format!("arn:aws:s3:::{}/{}/*", config.bucket(), path));
        }

        let mut s3_actions = Vec::new();
        let mut kms_actions = Vec::new();
        if role.can_read() {
            push_unique(&mut s3_actions, &["s3:GetObject"]);
            push_unique(&mut kms_actions, &READ_KMS_ACTIONS);
        }
        if role.can_write() {
            push_unique(&mut s3_actions, &["s3:PutObject"]);
            push_unique(&mut kms_actions, &WRITE_KMS_ACTIONS);
        }

        Self {
            name: role.name().to_string(),
            privileges: role.privileges().iter().map(ToString::to_string).collect(),
            key_name: key_name(role.kms_alias()),
            key_arn,
            managed_policies: role.managed_policies().to_vec(),
            paths,
            list_prefixes,
            object_arns,
            s3_actions,
            kms_actions,
        }
    }
}

/// A key the template declares, shared by every role using its alias.
#[derive(Debug, Serialize)]
struct KeyView {
    name: String,
    alias: String,
    description: String,
    roles: Vec<String>,
    actions: Vec<String>,
}

#[derive(Debug, Serialize)]
struct VaultView {
    bucket: String,
    bucket_arn: String,
    objects_arn: String,
    path_all: Vec<String>,
    roles: Vec<RoleView>,
    keys: Vec<KeyView>,
}

impl VaultView {
    fn new(config: &VaultConfig, roles: Vec<RoleView>) -> Self {
        let mut keys: Vec<KeyView> = Vec::new();
        for role in roles.iter().filter(|role| role.key_arn.is_none()) {
            let index = match keys.iter().position(|key| key.name == role.key_name) {
                Some(index) => index,
                None => {
                    keys.push(KeyView {
                        name: role.key_name.clone(),
                        alias: alias_id(&role.key_name),
                        description: format!("S3Vault key {}", role.key_name),
                        roles: Vec::new(),
                        actions: Vec::new(),
                    });
                    keys.len() - 1
                }
            };
            let key = &mut keys[index];
            key.roles.push(role.name.clone());
            let actions: Vec<&str> = role.kms_actions.iter().map(String::as_str).collect();
            push_unique(&mut key.actions, &actions);
        }

        Self {
            bucket: config.bucket().to_string(),
            bucket_arn: format!("arn:aws:s3:::{}", config.bucket()),
            objects_arn: format!("arn:aws:s3:::{}/*", config.bucket()),
            path_all: config.path_all().to_vec(),
            roles,
            keys,
        }
    }
}

/// Renders a vault configuration into a CloudFormation template.
pub struct PolicyGenerator<'a> {
    config: &'a VaultConfig,
    tera: Tera,
    key_service: Option<Arc<dyn KeyService>>,
}

impl<'a> PolicyGenerator<'a> {
    /// Create a generator for `config` with the embedded template set.
    ///
    /// # Errors
    /// - `Template` if an embedded template does not parse
    pub fn new(config: &'a VaultConfig) -> Result<Self> {
        let mut tera = Tera::default();
        tera.register_filter("cfsanitize", cfsanitize_filter);
        tera.add_raw_templates(TEMPLATES.to_vec())
            .map_err(|e| Error::Template(e.to_string()))?;
        Ok(Self {
            config,
            tera,
            key_service: None,
        })
    }

    /// Look up existing keys so roles whose alias already exists reference
    /// that key instead of declaring a new one.
    pub fn with_key_service(mut self, key_service: Arc<dyn KeyService>) -> Self {
        self.key_service = Some(key_service);
        self
    }

    async fn view(&self) -> Result<VaultView> {
        let mut roles = Vec::with_capacity(self.config.roles().len());
        for role in self.config.roles() {
            let key_arn = match &self.key_service {
                Some(key_service) => role
                    .kms_arn(key_service.as_ref())
                    .await?
                    .map(str::to_string),
                None => None,
            };
            roles.push(RoleView::new(self.config, role, key_arn));
        }
        Ok(VaultView::new(self.config, roles))
    }

    fn render(&self, name: &str, context: &Context) -> Result<String> {
        self.tera
            .render(name, context)
            .map_err(|e| Error::Template(format!("{}: {:?}", name, e)))
    }

    /// Generate the template as pretty-printed JSON with a 4-space indent.
    ///
    /// # Errors
    /// - `Template` if a fragment fails to render
    /// - `Serialization` if the spliced document is not valid JSON
    /// - Key service errors when existing keys are looked up
    pub async fn generate(&self) -> Result<String> {
        let view = self.view().await?;
        let mut context = Context::new();
        context.insert("vault", &view);

        let mut resources = Vec::new();
        for (name, message) in RESOURCE_FRAGMENTS {
            info!("{}", message);
            let fragment = self.render(name, &context)?;
            if !fragment.trim().is_empty() {
                resources.push(fragment);
            }
        }
        info!("Generating Cloudformation exports");
        let outputs = self.render("outputs.tera", &context)?;

        let mut document = Context::new();
        document.insert(
            "description",
            &format!("S3Vault resources for bucket {}", view.bucket),
        );
        document.insert("resources", &resources);
        document.insert("outputs", &outputs);
        let rendered = self.render("cloudformation.tera", &document)?;
        debug!("Rendered {} bytes of template", rendered.len());

        pretty_print(&rendered)
    }
}

fn pretty_print(document: &str) -> Result<String> {
    let value: Value = serde_json::from_str(document)?;
    let mut out = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut serializer)?;
    String::from_utf8(out).map_err(|e| Error::Serialization(e.to_string()))
}
