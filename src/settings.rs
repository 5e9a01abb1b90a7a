use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::time::Duration;

/// Runtime configuration.
///
/// Every field has a default, so running without any config file is valid. Files are looked up
/// in `KUBE_IMAGE_PULLER_CONFIG_DIR` (default `config`): `default`, then the run mode from
/// `KUBE_IMAGE_PULLER_RUN_MODE` (default `development`), then `local`. Each may be `.toml`,
/// `.yaml` or `.yml`. String values may reference environment variables as `${VAR}` or
/// `${VAR:-default}`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub fetcher: FetcherSettings,
    #[serde(default)]
    pub registry: RegistrySettings,
    #[serde(default)]
    pub keyring: KeyringSettings,
    #[serde(default)]
    pub aws: AwsSettings,
    #[serde(default)]
    pub azure: AzureSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetcherSettings {
    /// Deadline for one credential attempt, including the auth handshake (default: 30)
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,

    /// TCP connect timeout for registry requests (default: 10)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Timeout for a single HTTP request (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Log every registry request as a cURL command plus the raw response
    #[serde(default)]
    pub trace_http: bool,

    /// Keep Authorization headers unredacted in traced cURL commands
    #[serde(default)]
    pub trace_show_secrets: bool,
}

fn default_attempt_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: default_attempt_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            trace_http: false,
            trace_show_secrets: false,
        }
    }
}

impl FetcherSettings {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RegistrySettings {
    /// Extra host aliases, mapping a host prefix to a canonical registry host.
    /// The Docker Hub aliases are always active.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,

    /// Registry hosts contacted over plain HTTP when no scheme is given
    #[serde(default)]
    pub insecure_registries: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KeyringSettings {
    /// Read credentials from the local docker config (~/.docker/config.json, ~/.dockercfg)
    #[serde(default = "default_true")]
    pub docker_config_file: bool,

    /// Enable the AWS ECR credential provider
    #[serde(default = "default_true")]
    pub ecr: bool,

    /// Enable the GCR / Artifact Registry credential provider
    #[serde(default = "default_true")]
    pub gcr: bool,

    /// Enable the Azure Container Registry credential provider (needs `azure.config_file`)
    #[serde(default = "default_true")]
    pub acr: bool,

    /// How long provider-issued credentials are reused (default: 1800)
    #[serde(default = "default_provider_cache_ttl")]
    pub provider_cache_ttl_secs: u64,

    /// Token endpoint of the GCE metadata server
    #[serde(default = "default_gce_metadata_token_url")]
    pub gce_metadata_token_url: String,
}

fn default_true() -> bool {
    true
}

fn default_provider_cache_ttl() -> u64 {
    1800
}

fn default_gce_metadata_token_url() -> String {
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token"
        .to_string()
}

impl Default for KeyringSettings {
    fn default() -> Self {
        Self {
            docker_config_file: true,
            ecr: true,
            gcr: true,
            acr: true,
            provider_cache_ttl_secs: default_provider_cache_ttl(),
            gce_metadata_token_url: default_gce_metadata_token_url(),
        }
    }
}

impl KeyringSettings {
    pub fn provider_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.provider_cache_ttl_secs)
    }
}

/// AWS settings for the ECR provider. Unset values fall back to the default credential chain.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AwsSettings {
    /// Region used when it cannot be derived from the registry host
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

/// Azure settings for the ACR provider
#[derive(Debug, Deserialize, Clone)]
pub struct AzureSettings {
    /// Cloud provider config (`azure.json`) holding the service principal or managed identity
    #[serde(default)]
    pub config_file: Option<String>,

    /// Managed identity token endpoint of the instance metadata service
    #[serde(default = "default_imds_token_url")]
    pub imds_token_url: String,
}

fn default_imds_token_url() -> String {
    "http://169.254.169.254/metadata/identity/oauth2/token".to_string()
}

impl Default for AzureSettings {
    fn default() -> Self {
        Self {
            config_file: None,
            imds_token_url: default_imds_token_url(),
        }
    }
}

lazy_static! {
    static ref ENV_VAR_RE: Regex = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
}

/// Expand `${VAR}` and `${VAR:-default}`; unset variables without a default become empty.
fn expand_env(value: &str) -> String {
    ENV_VAR_RE
        .replace_all(value, |caps: &regex::Captures| {
            env::var(&caps[1])
                .unwrap_or_else(|_| caps.get(2).map_or("", |m| m.as_str()).to_string())
        })
        .into_owned()
}

/// Convert a config value tree to JSON, expanding environment references in strings on the way.
fn to_json_substituted(value: &config::Value) -> serde_json::Value {
    use config::ValueKind;
    use serde_json::Value as Json;

    match &value.kind {
        ValueKind::Nil => Json::Null,
        ValueKind::Boolean(b) => Json::Bool(*b),
        ValueKind::I64(i) => Json::from(*i),
        ValueKind::I128(i) => Json::from(*i as i64),
        ValueKind::U64(u) => Json::from(*u),
        ValueKind::U128(u) => Json::from(*u as u64),
        ValueKind::Float(f) => serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number),
        ValueKind::String(s) => Json::String(expand_env(s)),
        ValueKind::Table(table) => Json::Object(
            table
                .iter()
                .map(|(k, v)| (k.clone(), to_json_substituted(v)))
                .collect(),
        ),
        ValueKind::Array(items) => Json::Array(items.iter().map(to_json_substituted).collect()),
    }
}

impl Settings {
    /// Layer `<config_dir>/<name>.{toml,yaml,yml}` onto the builder if such a file exists.
    /// The first extension found wins.
    fn add_optional_file(
        builder: ConfigBuilder<DefaultState>,
        config_dir: &str,
        name: &str,
    ) -> ConfigBuilder<DefaultState> {
        let base = Path::new(config_dir).join(name);
        let found = ["toml", "yaml", "yml"]
            .iter()
            .map(|ext| base.with_extension(ext))
            .find(|path| path.exists());

        match found {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading config file");
                builder.add_source(config::File::from(path))
            }
            None => {
                tracing::debug!(dir = config_dir, name = name, "No config file");
                builder
            }
        }
    }

    /// Load settings from the directory and run mode given by the environment
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode =
            env::var("KUBE_IMAGE_PULLER_RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_dir =
            env::var("KUBE_IMAGE_PULLER_CONFIG_DIR").unwrap_or_else(|_| "config".into());

        Self::load(&config_dir, &run_mode)
    }

    pub fn load(config_dir: &str, run_mode: &str) -> Result<Self, ConfigError> {
        let builder = ["default", run_mode, "local"]
            .into_iter()
            .fold(Config::builder(), |builder, name| {
                Self::add_optional_file(builder, config_dir, name)
            });
        let config = builder.build()?;

        let root_value = config
            .cache
            .into_table()
            .map_err(|e| ConfigError::Message(format!("Failed to get config table: {}", e)))?;

        let mut json_map = serde_json::Map::new();
        for (k, v) in root_value.iter() {
            json_map.insert(k.clone(), to_json_substituted(v));
        }
        let json_value = serde_json::Value::Object(json_map);

        let mut unused_fields = Vec::new();
        let settings: Settings = serde_ignored::deserialize(json_value, |path| {
            unused_fields.push(path.to_string());
        })
        .map_err(|e| ConfigError::Message(format!("Failed to deserialize settings: {}", e)))?;

        for field in &unused_fields {
            tracing::warn!("Unknown configuration field: {}", field);
        }

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("fetcher.attempt_timeout_secs", self.fetcher.attempt_timeout_secs),
            ("fetcher.connect_timeout_secs", self.fetcher.connect_timeout_secs),
            ("fetcher.request_timeout_secs", self.fetcher.request_timeout_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Message(format!(
                    "'{}' must be greater than zero",
                    name
                )));
            }
        }

        for (alias, canonical) in &self.registry.aliases {
            if alias.is_empty() || canonical.is_empty() {
                return Err(ConfigError::Message(format!(
                    "Registry alias '{}' -> '{}' must not be empty",
                    alias, canonical
                )));
            }
        }

        Ok(())
    }
}
