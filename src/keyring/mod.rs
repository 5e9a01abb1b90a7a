//! Credential keyring: merges credentials from pull secrets, the local docker config and
//! registered credential providers, and answers lookups by repository name.

pub mod docker_config;
pub mod providers;

use base64::Engine;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::PullError;
pub use docker_config::{DockerConfig, PullSecret};
pub use providers::{CredentialProvider, ProviderRegistry};

/// Authorization information for connecting to a registry.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
    /// Pre-encoded base64("username:password")
    pub auth: String,
    pub email: String,
    /// Token-service refresh token stored by `docker login` (`identitytoken`)
    pub identity_token: String,
    /// Registry base URL; empty means "use the endpoint derived from the image"
    pub server_address: String,
}

impl AuthConfig {
    pub fn anonymous(server_address: impl Into<String>) -> Self {
        Self {
            server_address: server_address.into(),
            ..Default::default()
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty()
            && self.password.is_empty()
            && self.auth.is_empty()
            && self.identity_token.is_empty()
    }

    /// Value for a `Basic` Authorization header, if the credential carries one
    pub fn basic_token(&self) -> Option<String> {
        if !self.username.is_empty() || !self.password.is_empty() {
            Some(
                base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", self.username, self.password)),
            )
        } else if !self.auth.is_empty() {
            Some(self.auth.clone())
        } else {
            None
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("auth", &redacted(&self.auth))
            .field("email", &self.email)
            .field("identity_token", &redacted(&self.identity_token))
            .field("server_address", &self.server_address)
            .finish()
    }
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}

/// A credential candidate that is only materialized when it is attempted.
#[derive(Clone)]
pub enum LazyCredential {
    /// Decoded from a pull secret or the local docker config
    Static { source: String, auth: AuthConfig },
    /// Issued on demand by a provider for the given registry host
    Provider {
        provider: Arc<dyn CredentialProvider>,
        host: String,
    },
}

impl LazyCredential {
    /// Produce the credential. Provider-backed candidates call out to their provider here.
    pub async fn provide(&self) -> Result<AuthConfig, PullError> {
        match self {
            LazyCredential::Static { auth, .. } => Ok(auth.clone()),
            LazyCredential::Provider { provider, host } => provider.provide(host).await,
        }
    }

    /// Where the candidate comes from, for logging
    pub fn source(&self) -> &str {
        match self {
            LazyCredential::Static { source, .. } => source,
            LazyCredential::Provider { provider, .. } => provider.name(),
        }
    }
}

impl fmt::Debug for LazyCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LazyCredential::Static { source, auth } => f
                .debug_struct("Static")
                .field("source", source)
                .field("auth", auth)
                .finish(),
            LazyCredential::Provider { provider, host } => f
                .debug_struct("Provider")
                .field("provider", &provider.name())
                .field("host", host)
                .finish(),
        }
    }
}

/// Credentials indexed by normalized registry key (`host[:port][/path]`).
#[derive(Debug, Clone, Default)]
pub struct BasicKeyring {
    index: BTreeMap<String, Vec<(String, AuthConfig)>>,
}

impl BasicKeyring {
    pub fn add(&mut self, source: &str, config: &DockerConfig) {
        for (server, auth) in config.entries() {
            self.index
                .entry(normalize_registry_key(server))
                .or_default()
                .push((source.to_string(), auth.clone()));
        }
    }

    /// Matching credentials: keys in reverse lexicographic order so longer, more specific paths
    /// come first; insertion order within a key.
    pub fn lookup(&self, name: &str) -> Vec<LazyCredential> {
        self.index
            .iter()
            .rev()
            .filter(|(key, _)| url_matches(key, name))
            .flat_map(|(_, creds)| creds.iter())
            .map(|(source, auth)| LazyCredential::Static {
                source: source.clone(),
                auth: auth.clone(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// The merged credential sources consulted for one pull.
pub struct Keyring {
    secrets: BasicKeyring,
    local: BasicKeyring,
    providers: Vec<Arc<dyn CredentialProvider>>,
}

impl Keyring {
    /// Build a keyring from the caller's pull secrets plus the process-wide sources in
    /// `registry`. A secret that cannot be decoded fails the build.
    pub fn build(secrets: &[PullSecret], registry: &ProviderRegistry) -> Result<Self, PullError> {
        let mut secret_keyring = BasicKeyring::default();
        for secret in secrets {
            let config = secret.decode()?;
            secret_keyring.add(secret.name(), &config);
        }

        let mut local = BasicKeyring::default();
        for (source, config) in registry.local_configs() {
            local.add(source, config);
        }

        Ok(Self {
            secrets: secret_keyring,
            local,
            providers: registry.enabled_providers(),
        })
    }

    /// Candidates for a fully qualified repository name (`host/repository`), in the order they
    /// must be attempted: pull secrets, local docker config, then providers.
    pub fn lookup(&self, name: &str) -> (Vec<LazyCredential>, bool) {
        let host = name.split('/').next().unwrap_or(name);

        let mut candidates = self.secrets.lookup(name);
        candidates.extend(self.local.lookup(name));
        candidates.extend(
            self.providers
                .iter()
                .filter(|provider| provider.matches(host))
                .map(|provider| LazyCredential::Provider {
                    provider: Arc::clone(provider),
                    host: host.to_string(),
                }),
        );

        let found = !candidates.is_empty();
        (candidates, found)
    }
}

const DOCKER_HUB_KEY: &str = "docker.io";
const DOCKER_HUB_KEY_ALIASES: [&str; 3] = [
    "index.docker.io",
    "registry-1.docker.io",
    "registry.hub.docker.com",
];

/// Normalize a docker config server key to `host[:port][/path]`.
///
/// Docker Hub keys (`https://index.docker.io/v1/` and friends) collapse to `docker.io`, matching
/// the host produced by reference parsing.
pub fn normalize_registry_key(server: &str) -> String {
    let key = server
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');

    let (host, path) = match key.split_once('/') {
        Some((host, path)) => (host, path),
        None => (key, ""),
    };
    let host = host.to_ascii_lowercase();

    if DOCKER_HUB_KEY_ALIASES.contains(&host.as_str()) || host == DOCKER_HUB_KEY {
        let path = match path.strip_prefix("v1") {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
            _ => path,
        };
        return if path.is_empty() {
            DOCKER_HUB_KEY.to_string()
        } else {
            format!("{}/{}", DOCKER_HUB_KEY, path)
        };
    }

    if path.is_empty() {
        host
    } else {
        format!("{}/{}", host, path)
    }
}

/// Whether a keyring key (possibly with `*` wildcards in host labels) matches a repository name.
///
/// Hosts must have the same number of labels and each label must match, ports must be equal,
/// and the key's path must be a prefix of the name's path.
pub fn url_matches(key: &str, name: &str) -> bool {
    let (key_host, key_port, key_path) = split_key(key);
    let (name_host, name_port, name_path) = split_key(name);

    if key_port != name_port {
        return false;
    }

    let key_labels: Vec<&str> = key_host.split('.').collect();
    let name_labels: Vec<&str> = name_host.split('.').collect();
    if key_labels.len() != name_labels.len() {
        return false;
    }
    if !key_labels
        .iter()
        .zip(name_labels.iter())
        .all(|(pattern, label)| glob_match(pattern, &label.to_ascii_lowercase()))
    {
        return false;
    }

    name_path.starts_with(key_path)
}

fn split_key(key: &str) -> (&str, Option<&str>, &str) {
    let (host_port, path) = match key.split_once('/') {
        Some((host_port, path)) => (host_port, path),
        None => (key, ""),
    };
    match host_port.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
            (host, Some(port), path)
        }
        _ => (host_port, None, path),
    }
}

/// Glob match where `*` matches any run of characters within a single host label.
fn glob_match(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == value;
    }

    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !value.starts_with(first) || value.len() < first.len() + last.len() {
        return false;
    }
    if !value.ends_with(last) {
        return false;
    }

    let mut remaining = &value[first.len()..value.len() - last.len()];
    for middle in &parts[1..parts.len() - 1] {
        match remaining.find(middle) {
            Some(idx) => remaining = &remaining[idx + middle.len()..],
            None => return false,
        }
    }
    true
}
