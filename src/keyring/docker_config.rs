//! Docker config documents: the `.dockerconfigjson` / `.dockercfg` secret payloads and the
//! local `~/.docker/config.json` file share the same entry format.

use base64::Engine;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::AuthConfig;
use crate::error::PullError;

/// A credential-bearing secret record, as listed from the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullSecret {
    /// `kubernetes.io/dockerconfigjson`: `{"auths": {"<server>": {...}}}`
    DockerConfigJson { name: String, data: Vec<u8> },
    /// `kubernetes.io/dockercfg` (legacy): `{"<server>": {...}}`
    DockerCfg { name: String, data: Vec<u8> },
}

impl PullSecret {
    pub fn name(&self) -> &str {
        match self {
            PullSecret::DockerConfigJson { name, .. } | PullSecret::DockerCfg { name, .. } => name,
        }
    }

    pub fn decode(&self) -> Result<DockerConfig, PullError> {
        match self {
            PullSecret::DockerConfigJson { name, data } => DockerConfig::from_config_json(name, data),
            PullSecret::DockerCfg { name, data } => DockerConfig::from_dockercfg(name, data),
        }
    }
}

/// One server entry of a docker config document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerConfigEntry {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// base64("username:password")
    #[serde(default)]
    pub auth: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, rename = "identitytoken")]
    pub identity_token: String,
}

#[derive(Deserialize)]
struct ConfigJsonDocument {
    #[serde(default)]
    auths: BTreeMap<String, DockerConfigEntry>,
}

/// Decoded credentials keyed by the server address they were stored under.
#[derive(Debug, Clone, Default)]
pub struct DockerConfig {
    entries: Vec<(String, AuthConfig)>,
}

impl DockerConfig {
    pub fn from_config_json(source: &str, data: &[u8]) -> Result<Self, PullError> {
        let document: ConfigJsonDocument =
            serde_json::from_slice(data).map_err(|e| invalid_secret(source, e.to_string()))?;
        Self::from_entries(source, document.auths)
    }

    pub fn from_dockercfg(source: &str, data: &[u8]) -> Result<Self, PullError> {
        let entries: BTreeMap<String, DockerConfigEntry> =
            serde_json::from_slice(data).map_err(|e| invalid_secret(source, e.to_string()))?;
        Self::from_entries(source, entries)
    }

    fn from_entries(
        source: &str,
        entries: BTreeMap<String, DockerConfigEntry>,
    ) -> Result<Self, PullError> {
        let mut decoded = Vec::with_capacity(entries.len());
        for (server, entry) in entries {
            let auth = entry_to_auth_config(source, &server, entry)?;
            decoded.push((server, auth));
        }
        Ok(Self { entries: decoded })
    }

    /// Load the local docker config, if any.
    ///
    /// Reads `$DOCKER_CONFIG/config.json` (or `~/.docker/config.json`) and the legacy
    /// `~/.dockercfg`; entries from both are merged. Returns `None` when neither file exists.
    pub fn load_default() -> Result<Option<Self>, PullError> {
        let config_dir = std::env::var_os("DOCKER_CONFIG")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".docker")));
        let legacy = dirs::home_dir().map(|home| home.join(".dockercfg"));

        let mut merged: Option<Self> = None;
        if let Some(dir) = config_dir {
            if let Some(config) = Self::read_file(&dir.join("config.json"), Self::from_config_json)? {
                merged.get_or_insert_with(Self::default).extend(config);
            }
        }
        if let Some(path) = legacy {
            if let Some(config) = Self::read_file(&path, Self::from_dockercfg)? {
                merged.get_or_insert_with(Self::default).extend(config);
            }
        }
        Ok(merged)
    }

    fn read_file(
        path: &Path,
        parse: fn(&str, &[u8]) -> Result<Self, PullError>,
    ) -> Result<Option<Self>, PullError> {
        let source = path.display().to_string();
        match std::fs::read(path) {
            Ok(data) => {
                debug!(path = %source, "Loaded docker config");
                parse(&source, &data).map(Some)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(invalid_secret(&source, e.to_string())),
        }
    }

    pub fn extend(&mut self, other: DockerConfig) {
        self.entries.extend(other.entries);
    }

    pub fn entries(&self) -> &[(String, AuthConfig)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The `auth` field, when set, takes precedence over username/password.
fn entry_to_auth_config(
    source: &str,
    server: &str,
    entry: DockerConfigEntry,
) -> Result<AuthConfig, PullError> {
    let (username, password) = if entry.auth.is_empty() {
        (entry.username, entry.password)
    } else {
        decode_auth_field(&entry.auth)
            .map_err(|reason| invalid_secret(source, format!("entry {}: {}", server, reason)))?
    };

    Ok(AuthConfig {
        username,
        password,
        auth: entry.auth,
        email: entry.email,
        identity_token: entry.identity_token,
        server_address: String::new(),
    })
}

fn decode_auth_field(auth: &str) -> Result<(String, String), String> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth.trim())
        .map_err(|e| format!("auth field is not valid base64: {}", e))?;
    let decoded =
        String::from_utf8(decoded).map_err(|_| "auth field is not valid UTF-8".to_string())?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| "auth field must be formatted as username:password".to_string())?;
    Ok((username.to_string(), password.to_string()))
}

fn invalid_secret(source: &str, reason: String) -> PullError {
    PullError::InvalidSecret {
        secret: source.to_string(),
        reason,
    }
}
