//! Registry endpoints: canonical base URLs derived from image hosts and credential server
//! addresses.

use std::fmt;
use url::Url;

use crate::error::PullError;
use crate::settings::RegistrySettings;

/// Canonical host serving the Docker Hub registry API
pub const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

/// Host prefixes that all refer to Docker Hub
pub const DOCKER_HUB_ALIASES: [&str; 2] = ["docker.io", "index.docker.io"];

/// A registry base URL with an explicit scheme and no trailing slash
/// (e.g. "https://registry-1.docker.io").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    base_url: String,
}

impl Endpoint {
    /// Normalize a registry host using only the built-in Docker Hub aliases
    pub fn normalize(host: &str) -> Result<Self, PullError> {
        EndpointNormalizer::default().normalize(host)
    }

    pub fn as_str(&self) -> &str {
        &self.base_url
    }

    /// Host (and port) part of the endpoint
    pub fn host(&self) -> &str {
        self.base_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.base_url)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_url)
    }
}

/// Maps registry hosts to canonical endpoints.
///
/// Pure: never touches the network.
#[derive(Debug, Clone)]
pub struct EndpointNormalizer {
    /// (alias prefix, canonical host), checked in order
    aliases: Vec<(String, String)>,
    /// Hosts reached over plain HTTP when no scheme is given
    insecure_registries: Vec<String>,
}

impl Default for EndpointNormalizer {
    fn default() -> Self {
        Self {
            aliases: DOCKER_HUB_ALIASES
                .iter()
                .map(|alias| (alias.to_string(), DOCKER_HUB_REGISTRY.to_string()))
                .collect(),
            insecure_registries: Vec::new(),
        }
    }
}

impl EndpointNormalizer {
    pub fn from_settings(settings: &RegistrySettings) -> Self {
        let mut normalizer = Self::default();
        for (alias, canonical) in &settings.aliases {
            normalizer
                .aliases
                .push((alias.trim_end_matches('/').to_string(), canonical.clone()));
        }
        normalizer.insecure_registries = settings.insecure_registries.clone();
        normalizer
    }

    pub fn normalize(&self, host: &str) -> Result<Endpoint, PullError> {
        let trimmed = host.trim();
        let (scheme, rest) = if let Some(rest) = trimmed.strip_prefix("https://") {
            (Some("https"), rest)
        } else if let Some(rest) = trimmed.strip_prefix("http://") {
            (Some("http"), rest)
        } else {
            (None, trimmed)
        };

        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err(PullError::invalid_endpoint(host, "registry host is empty"));
        }
        let rest = self.resolve_alias(rest);
        let scheme = scheme.unwrap_or_else(|| {
            if self.insecure_registries.iter().any(|h| h == rest) {
                "http"
            } else {
                "https"
            }
        });

        let base_url = format!("{}://{}", scheme, rest);
        let parsed =
            Url::parse(&base_url).map_err(|e| PullError::invalid_endpoint(host, e.to_string()))?;
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(PullError::invalid_endpoint(host, "missing host"));
        }
        if parsed.query().is_some() || parsed.fragment().is_some() {
            return Err(PullError::invalid_endpoint(
                host,
                "query and fragment are not allowed",
            ));
        }

        Ok(Endpoint { base_url })
    }

    fn resolve_alias<'a>(&'a self, host: &'a str) -> &'a str {
        for (alias, canonical) in &self.aliases {
            if let Some(suffix) = host.strip_prefix(alias.as_str()) {
                // Only whole hosts: "docker.io:443" matches, "docker.io.example.com" does not
                if suffix.is_empty() || suffix.starts_with(':') || suffix.starts_with('/') {
                    return canonical;
                }
            }
        }
        host
    }
}
