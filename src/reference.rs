//! Container image reference parsing.
//!
//! References follow the Docker normalization rules: a name whose first path component does not
//! look like a registry host lives on Docker Hub, and single-component Docker Hub repositories
//! belong to the `library/` namespace.

use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

use crate::error::PullError;

/// Registry used when a reference does not name one
pub const DEFAULT_REGISTRY: &str = "docker.io";
const LEGACY_DEFAULT_REGISTRY: &str = "index.docker.io";
const OFFICIAL_NAMESPACE: &str = "library";
const MAX_NAME_LENGTH: usize = 255;

lazy_static! {
    static ref TAG_RE: Regex = Regex::new(r"^[\w][\w.-]{0,127}$").unwrap();
    static ref DIGEST_RE: Regex =
        Regex::new(r"^[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}$")
            .unwrap();
    static ref PATH_COMPONENT_RE: Regex =
        Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").unwrap();
    static ref HOST_RE: Regex = Regex::new(
        r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)*(?::[0-9]+)?$"
    )
    .unwrap();
}

/// A parsed image reference such as `registry.example.com/team/app:v1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry host, possibly with a port (e.g. "docker.io", "localhost:5000")
    pub registry_host: String,
    /// Repository path below the registry (e.g. "library/nginx")
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a raw image string.
    ///
    /// The tag is never defaulted: a reference without tag and digest has both unset.
    pub fn parse(raw: &str) -> Result<Self, PullError> {
        if raw.is_empty() {
            return Err(PullError::invalid_reference(raw, "reference is empty"));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(PullError::invalid_reference(raw, "reference contains whitespace"));
        }

        let (remainder, digest) = match raw.split_once('@') {
            Some((name, digest)) => {
                if !DIGEST_RE.is_match(digest) {
                    return Err(PullError::invalid_reference(
                        raw,
                        format!("invalid digest {:?}", digest),
                    ));
                }
                (name, Some(digest.to_string()))
            }
            None => (raw, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones belong to a registry port.
        let (name, tag) = match remainder.rfind(':') {
            Some(idx) if !remainder[idx..].contains('/') => {
                let tag = &remainder[idx + 1..];
                if !TAG_RE.is_match(tag) {
                    return Err(PullError::invalid_reference(
                        raw,
                        format!("invalid tag {:?}", tag),
                    ));
                }
                (&remainder[..idx], Some(tag.to_string()))
            }
            _ => (remainder, None),
        };

        if name.is_empty() {
            return Err(PullError::invalid_reference(raw, "repository name is empty"));
        }
        if name.len() > MAX_NAME_LENGTH {
            return Err(PullError::invalid_reference(
                raw,
                format!("repository name exceeds {} characters", MAX_NAME_LENGTH),
            ));
        }

        let (registry_host, repository) = split_registry(name);

        if !HOST_RE.is_match(&registry_host) {
            return Err(PullError::invalid_reference(
                raw,
                format!("invalid registry host {:?}", registry_host),
            ));
        }
        if repository.is_empty() {
            return Err(PullError::invalid_reference(raw, "repository path is empty"));
        }
        for component in repository.split('/') {
            if component.is_empty() {
                return Err(PullError::invalid_reference(raw, "empty path component"));
            }
            if component.chars().any(|c| c.is_ascii_uppercase()) {
                return Err(PullError::invalid_reference(
                    raw,
                    "repository name must be lowercase",
                ));
            }
            if !PATH_COMPONENT_RE.is_match(component) {
                return Err(PullError::invalid_reference(
                    raw,
                    format!("invalid path component {:?}", component),
                ));
            }
        }

        Ok(Self {
            registry_host,
            repository,
            tag,
            digest,
        })
    }

    /// Fully qualified repository name (`host/repository`), used as the keyring lookup key
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry_host, self.repository)
    }

    /// The tag when present, otherwise the digest
    pub fn effective_ref(&self) -> Option<&str> {
        self.tag.as_deref().or(self.digest.as_deref())
    }
}

/// Split a name into registry host and repository path.
fn split_registry(name: &str) -> (String, String) {
    let (host, repository) = match name.split_once('/') {
        Some((first, rest)) if looks_like_host(first) => (first.to_string(), rest.to_string()),
        _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
    };

    let host = if host == LEGACY_DEFAULT_REGISTRY {
        DEFAULT_REGISTRY.to_string()
    } else {
        host
    };

    let repository = if host == DEFAULT_REGISTRY && !repository.contains('/') {
        format!("{}/{}", OFFICIAL_NAMESPACE, repository)
    } else {
        repository
    };

    (host, repository)
}

fn looks_like_host(component: &str) -> bool {
    component.contains('.')
        || component.contains(':')
        || component == "localhost"
        || component.chars().any(|c| c.is_ascii_uppercase())
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry_host, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl FromStr for ImageReference {
    type Err = PullError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
