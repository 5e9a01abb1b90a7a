use std::fmt;

use thiserror::Error;

/// Errors produced while resolving and pulling an image manifest.
///
/// Structural errors (`InvalidReference`, `InvalidEndpoint`, `InvalidSecret`) abort a pull
/// immediately. Remote failures (`Authentication`, `NotFound`, `Transport`, `InvalidManifest`)
/// are recorded per credential candidate and surface through `Aggregate` once every candidate
/// has been tried. A `Provider` failure only leaves its candidate without credentials.
#[derive(Debug, Error)]
pub enum PullError {
    #[error("Invalid image reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("Invalid registry endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Invalid pull secret {secret}: {reason}")]
    InvalidSecret { secret: String, reason: String },

    #[error("Authentication to {registry} failed (HTTP {status})")]
    Authentication { registry: String, status: u16 },

    #[error("Manifest {repository}:{reference} not found on {registry}")]
    NotFound {
        registry: String,
        repository: String,
        reference: String,
    },

    #[error("Transport error talking to {registry}: {message}")]
    Transport { registry: String, message: String },

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Credential provider {provider} failed: {message}")]
    Provider { provider: String, message: String },

    #[error("Pull cancelled")]
    Cancelled,

    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl PullError {
    pub(crate) fn invalid_reference(reference: &str, reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_endpoint(endpoint: &str, reason: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn transport(registry: &str, message: impl Into<String>) -> Self {
        Self::Transport {
            registry: registry.to_string(),
            message: message.into(),
        }
    }
}

/// One failed credential attempt.
#[derive(Debug)]
pub struct AttemptError {
    /// Registry the attempt was made against
    pub server_address: String,
    /// Username of the credential, empty for anonymous or provider failures
    pub username: String,
    pub error: PullError,
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.username.is_empty() {
            write!(f, "{}: {}", self.server_address, self.error)
        } else {
            write!(f, "{}@{}: {}", self.username, self.server_address, self.error)
        }
    }
}

/// Every failure collected while trying credential candidates, in attempt order.
#[derive(Debug, Default)]
pub struct AggregateError {
    attempts: Vec<AttemptError>,
}

impl AggregateError {
    pub fn new(attempts: Vec<AttemptError>) -> Self {
        Self { attempts }
    }

    pub fn attempts(&self) -> &[AttemptError] {
        &self.attempts
    }

    /// Underlying errors in attempt order
    pub fn errors(&self) -> impl Iterator<Item = &PullError> {
        self.attempts.iter().map(|a| &a.error)
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn into_attempts(self) -> Vec<AttemptError> {
        self.attempts
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.attempts.as_slice() {
            [] => write!(f, "no credential attempts were made"),
            [only] => write!(f, "{}", only),
            attempts => {
                write!(f, "all {} credential attempts failed: [", attempts.len())?;
                for (i, attempt) in attempts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", attempt)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl std::error::Error for AggregateError {}

impl IntoIterator for AggregateError {
    type Item = AttemptError;
    type IntoIter = std::vec::IntoIter<AttemptError>;

    fn into_iter(self) -> Self::IntoIter {
        self.attempts.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(username: &str, error: PullError) -> AttemptError {
        AttemptError {
            server_address: "https://registry.example.com".to_string(),
            username: username.to_string(),
            error,
        }
    }

    #[test]
    fn test_aggregate_display_lists_every_cause() {
        let aggregate = AggregateError::new(vec![
            attempt(
                "alice",
                PullError::Authentication {
                    registry: "https://registry.example.com".to_string(),
                    status: 401,
                },
            ),
            attempt("", PullError::transport("https://registry.example.com", "reset")),
        ]);

        let message = aggregate.to_string();
        assert!(message.starts_with("all 2 credential attempts failed"));
        assert!(message.contains("alice@https://registry.example.com"));
        assert!(message.contains("HTTP 401"));
        assert!(message.contains("reset"));
    }

    #[test]
    fn test_aggregate_single_attempt_displays_cause_only() {
        let aggregate = AggregateError::new(vec![attempt("", PullError::Cancelled)]);
        assert_eq!(
            aggregate.to_string(),
            "https://registry.example.com: Pull cancelled"
        );
    }

    #[test]
    fn test_aggregate_preserves_order() {
        let aggregate = AggregateError::new(vec![
            attempt("first", PullError::InvalidManifest("a".into())),
            attempt("second", PullError::InvalidManifest("b".into())),
        ]);

        let usernames: Vec<_> = aggregate.attempts().iter().map(|a| a.username.as_str()).collect();
        assert_eq!(usernames, vec!["first", "second"]);
        assert_eq!(aggregate.errors().count(), 2);
    }
}
