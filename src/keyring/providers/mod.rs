pub mod acr;
#[cfg(feature = "aws")]
pub mod ecr;
pub mod gcr;

use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{AuthConfig, DockerConfig};
use crate::error::PullError;
use crate::settings::Settings;

pub use acr::AcrProvider;
#[cfg(feature = "aws")]
pub use ecr::EcrProvider;
pub use gcr::GcrProvider;

/// A source of registry credentials that can synthesize them on demand for hosts it recognizes
/// (e.g. a managed registry backed by a cloud metadata service).
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Provider identifier used in logs and errors
    fn name(&self) -> &str;

    /// Whether the provider should take part in lookups at all
    fn enabled(&self) -> bool {
        true
    }

    /// Whether this provider can serve credentials for a registry host
    fn matches(&self, host: &str) -> bool;

    /// Issue credentials for a registry host. May perform network calls.
    async fn provide(&self, host: &str) -> Result<AuthConfig, PullError>;
}

/// Caches a provider's credentials per host for a fixed TTL.
pub struct CachingProvider<P> {
    inner: P,
    cache: Cache<String, AuthConfig>,
}

impl<P: CredentialProvider> CachingProvider<P> {
    pub fn new(inner: P, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .time_to_live(ttl)
            .max_capacity(1_000)
            .build();
        Self { inner, cache }
    }
}

#[async_trait]
impl<P: CredentialProvider> CredentialProvider for CachingProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn enabled(&self) -> bool {
        self.inner.enabled()
    }

    fn matches(&self, host: &str) -> bool {
        self.inner.matches(host)
    }

    async fn provide(&self, host: &str) -> Result<AuthConfig, PullError> {
        self.cache
            .try_get_with(host.to_string(), async {
                debug!(provider = self.inner.name(), host = %host, "Requesting fresh credentials");
                self.inner.provide(host).await
            })
            .await
            .map_err(|shared| {
                Arc::try_unwrap(shared).unwrap_or_else(|shared| PullError::Provider {
                    provider: self.inner.name().to_string(),
                    message: shared.to_string(),
                })
            })
    }
}

/// The process-wide credential sources, passed explicitly into keyring construction:
/// local docker config documents and registered providers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    local_configs: Vec<(String, DockerConfig)>,
    providers: Vec<Arc<dyn CredentialProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider. Providers are consulted in registration order.
    pub fn register(&mut self, provider: Arc<dyn CredentialProvider>) {
        self.providers.push(provider);
    }

    pub fn add_local_config(&mut self, source: impl Into<String>, config: DockerConfig) {
        self.local_configs.push((source.into(), config));
    }

    pub fn local_configs(&self) -> impl Iterator<Item = (&str, &DockerConfig)> {
        self.local_configs
            .iter()
            .map(|(source, config)| (source.as_str(), config))
    }

    pub fn enabled_providers(&self) -> Vec<Arc<dyn CredentialProvider>> {
        self.providers
            .iter()
            .filter(|provider| provider.enabled())
            .cloned()
            .collect()
    }

    /// Build the registry described by the keyring settings. Registering is side-effect free:
    /// no provider talks to the network until it is asked for credentials.
    pub fn from_settings(settings: &Settings) -> Result<Self, PullError> {
        let mut registry = Self::new();
        let ttl = settings.keyring.provider_cache_ttl();

        if settings.keyring.docker_config_file {
            if let Some(config) = DockerConfig::load_default()? {
                info!(
                    entries = config.entries().len(),
                    "Using local docker config credentials"
                );
                registry.add_local_config("local docker config", config);
            }
        }

        #[cfg(feature = "aws")]
        if settings.keyring.ecr {
            registry.register(Arc::new(CachingProvider::new(
                EcrProvider::new(settings.aws.clone()),
                ttl,
            )));
        }

        if settings.keyring.gcr {
            let provider = GcrProvider::new(&settings.keyring.gce_metadata_token_url)?;
            registry.register(Arc::new(CachingProvider::new(provider, ttl)));
        }

        if settings.keyring.acr {
            let provider = AcrProvider::new(settings.azure.clone())?;
            registry.register(Arc::new(CachingProvider::new(provider, ttl)));
        }

        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyProvider {
        calls: AtomicUsize,
        enabled: bool,
    }

    #[async_trait]
    impl CredentialProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        fn enabled(&self) -> bool {
            self.enabled
        }

        fn matches(&self, _host: &str) -> bool {
            true
        }

        async fn provide(&self, host: &str) -> Result<AuthConfig, PullError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                return Err(PullError::Provider {
                    provider: "flaky".to_string(),
                    message: "metadata server unavailable".to_string(),
                });
            }
            Ok(AuthConfig {
                username: format!("user-{}", call),
                server_address: format!("https://{}", host),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn test_caching_provider_reuses_credentials_but_not_errors() {
        let provider = CachingProvider::new(
            FlakyProvider {
                calls: AtomicUsize::new(0),
                enabled: true,
            },
            Duration::from_secs(60),
        );

        let first = provider.provide("r.example.com").await;
        assert!(matches!(first, Err(PullError::Provider { .. })));

        let second = provider.provide("r.example.com").await.unwrap();
        let third = provider.provide("r.example.com").await.unwrap();
        assert_eq!(second.username, "user-1");
        assert_eq!(third.username, "user-1");
        assert_eq!(provider.inner.calls.load(Ordering::SeqCst), 2);

        let other_host = provider.provide("other.example.com").await.unwrap();
        assert_eq!(other_host.username, "user-2");
    }

    #[test]
    fn test_disabled_providers_are_skipped() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(FlakyProvider {
            calls: AtomicUsize::new(0),
            enabled: false,
        }));
        registry.register(Arc::new(FlakyProvider {
            calls: AtomicUsize::new(0),
            enabled: true,
        }));

        assert_eq!(registry.enabled_providers().len(), 1);
    }
}
