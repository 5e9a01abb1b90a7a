//! Pull orchestration: resolve an image reference to its registry, enumerate candidate
//! credentials and try them in order until one yields the manifest.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, EndpointNormalizer};
use crate::error::{AggregateError, AttemptError, PullError};
use crate::keyring::{AuthConfig, Keyring, LazyCredential, ProviderRegistry, PullSecret};
use crate::reference::ImageReference;
use crate::registry::{Manifest, ManifestFetcher};

const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ImagePuller {
    fetcher: Arc<dyn ManifestFetcher>,
    providers: ProviderRegistry,
    normalizer: EndpointNormalizer,
    attempt_timeout: Duration,
}

impl ImagePuller {
    pub fn new(fetcher: Arc<dyn ManifestFetcher>, providers: ProviderRegistry) -> Self {
        Self {
            fetcher,
            providers,
            normalizer: EndpointNormalizer::default(),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    pub fn with_normalizer(mut self, normalizer: EndpointNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Fetch the manifest of `image` using the credentials in `secrets` and the registered
    /// providers.
    ///
    /// Candidates are tried strictly one at a time. The first success wins; when every candidate
    /// fails, the returned `Aggregate` error lists each failure in attempt order. With no
    /// matching credentials a single anonymous attempt is made and its error returned as is.
    pub async fn pull(
        &self,
        image: &str,
        secrets: &[PullSecret],
        cancel: &CancellationToken,
    ) -> Result<Manifest, PullError> {
        let reference = ImageReference::parse(image)?;
        let reference_str = reference
            .effective_ref()
            .ok_or_else(|| PullError::invalid_reference(image, "no tag or digest"))?
            .to_string();
        let endpoint = self.normalizer.normalize(&reference.registry_host)?;
        let keyring = Keyring::build(secrets, &self.providers)?;

        let name = reference.name();
        let (candidates, found) = keyring.lookup(&name);

        if !found {
            info!(image = %reference, endpoint = %endpoint, "No credentials found, pulling anonymously");
            let auth = AuthConfig::anonymous(endpoint.as_str());
            return self
                .attempt(&reference.repository, &reference_str, &auth, cancel)
                .await;
        }

        info!(
            image = %reference,
            endpoint = %endpoint,
            candidates = candidates.len(),
            "Pulling manifest"
        );

        let mut attempts = Vec::with_capacity(candidates.len());
        for (index, candidate) in candidates.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(PullError::Cancelled);
            }

            // A provider that cannot issue credentials leaves its candidate anonymous
            let auth = match self.materialize(candidate, &endpoint, cancel).await {
                Ok(auth) => auth,
                Err(PullError::Cancelled) => return Err(PullError::Cancelled),
                Err(error) => {
                    warn!(
                        source = candidate.source(),
                        error = %error,
                        "Could not obtain credentials, trying anonymously"
                    );
                    AuthConfig::anonymous(endpoint.as_str())
                }
            };

            debug!(
                attempt = index + 1,
                source = candidate.source(),
                server = %auth.server_address,
                username = %auth.username,
                "Trying credentials"
            );

            match self
                .attempt(&reference.repository, &reference_str, &auth, cancel)
                .await
            {
                Ok(manifest) => {
                    info!(
                        image = %reference,
                        source = candidate.source(),
                        schema_version = manifest.schema_version(),
                        "Pulled manifest"
                    );
                    return Ok(manifest);
                }
                Err(PullError::Cancelled) => return Err(PullError::Cancelled),
                Err(error) => {
                    warn!(
                        source = candidate.source(),
                        server = %auth.server_address,
                        username = %auth.username,
                        error = %error,
                        "Credential attempt failed"
                    );
                    attempts.push(AttemptError {
                        server_address: auth.server_address,
                        username: auth.username,
                        error,
                    });
                }
            }
        }

        Err(AggregateError::new(attempts).into())
    }

    /// Produce a candidate's credential with its server address pointing at a normalized
    /// endpoint.
    async fn materialize(
        &self,
        candidate: &LazyCredential,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<AuthConfig, PullError> {
        let mut auth = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PullError::Cancelled),
            result = candidate.provide() => result?,
        };

        auth.server_address = if auth.server_address.trim().is_empty() {
            endpoint.to_string()
        } else {
            self.normalizer.normalize(&auth.server_address)?.to_string()
        };
        Ok(auth)
    }

    /// One fetch under the per-attempt deadline, aborted when `cancel` fires.
    async fn attempt(
        &self,
        repository: &str,
        reference: &str,
        auth: &AuthConfig,
        cancel: &CancellationToken,
    ) -> Result<Manifest, PullError> {
        let fetch = tokio::time::timeout(
            self.attempt_timeout,
            self.fetcher.fetch(repository, reference, auth),
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PullError::Cancelled),
            result = fetch => match result {
                Ok(result) => result,
                Err(_) => Err(PullError::transport(
                    &auth.server_address,
                    format!("timed out after {:?}", self.attempt_timeout),
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::{CredentialProvider, DockerConfig};
    use crate::registry::DeserializedManifest;
    use async_trait::async_trait;
    use base64::Engine;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Call = (String, String, AuthConfig);

    /// Fetcher that answers from a scripted queue and records every call
    struct FakeFetcher {
        calls: Mutex<Vec<Call>>,
        results: Mutex<Vec<Result<Manifest, PullError>>>,
        delay: Option<Duration>,
    }

    impl FakeFetcher {
        fn new(results: Vec<Result<Manifest, PullError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                results: Mutex::new(results.into_iter().rev().collect()),
                delay: None,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                results: Mutex::new(Vec::new()),
                delay: Some(delay),
            })
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ManifestFetcher for FakeFetcher {
        async fn fetch(
            &self,
            repository: &str,
            reference: &str,
            auth: &AuthConfig,
        ) -> Result<Manifest, PullError> {
            self.calls.lock().unwrap().push((
                repository.to_string(),
                reference.to_string(),
                auth.clone(),
            ));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(manifest()))
        }
    }

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }

        fn matches(&self, host: &str) -> bool {
            host == "registry.example.com"
        }

        async fn provide(&self, host: &str) -> Result<AuthConfig, PullError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AuthConfig {
                username: "provided".to_string(),
                password: "token".to_string(),
                server_address: host.to_string(),
                ..Default::default()
            })
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl CredentialProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }

        fn matches(&self, _host: &str) -> bool {
            true
        }

        async fn provide(&self, _host: &str) -> Result<AuthConfig, PullError> {
            Err(PullError::Provider {
                provider: "failing".to_string(),
                message: "metadata server unavailable".to_string(),
            })
        }
    }

    fn manifest() -> Manifest {
        Manifest::V2(DeserializedManifest {
            schema_version: 2,
            media_type: None,
            config: crate::registry::Descriptor {
                media_type: "application/vnd.docker.container.image.v1+json".to_string(),
                digest: "sha256:abc".to_string(),
                size: 1,
                urls: Vec::new(),
            },
            layers: Vec::new(),
            raw: Bytes::from_static(b"{}"),
            digest: "sha256:def".to_string(),
        })
    }

    fn auth_error() -> Result<Manifest, PullError> {
        Err(PullError::Authentication {
            registry: "registry.example.com".to_string(),
            status: 401,
        })
    }

    fn secret(name: &str, server: &str, users: &[&str]) -> PullSecret {
        let auths: serde_json::Map<String, serde_json::Value> = users
            .iter()
            .enumerate()
            .map(|(i, user)| {
                // Distinct keys that all match `server`
                let key = if i == 0 {
                    server.to_string()
                } else {
                    format!("https://{}", server)
                };
                let auth = base64::engine::general_purpose::STANDARD.encode(format!("{}:pw", user));
                (key, serde_json::json!({ "auth": auth }))
            })
            .collect();
        PullSecret::DockerConfigJson {
            name: name.to_string(),
            data: serde_json::json!({ "auths": auths }).to_string().into_bytes(),
        }
    }

    fn usernames(calls: &[Call]) -> Vec<String> {
        calls.iter().map(|(_, _, auth)| auth.username.clone()).collect()
    }

    #[tokio::test]
    async fn test_no_credentials_pulls_anonymously_once() {
        let fetcher = FakeFetcher::new(vec![]);
        let puller = ImagePuller::new(fetcher.clone(), ProviderRegistry::new());

        let manifest = puller
            .pull("nginx:1.13", &[], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(manifest.schema_version(), 2);
        let calls = fetcher.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "library/nginx");
        assert_eq!(calls[0].1, "1.13");
        assert!(calls[0].2.is_anonymous());
        assert_eq!(calls[0].2.server_address, "https://registry-1.docker.io");
    }

    #[tokio::test]
    async fn test_anonymous_failure_is_returned_directly() {
        let fetcher = FakeFetcher::new(vec![Err(PullError::NotFound {
            registry: "registry-1.docker.io".to_string(),
            repository: "library/nginx".to_string(),
            reference: "1.13".to_string(),
        })]);
        let puller = ImagePuller::new(fetcher.clone(), ProviderRegistry::new());

        let err = puller
            .pull("nginx:1.13", &[], &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PullError::NotFound { .. }));
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_voyager_reference_uses_hub_endpoint() {
        let fetcher = FakeFetcher::new(vec![]);
        let puller = ImagePuller::new(fetcher.clone(), ProviderRegistry::new());

        puller
            .pull("docker.io/appscode/voyager:6.0.0", &[], &CancellationToken::new())
            .await
            .unwrap();

        let calls = fetcher.calls();
        assert_eq!(calls[0].0, "appscode/voyager");
        assert_eq!(calls[0].1, "6.0.0");
        assert_eq!(calls[0].2.server_address, "https://registry-1.docker.io");
    }

    #[tokio::test]
    async fn test_missing_tag_and_digest_makes_no_fetch() {
        let fetcher = FakeFetcher::new(vec![]);
        let puller = ImagePuller::new(fetcher.clone(), ProviderRegistry::new());

        let err = puller
            .pull("onlyhost", &[], &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PullError::InvalidReference { .. }));
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_reference_makes_no_fetch() {
        let fetcher = FakeFetcher::new(vec![]);
        let puller = ImagePuller::new(fetcher.clone(), ProviderRegistry::new());

        let err = puller
            .pull("Not A Reference", &[], &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PullError::InvalidReference { .. }));
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_first_candidate_success_fetches_once() {
        let fetcher = FakeFetcher::new(vec![]);
        let puller = ImagePuller::new(fetcher.clone(), ProviderRegistry::new());
        let secrets = [secret("ns/pull", "registry.example.com", &["first", "second"])];

        puller
            .pull("registry.example.com/team/app:1.0", &secrets, &CancellationToken::new())
            .await
            .unwrap();

        let calls = fetcher.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2.server_address, "https://registry.example.com");
    }

    #[tokio::test]
    async fn test_falls_back_to_next_candidate() {
        let fetcher = FakeFetcher::new(vec![auth_error(), Ok(manifest())]);
        let puller = ImagePuller::new(fetcher.clone(), ProviderRegistry::new());
        let secrets = [
            secret("ns/a", "registry.example.com", &["alice"]),
            secret("ns/b", "registry.example.com/team", &["bob"]),
        ];

        let manifest = puller
            .pull("registry.example.com/team/app:1.0", &secrets, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(manifest.digest(), Some("sha256:def"));
        // The more specific key comes first
        assert_eq!(usernames(&fetcher.calls()), vec!["bob", "alice"]);
    }

    #[tokio::test]
    async fn test_all_candidates_fail_aggregates_in_order() {
        let fetcher = FakeFetcher::new(vec![
            auth_error(),
            Err(PullError::transport("registry.example.com", "connection reset")),
            auth_error(),
        ]);
        let puller = ImagePuller::new(fetcher.clone(), ProviderRegistry::new());
        let secrets = [
            secret("ns/a", "registry.example.com", &["one", "two"]),
            secret("ns/b", "registry.example.com", &["three"]),
        ];

        let err = puller
            .pull("registry.example.com/team/app:1.0", &secrets, &CancellationToken::new())
            .await
            .unwrap_err();

        let aggregate = match err {
            PullError::Aggregate(aggregate) => aggregate,
            other => panic!("expected an aggregate error, got {:?}", other),
        };
        assert_eq!(aggregate.len(), 3);
        let attempted: Vec<&str> = aggregate
            .attempts()
            .iter()
            .map(|a| a.username.as_str())
            .collect();
        assert_eq!(attempted, usernames(&fetcher.calls()));
        assert!(matches!(
            aggregate.attempts()[1].error,
            PullError::Transport { .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_secret_aborts_before_fetching() {
        let fetcher = FakeFetcher::new(vec![]);
        let puller = ImagePuller::new(fetcher.clone(), ProviderRegistry::new());
        let secrets = [PullSecret::DockerConfigJson {
            name: "ns/broken".to_string(),
            data: b"{".to_vec(),
        }];

        let err = puller
            .pull("nginx:1.13", &secrets, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PullError::InvalidSecret { .. }));
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_providers_are_lazy() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let mut providers = ProviderRegistry::new();
        providers.register(provider.clone());

        let fetcher = FakeFetcher::new(vec![]);
        let puller = ImagePuller::new(fetcher.clone(), providers);
        let secrets = [secret("ns/pull", "registry.example.com", &["static"])];

        puller
            .pull("registry.example.com/team/app:1.0", &secrets, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert_eq!(usernames(&fetcher.calls()), vec!["static"]);
    }

    #[tokio::test]
    async fn test_provider_credentials_are_normalized() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let mut providers = ProviderRegistry::new();
        providers.register(provider.clone());

        let fetcher = FakeFetcher::new(vec![]);
        let puller = ImagePuller::new(fetcher.clone(), providers);

        puller
            .pull("registry.example.com/team/app:1.0", &[], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        let calls = fetcher.calls();
        assert_eq!(calls[0].2.username, "provided");
        assert_eq!(calls[0].2.server_address, "https://registry.example.com");
    }

    fn failing_providers() -> ProviderRegistry {
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(FailingProvider));
        let local = DockerConfig::from_config_json(
            "local",
            br#"{"auths": {"other.example.com": {"username": "x", "password": "y"}}}"#,
        )
        .unwrap();
        providers.add_local_config("local docker config", local);
        providers
    }

    #[tokio::test]
    async fn test_failed_providers_fall_back_to_anonymous() {
        let fetcher = FakeFetcher::new(vec![]);
        let puller = ImagePuller::new(fetcher.clone(), failing_providers());

        puller
            .pull("registry.example.com/team/app:1.0", &[], &CancellationToken::new())
            .await
            .unwrap();

        let calls = fetcher.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].2.is_anonymous());
    }

    #[tokio::test]
    async fn test_failed_provider_candidates_are_each_fetched_once() {
        let fetcher = FakeFetcher::new(vec![auth_error(), auth_error()]);
        let mut providers = failing_providers();
        providers.register(Arc::new(FailingProvider));
        let puller = ImagePuller::new(fetcher.clone(), providers);

        let err = puller
            .pull("gcr.io/proj/app:1", &[], &CancellationToken::new())
            .await
            .unwrap_err();

        let aggregate = match err {
            PullError::Aggregate(aggregate) => aggregate,
            other => panic!("expected an aggregate error, got {:?}", other),
        };
        let calls = fetcher.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(aggregate.len(), calls.len());
        assert!(calls.iter().all(|(_, _, auth)| auth.is_anonymous()));
        assert!(aggregate
            .errors()
            .all(|e| matches!(e, PullError::Authentication { .. })));
        assert_eq!(aggregate.attempts()[0].server_address, "https://gcr.io");
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let fetcher = FakeFetcher::new(vec![]);
        let puller = ImagePuller::new(fetcher.clone(), ProviderRegistry::new());
        let secrets = [secret("ns/pull", "registry.example.com", &["a", "b"])];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = puller
            .pull("registry.example.com/team/app:1.0", &secrets, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, PullError::Cancelled));
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_fetch() {
        let fetcher = FakeFetcher::slow(Duration::from_secs(60));
        let puller = ImagePuller::new(fetcher.clone(), ProviderRegistry::new());
        let secrets = [secret("ns/pull", "registry.example.com", &["a", "b"])];
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = puller
            .pull("registry.example.com/team/app:1.0", &secrets, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, PullError::Cancelled));
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_recorded() {
        let fetcher = FakeFetcher::slow(Duration::from_secs(60));
        let puller = ImagePuller::new(fetcher.clone(), ProviderRegistry::new())
            .with_attempt_timeout(Duration::from_millis(20));
        let secrets = [secret("ns/pull", "registry.example.com", &["a", "b"])];

        let err = puller
            .pull("registry.example.com/team/app:1.0", &secrets, &CancellationToken::new())
            .await
            .unwrap_err();

        let aggregate = match err {
            PullError::Aggregate(aggregate) => aggregate,
            other => panic!("expected an aggregate error, got {:?}", other),
        };
        assert_eq!(aggregate.len(), 2);
        assert!(aggregate
            .errors()
            .all(|e| matches!(e, PullError::Transport { message, .. } if message.starts_with("timed out"))));
    }
}
