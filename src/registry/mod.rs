//! Registry v2 client: fetches one manifest with one credential, performing the
//! `WWW-Authenticate` handshake when the registry asks for it.

pub mod auth;
pub mod manifest;
pub mod transport;

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Method, Request, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::error::PullError;
use crate::keyring::AuthConfig;
use crate::settings::FetcherSettings;
use auth::Challenge;
pub use manifest::{DeserializedManifest, Descriptor, Manifest, SignedManifest};
use transport::{HttpResponse, HttpTransport, ReqwestTransport, TracingTransport};

/// Header carrying the canonical digest of a served manifest
const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// Retrieves a single manifest using a single resolved credential.
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    /// `auth.server_address` must hold the registry base URL (scheme included).
    async fn fetch(
        &self,
        repository: &str,
        reference: &str,
        auth: &AuthConfig,
    ) -> Result<Manifest, PullError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

pub struct RegistryClient {
    transport: Arc<dyn HttpTransport>,
}

impl RegistryClient {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    /// Build a client from the fetcher settings, wrapping the transport with request tracing
    /// when it is enabled.
    pub fn from_settings(settings: &FetcherSettings) -> reqwest::Result<Self> {
        let transport =
            ReqwestTransport::new(settings.connect_timeout(), settings.request_timeout())?;
        let transport: Arc<dyn HttpTransport> = if settings.trace_http {
            Arc::new(TracingTransport::new(transport, settings.trace_show_secrets))
        } else {
            Arc::new(transport)
        };
        Ok(Self::new(transport))
    }

    async fn get(
        &self,
        registry: &str,
        url: Url,
        accept: Option<&str>,
        authorization: Option<&str>,
    ) -> Result<HttpResponse, PullError> {
        let mut request = Request::new(Method::GET, url);
        if let Some(accept) = accept {
            request
                .headers_mut()
                .insert(ACCEPT, header_value(registry, accept)?);
        }
        if let Some(authorization) = authorization {
            let mut value = header_value(registry, authorization)?;
            value.set_sensitive(true);
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        self.transport.send(request).await.map_err(|e| {
            if e.is_timeout() {
                PullError::transport(registry, "request timed out")
            } else {
                PullError::transport(registry, e.to_string())
            }
        })
    }

    /// Exchange credentials for a bearer token at the challenge's realm.
    async fn fetch_token(
        &self,
        registry: &str,
        realm: &str,
        service: Option<&str>,
        scope: &str,
        auth: &AuthConfig,
    ) -> Result<String, PullError> {
        let mut url = Url::parse(realm).map_err(|e| {
            PullError::transport(registry, format!("invalid token realm {:?}: {}", realm, e))
        })?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = service {
                query.append_pair("service", service);
            }
            query.append_pair("scope", scope);
        }

        debug!(registry = %registry, realm = %realm, scope = %scope, "Requesting bearer token");

        let basic = token_service_credentials(auth).map(|token| format!("Basic {}", token));
        let response = self.get(registry, url, None, basic.as_deref()).await?;

        match response.status {
            status if status.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(PullError::Authentication {
                    registry: registry.to_string(),
                    status: response.status.as_u16(),
                })
            }
            status => {
                return Err(PullError::transport(
                    registry,
                    format!("token endpoint returned {}", status),
                ))
            }
        }

        let token: TokenResponse = serde_json::from_slice(&response.body).map_err(|e| {
            PullError::transport(registry, format!("invalid token response: {}", e))
        })?;
        token
            .token
            .or(token.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| PullError::transport(registry, "token response carried no token"))
    }

    /// Work out the Authorization header answering a 401 challenge, if one can be produced.
    async fn answer_challenge(
        &self,
        registry: &str,
        repository: &str,
        response: &HttpResponse,
        auth: &AuthConfig,
    ) -> Result<Option<String>, PullError> {
        let challenge = Challenge::select(
            response
                .headers
                .get_all(WWW_AUTHENTICATE)
                .iter()
                .filter_map(|value| value.to_str().ok()),
        );

        match challenge {
            Some(Challenge::Bearer {
                realm,
                service,
                scope,
            }) => {
                let scope = scope.unwrap_or_else(|| format!("repository:{}:pull", repository));
                let token = self
                    .fetch_token(registry, &realm, service.as_deref(), &scope, auth)
                    .await?;
                Ok(Some(format!("Bearer {}", token)))
            }
            Some(Challenge::Basic { .. }) => {
                Ok(auth.basic_token().map(|token| format!("Basic {}", token)))
            }
            None => {
                warn!(registry = %registry, "Registry returned 401 without a usable challenge");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl ManifestFetcher for RegistryClient {
    async fn fetch(
        &self,
        repository: &str,
        reference: &str,
        auth: &AuthConfig,
    ) -> Result<Manifest, PullError> {
        let server = auth.server_address.trim_end_matches('/');
        let registry = server
            .split_once("://")
            .map(|(_, host)| host)
            .unwrap_or(server);

        let url = Url::parse(&format!("{}/v2/{}/manifests/{}", server, repository, reference))
            .map_err(|e| PullError::invalid_endpoint(server, e.to_string()))?;
        let accept = manifest::ACCEPTED_MEDIA_TYPES.join(", ");

        debug!(registry = %registry, repository = %repository, reference = %reference, "Fetching manifest");

        let mut response = self.get(registry, url.clone(), Some(&accept), None).await?;

        if response.status == StatusCode::UNAUTHORIZED {
            if let Some(authorization) = self
                .answer_challenge(registry, repository, &response, auth)
                .await?
            {
                response = self
                    .get(registry, url, Some(&accept), Some(&authorization))
                    .await?;
            }
        }

        match response.status {
            StatusCode::OK => {
                let content_type = response.header(CONTENT_TYPE.as_str()).map(str::to_string);
                let digest = response.header(DOCKER_CONTENT_DIGEST).map(str::to_string);
                Manifest::decode(content_type.as_deref(), digest.as_deref(), response.body)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(PullError::Authentication {
                registry: registry.to_string(),
                status: response.status.as_u16(),
            }),
            StatusCode::NOT_FOUND => Err(PullError::NotFound {
                registry: registry.to_string(),
                repository: repository.to_string(),
                reference: reference.to_string(),
            }),
            status => Err(PullError::transport(
                registry,
                format!("unexpected status {}", status),
            )),
        }
    }
}

/// Credentials presented to a token service. An identity token replaces the password and is
/// paired with the username `<token>`.
fn token_service_credentials(auth: &AuthConfig) -> Option<String> {
    if auth.identity_token.is_empty() {
        auth.basic_token()
    } else {
        Some(
            base64::engine::general_purpose::STANDARD
                .encode(format!("<token>:{}", auth.identity_token)),
        )
    }
}

fn header_value(registry: &str, value: &str) -> Result<HeaderValue, PullError> {
    HeaderValue::from_str(value)
        .map_err(|e| PullError::transport(registry, format!("invalid header value: {}", e)))
}
