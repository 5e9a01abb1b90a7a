use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::CredentialProvider;
use crate::error::PullError;
use crate::keyring::AuthConfig;

const PROVIDER_NAME: &str = "gcr";

/// Username GCR and Artifact Registry accept together with an OAuth access token
const TOKEN_USERNAME: &str = "_token";

/// DMI product name, "Google" or "Google Compute Engine" on GCE VMs
const DMI_PRODUCT_NAME: &str = "/sys/class/dmi/id/product_name";

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
}

/// Google Container Registry / Artifact Registry credential provider.
///
/// Access tokens come from the GCE metadata server of the node the process runs on. The
/// provider is only enabled on GCE VMs, detected from the local DMI product name, so it never
/// talks to the metadata server until a pull asks it for credentials.
pub struct GcrProvider {
    http_client: reqwest::Client,
    token_url: String,
    on_gce: bool,
}

impl GcrProvider {
    pub fn new(token_url: &str) -> Result<Self, PullError> {
        let mut headers = HeaderMap::new();
        headers.insert("Metadata-Flavor", HeaderValue::from_static("Google"));

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| provider_error(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            token_url: token_url.to_string(),
            on_gce: running_on_gce(Path::new(DMI_PRODUCT_NAME)),
        })
    }
}

fn running_on_gce(product_name_file: &Path) -> bool {
    match std::fs::read_to_string(product_name_file) {
        Ok(name) => name.trim().starts_with("Google"),
        Err(e) => {
            debug!(path = %product_name_file.display(), error = %e, "Cannot read DMI product name");
            false
        }
    }
}

#[async_trait]
impl CredentialProvider for GcrProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn enabled(&self) -> bool {
        self.on_gce
    }

    fn matches(&self, host: &str) -> bool {
        let host = host.split(':').next().unwrap_or(host);
        host == "gcr.io" || host.ends_with(".gcr.io") || host.ends_with("-docker.pkg.dev")
    }

    async fn provide(&self, host: &str) -> Result<AuthConfig, PullError> {
        info!(host = %host, "Requesting access token from GCE metadata server");

        let response = self
            .http_client
            .get(&self.token_url)
            .send()
            .await
            .map_err(|e| provider_error(format!("Metadata server request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(provider_error(format!(
                "Metadata server returned status {}",
                response.status()
            )));
        }

        let token: MetadataToken = response
            .json()
            .await
            .map_err(|e| provider_error(format!("Invalid metadata token response: {}", e)))?;

        Ok(AuthConfig {
            username: TOKEN_USERNAME.to_string(),
            password: token.access_token,
            server_address: format!("https://{}", host),
            ..Default::default()
        })
    }
}

fn provider_error(message: String) -> PullError {
    PullError::Provider {
        provider: PROVIDER_NAME.to_string(),
        message,
    }
}
