use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::info;

use super::CredentialProvider;
use crate::error::PullError;
use crate::keyring::AuthConfig;
use crate::settings::AzureSettings;

lazy_static! {
    static ref ACR_HOST_RE: Regex =
        Regex::new(r"^[a-z0-9][a-z0-9.-]*\.azurecr\.(?:io|cn|de|us)$").unwrap();
}

const PROVIDER_NAME: &str = "azure-acr";

/// Username ACR expects together with a refresh token
const REFRESH_TOKEN_USERNAME: &str = "00000000-0000-0000-0000-000000000000";

/// Cloud provider config file, the `azure.json` a node's kubelet is started with
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct AzureConfig {
    #[serde(default)]
    cloud: String,
    #[serde(default)]
    tenant_id: String,
    #[serde(default, rename = "aadClientId")]
    aad_client_id: String,
    #[serde(default, rename = "aadClientSecret")]
    aad_client_secret: String,
    #[serde(default)]
    use_managed_identity_extension: bool,
    #[serde(default, rename = "userAssignedIdentityID")]
    user_assigned_identity_id: String,
}

impl AzureConfig {
    /// ARM resource a managed identity token is requested for
    fn management_resource(&self) -> &'static str {
        match self.cloud.to_ascii_lowercase().as_str() {
            "azurechinacloud" => "https://management.chinacloudapi.cn/",
            "azureusgovernmentcloud" => "https://management.usgovcloudapi.net/",
            "azuregermancloud" => "https://management.microsoftazure.de/",
            _ => "https://management.azure.com/",
        }
    }
}

#[derive(Deserialize)]
struct AadToken {
    access_token: String,
}

#[derive(Deserialize)]
struct RefreshToken {
    refresh_token: String,
}

/// Azure Container Registry credential provider.
///
/// With a service principal in the cloud config its client id and secret are used directly.
/// With a managed identity, an AAD token from the instance metadata service is exchanged for an
/// ACR refresh token. The config file is read on the first `provide` call.
pub struct AcrProvider {
    settings: AzureSettings,
    http_client: reqwest::Client,
    config: OnceCell<AzureConfig>,
}

impl AcrProvider {
    pub fn new(settings: AzureSettings) -> Result<Self, PullError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| provider_error(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            settings,
            http_client,
            config: OnceCell::new(),
        })
    }

    async fn config(&self) -> Result<&AzureConfig, PullError> {
        self.config
            .get_or_try_init(|| async {
                match &self.settings.config_file {
                    Some(path) => load_azure_config(Path::new(path)),
                    None => Err(provider_error("No Azure cloud config file configured".into())),
                }
            })
            .await
    }

    /// Fetch an AAD access token for the managed identity from the instance metadata service.
    async fn aad_token(&self, config: &AzureConfig) -> Result<String, PullError> {
        let mut headers = HeaderMap::new();
        headers.insert("Metadata", HeaderValue::from_static("true"));

        let mut query = vec![
            ("api-version", "2018-02-01"),
            ("resource", config.management_resource()),
        ];
        if !config.user_assigned_identity_id.is_empty() {
            query.push(("client_id", config.user_assigned_identity_id.as_str()));
        }

        let response = self
            .http_client
            .get(&self.settings.imds_token_url)
            .headers(headers)
            .query(&query)
            .send()
            .await
            .map_err(|e| provider_error(format!("Managed identity token request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(provider_error(format!(
                "Instance metadata service returned status {}",
                response.status()
            )));
        }

        let token: AadToken = response
            .json()
            .await
            .map_err(|e| provider_error(format!("Invalid managed identity token: {}", e)))?;
        Ok(token.access_token)
    }

    /// Exchange an AAD access token for an ACR refresh token at `<login_server>/oauth2/exchange`.
    async fn exchange_refresh_token(
        &self,
        login_server: &str,
        host: &str,
        tenant_id: &str,
        aad_token: &str,
    ) -> Result<String, PullError> {
        let response = self
            .http_client
            .post(format!("{}/oauth2/exchange", login_server.trim_end_matches('/')))
            .form(&[
                ("grant_type", "access_token"),
                ("service", host),
                ("tenant", tenant_id),
                ("access_token", aad_token),
            ])
            .send()
            .await
            .map_err(|e| provider_error(format!("ACR token exchange failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(provider_error(format!(
                "ACR token exchange returned status {}",
                response.status()
            )));
        }

        let token: RefreshToken = response
            .json()
            .await
            .map_err(|e| provider_error(format!("Invalid ACR exchange response: {}", e)))?;
        Ok(token.refresh_token)
    }
}

#[async_trait]
impl CredentialProvider for AcrProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn enabled(&self) -> bool {
        self.settings.config_file.is_some()
    }

    fn matches(&self, host: &str) -> bool {
        ACR_HOST_RE.is_match(host)
    }

    async fn provide(&self, host: &str) -> Result<AuthConfig, PullError> {
        let config = self.config().await?;
        let server_address = format!("https://{}", host);

        if !config.use_managed_identity_extension {
            return Ok(AuthConfig {
                username: config.aad_client_id.clone(),
                password: config.aad_client_secret.clone(),
                server_address,
                ..Default::default()
            });
        }

        info!(host = %host, "Exchanging managed identity token for an ACR refresh token");
        let aad_token = self.aad_token(config).await?;
        let refresh_token = self
            .exchange_refresh_token(&server_address, host, &config.tenant_id, &aad_token)
            .await?;

        Ok(AuthConfig {
            username: REFRESH_TOKEN_USERNAME.to_string(),
            password: refresh_token,
            server_address,
            ..Default::default()
        })
    }
}

fn load_azure_config(path: &Path) -> Result<AzureConfig, PullError> {
    let data = std::fs::read(path).map_err(|e| {
        provider_error(format!("Failed to read {}: {}", path.display(), e))
    })?;
    serde_json::from_slice(&data)
        .map_err(|e| provider_error(format!("Invalid Azure config {}: {}", path.display(), e)))
}

fn provider_error(message: String) -> PullError {
    PullError::Provider {
        provider: PROVIDER_NAME.to_string(),
        message,
    }
}
