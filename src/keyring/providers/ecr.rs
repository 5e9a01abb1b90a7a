use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ecr::Client as EcrClient;
use base64::Engine;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::OnceCell;
use tracing::info;

use super::CredentialProvider;
use crate::error::PullError;
use crate::keyring::AuthConfig;
use crate::settings::AwsSettings;

lazy_static! {
    static ref ECR_HOST_RE: Regex = Regex::new(
        r"^(?P<account>[0-9]{12})\.dkr\.ecr(?:-fips)?\.(?P<region>[a-z0-9-]+)\.amazonaws\.com(?:\.cn)?$"
    )
    .unwrap();
}

const PROVIDER_NAME: &str = "aws-ecr";

/// Parse `<account>.dkr.ecr.<region>.amazonaws.com` into (account, region).
pub fn parse_ecr_host(host: &str) -> Option<(String, String)> {
    let caps = ECR_HOST_RE.captures(host)?;
    Some((caps["account"].to_string(), caps["region"].to_string()))
}

/// AWS ECR credential provider.
///
/// The AWS config is only loaded on the first `provide` call, so registering the provider does
/// not touch the credential chain or the instance metadata service.
pub struct EcrProvider {
    settings: AwsSettings,
    sdk_config: OnceCell<aws_config::SdkConfig>,
}

impl EcrProvider {
    pub fn new(settings: AwsSettings) -> Self {
        Self {
            settings,
            sdk_config: OnceCell::new(),
        }
    }

    async fn client_for_region(&self, region: &str) -> EcrClient {
        let sdk_config = self
            .sdk_config
            .get_or_init(|| async {
                let loader = aws_config::defaults(BehaviorVersion::latest());
                let loader = match &self.settings.region {
                    Some(region) => loader.region(aws_config::Region::new(region.clone())),
                    None => loader,
                };
                if let (Some(access_key), Some(secret_key)) =
                    (&self.settings.access_key_id, &self.settings.secret_access_key)
                {
                    let creds = aws_sdk_ecr::config::Credentials::new(
                        access_key, secret_key, None, None, "static",
                    );
                    loader.credentials_provider(creds).load().await
                } else {
                    // Default credential chain (IAM role, env vars, etc.)
                    loader.load().await
                }
            })
            .await;

        let config = aws_sdk_ecr::config::Builder::from(sdk_config)
            .region(aws_sdk_ecr::config::Region::new(region.to_string()))
            .build();
        EcrClient::from_conf(config)
    }
}

#[async_trait]
impl CredentialProvider for EcrProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn matches(&self, host: &str) -> bool {
        ECR_HOST_RE.is_match(host)
    }

    async fn provide(&self, host: &str) -> Result<AuthConfig, PullError> {
        let (account_id, region) = parse_ecr_host(host).ok_or_else(|| PullError::Provider {
            provider: PROVIDER_NAME.to_string(),
            message: format!("{} is not an ECR registry host", host),
        })?;

        info!(host = %host, region = %region, "Requesting ECR authorization token");

        let client = self.client_for_region(&region).await;
        let response = client
            .get_authorization_token()
            .registry_ids(&account_id)
            .send()
            .await
            .map_err(|e| provider_error(format!("GetAuthorizationToken failed: {:?}", e)))?;

        let auth_data = response
            .authorization_data()
            .first()
            .ok_or_else(|| provider_error("No authorization data returned from ECR".into()))?;

        let token = auth_data
            .authorization_token()
            .ok_or_else(|| provider_error("No authorization token in response".into()))?;

        let (username, password) = decode_ecr_token(token)?;

        let server_address = auth_data
            .proxy_endpoint()
            .map(str::to_string)
            .unwrap_or_else(|| format!("https://{}", host));

        Ok(AuthConfig {
            username,
            password,
            auth: token.to_string(),
            server_address,
            ..Default::default()
        })
    }
}

/// Decode the base64 token (format is "AWS:password")
fn decode_ecr_token(token: &str) -> Result<(String, String), PullError> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(token)
        .map_err(|e| provider_error(format!("Failed to decode ECR token: {}", e)))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| provider_error("ECR token is not valid UTF-8".into()))?;

    match decoded.split_once(':') {
        Some((username, password)) => Ok((username.to_string(), password.to_string())),
        None => Err(provider_error("Invalid ECR token format".into())),
    }
}

fn provider_error(message: String) -> PullError {
    PullError::Provider {
        provider: PROVIDER_NAME.to_string(),
        message,
    }
}
