//! Kubernetes plumbing: client construction and listing of image pull secrets.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use std::path::Path;
use tracing::{debug, info};

use crate::keyring::PullSecret;

pub const SECRET_TYPE_DOCKER_CONFIG_JSON: &str = "kubernetes.io/dockerconfigjson";
pub const SECRET_TYPE_DOCKERCFG: &str = "kubernetes.io/dockercfg";

const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
const DOCKERCFG_KEY: &str = ".dockercfg";

/// Build a kube client.
///
/// An explicit kubeconfig file (and optionally a context in it) wins; otherwise the config is
/// inferred (in-cluster or `~/.kube/config`). `master` overrides the API server URL.
pub async fn client(
    kubeconfig: Option<&Path>,
    master: Option<&str>,
    context: Option<&str>,
) -> Result<Client> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        cluster: None,
        user: None,
    };

    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .context("Failed to load kubeconfig")?
        }
        None if context.is_some() => Config::from_kubeconfig(&options)
            .await
            .context("Failed to load kubeconfig")?,
        // In-cluster or ~/.kube/config
        None => Config::infer()
            .await
            .context("Failed to infer Kubernetes config")?,
    };

    if let Some(master) = master {
        config.cluster_url = master
            .parse()
            .with_context(|| format!("Invalid master URL {}", master))?;
    }

    debug!(cluster_url = %config.cluster_url, "Creating Kubernetes client");
    Client::try_from(config).context("Failed to create Kubernetes client")
}

/// List the image pull secrets of a namespace, or of all namespaces when `namespace` is `None`.
pub async fn list_pull_secrets(client: Client, namespace: Option<&str>) -> Result<Vec<PullSecret>> {
    let api: Api<Secret> = match namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };

    let secrets = api
        .list(&ListParams::default())
        .await
        .context("Failed to list secrets")?;

    let pull_secrets: Vec<PullSecret> = secrets.items.iter().filter_map(pull_secret_from).collect();
    info!(
        namespace = namespace.unwrap_or("<all>"),
        count = pull_secrets.len(),
        "Found image pull secrets"
    );
    Ok(pull_secrets)
}

/// Convert a Secret of a docker config type into a pull secret named `namespace/name`.
pub fn pull_secret_from(secret: &Secret) -> Option<PullSecret> {
    let (key, json) = match secret.type_.as_deref() {
        Some(SECRET_TYPE_DOCKER_CONFIG_JSON) => (DOCKER_CONFIG_JSON_KEY, true),
        Some(SECRET_TYPE_DOCKERCFG) => (DOCKERCFG_KEY, false),
        _ => return None,
    };

    let name = format!(
        "{}/{}",
        secret.metadata.namespace.as_deref().unwrap_or_default(),
        secret.metadata.name.as_deref().unwrap_or_default()
    );
    let Some(data) = secret.data.as_ref().and_then(|data| data.get(key)) else {
        debug!(secret = %name, key = key, "Pull secret has no data, skipping");
        return None;
    };
    let data = data.0.clone();

    Some(if json {
        PullSecret::DockerConfigJson { name, data }
    } else {
        PullSecret::DockerCfg { name, data }
    })
}
