use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kube_image_puller::{
    cluster, EndpointNormalizer, ImagePuller, Manifest, ProviderRegistry, RegistryClient,
    Settings,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Image to resolve, e.g. "nginx:1.13" or "registry.example.com/team/app@sha256:..."
    #[arg(long, default_value = "appscode/voyager:6.0.0")]
    image: String,

    /// Kubernetes API server URL, overrides the kubeconfig
    #[arg(long)]
    master: Option<String>,

    /// Path to a kubeconfig file
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long)]
    context: Option<String>,

    /// Namespace to read image pull secrets from (all namespaces if omitted)
    #[arg(long, short = 'n')]
    namespace: Option<String>,

    /// Do not read image pull secrets from the cluster
    #[arg(long)]
    no_cluster_secrets: bool,

    /// Overall deadline for the pull, in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Deadline for each credential attempt, in seconds
    #[arg(long)]
    attempt_timeout: Option<u64>,

    /// Log registry requests as cURL commands and dump raw responses (RUST_LOG=debug)
    #[arg(long)]
    trace_http: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut settings = Settings::new().context("Failed to load settings")?;
    if let Some(secs) = cli.attempt_timeout {
        settings.fetcher.attempt_timeout_secs = secs.max(1);
    }
    if cli.trace_http {
        settings.fetcher.trace_http = true;
    }

    let secrets = if cli.no_cluster_secrets {
        Vec::new()
    } else {
        let client = cluster::client(
            cli.kubeconfig.as_deref(),
            cli.master.as_deref(),
            cli.context.as_deref(),
        )
        .await?;
        cluster::list_pull_secrets(client, cli.namespace.as_deref()).await?
    };

    let providers =
        ProviderRegistry::from_settings(&settings).context("Failed to set up credential sources")?;
    let fetcher = RegistryClient::from_settings(&settings.fetcher)
        .context("Failed to create registry HTTP client")?;
    let puller = ImagePuller::new(Arc::new(fetcher), providers)
        .with_normalizer(EndpointNormalizer::from_settings(&settings.registry))
        .with_attempt_timeout(settings.fetcher.attempt_timeout());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling pull");
            on_signal.cancel();
        }
    });
    if let Some(secs) = cli.timeout {
        let on_deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            warn!(timeout_secs = secs, "Deadline reached, cancelling pull");
            on_deadline.cancel();
        });
    }

    info!(image = %cli.image, secrets = secrets.len(), "Resolving image");
    let manifest = puller
        .pull(&cli.image, &secrets, &cancel)
        .await
        .with_context(|| format!("Failed to pull manifest for {}", cli.image))?;

    let raw = String::from_utf8_lossy(manifest.raw());
    match &manifest {
        Manifest::V1(_) => println!("V1 Manifest: {}", raw),
        Manifest::V2(_) => println!("V2 Manifest: {}", raw),
    }

    Ok(())
}
