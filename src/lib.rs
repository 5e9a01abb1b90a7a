//! Resolve a container image reference against Kubernetes image pull secrets, local docker
//! credentials and cloud credential providers, then fetch its manifest from the registry.

pub mod cluster;
pub mod endpoint;
pub mod error;
pub mod keyring;
pub mod puller;
pub mod reference;
pub mod registry;
pub mod settings;

pub use endpoint::{Endpoint, EndpointNormalizer};
pub use error::{AggregateError, AttemptError, PullError};
pub use keyring::{AuthConfig, CredentialProvider, Keyring, ProviderRegistry, PullSecret};
pub use puller::ImagePuller;
pub use reference::ImageReference;
pub use registry::{Manifest, ManifestFetcher, RegistryClient};
pub use settings::Settings;
