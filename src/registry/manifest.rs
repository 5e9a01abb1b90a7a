use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PullError;

pub const MEDIA_TYPE_SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const MEDIA_TYPE_SCHEMA1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const MEDIA_TYPE_SCHEMA2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Media types sent in the `Accept` header of manifest requests, most preferred first
pub const ACCEPTED_MEDIA_TYPES: [&str; 4] = [
    MEDIA_TYPE_SCHEMA2,
    MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_SCHEMA1_SIGNED,
    MEDIA_TYPE_SCHEMA1,
];

/// An image manifest as returned by a registry.
#[derive(Debug, Clone)]
pub enum Manifest {
    V1(SignedManifest),
    V2(DeserializedManifest),
}

impl Manifest {
    pub fn schema_version(&self) -> u32 {
        match self {
            Manifest::V1(_) => 1,
            Manifest::V2(_) => 2,
        }
    }

    /// Content digest, when known
    pub fn digest(&self) -> Option<&str> {
        match self {
            Manifest::V1(m) => m.digest.as_deref(),
            Manifest::V2(m) => Some(&m.digest),
        }
    }

    /// The manifest bytes exactly as served by the registry
    pub fn raw(&self) -> &[u8] {
        match self {
            Manifest::V1(m) => &m.raw,
            Manifest::V2(m) => &m.raw,
        }
    }

    /// Decode a manifest response body.
    ///
    /// The schema is chosen from the content type when it names one, else from the body's
    /// `schemaVersion`. Manifest lists and image indexes are rejected.
    pub fn decode(
        content_type: Option<&str>,
        digest_header: Option<&str>,
        body: Bytes,
    ) -> Result<Self, PullError> {
        let media_type = content_type
            .map(|value| value.split(';').next().unwrap_or(value).trim())
            .filter(|value| !value.is_empty());

        if let Some(media_type) = media_type {
            if media_type == MEDIA_TYPE_MANIFEST_LIST || media_type == MEDIA_TYPE_OCI_INDEX {
                return Err(PullError::InvalidManifest(format!(
                    "{} is not an image manifest",
                    media_type
                )));
            }
        }

        let schema_version = match media_type {
            Some(MEDIA_TYPE_SCHEMA1) | Some(MEDIA_TYPE_SCHEMA1_SIGNED) => 1,
            Some(MEDIA_TYPE_SCHEMA2) | Some(MEDIA_TYPE_OCI_MANIFEST) => 2,
            _ => sniff_schema_version(&body)?,
        };

        match schema_version {
            1 => {
                let mut manifest: SignedManifest = serde_json::from_slice(&body)
                    .map_err(|e| invalid_manifest("schema1", e))?;
                manifest.digest = digest_header.map(str::to_string);
                manifest.raw = body;
                Ok(Manifest::V1(manifest))
            }
            2 => {
                let mut manifest: DeserializedManifest = serde_json::from_slice(&body)
                    .map_err(|e| invalid_manifest("schema2", e))?;
                if manifest.media_type.is_none() {
                    manifest.media_type = media_type.map(str::to_string);
                }
                manifest.digest = digest_header
                    .map(str::to_string)
                    .unwrap_or_else(|| sha256_digest(&body));
                manifest.raw = body;
                Ok(Manifest::V2(manifest))
            }
            other => Err(PullError::InvalidManifest(format!(
                "unsupported schemaVersion {}",
                other
            ))),
        }
    }
}

/// Docker image manifest schema 1, optionally JWS-signed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedManifest {
    pub schema_version: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub fs_layers: Vec<FsLayer>,
    #[serde(default)]
    pub history: Vec<History>,
    #[serde(default)]
    pub signatures: Vec<serde_json::Value>,
    #[serde(skip)]
    pub raw: Bytes,
    #[serde(skip)]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsLayer {
    pub blob_sum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct History {
    pub v1_compatibility: String,
}

/// Docker image manifest schema 2 or OCI image manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeserializedManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(skip)]
    pub raw: Bytes,
    #[serde(skip)]
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Versioned {
    schema_version: Option<u32>,
    media_type: Option<String>,
}

fn sniff_schema_version(body: &[u8]) -> Result<u32, PullError> {
    let versioned: Versioned =
        serde_json::from_slice(body).map_err(|e| invalid_manifest("manifest", e))?;

    if let Some(media_type) = versioned.media_type.as_deref() {
        if media_type == MEDIA_TYPE_MANIFEST_LIST || media_type == MEDIA_TYPE_OCI_INDEX {
            return Err(PullError::InvalidManifest(format!(
                "{} is not an image manifest",
                media_type
            )));
        }
    }

    versioned
        .schema_version
        .ok_or_else(|| PullError::InvalidManifest("missing schemaVersion".to_string()))
}

pub(crate) fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

fn invalid_manifest(kind: &str, err: serde_json::Error) -> PullError {
    PullError::InvalidManifest(format!("failed to decode {} manifest: {}", kind, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA2_BODY: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": 7023,
            "digest": "sha256:b5b2b2c507a0944348e0303114d8d93aaaa081732b86451d9bce1f432a537bc7"
        },
        "layers": [
            {
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "size": 32654,
                "digest": "sha256:e692418e4cbaf90ca69d05a66403747baa33ee08806650b51fab815ad7fc331f"
            }
        ]
    }"#;

    const SCHEMA1_BODY: &str = r#"{
        "schemaVersion": 1,
        "name": "appscode/voyager",
        "tag": "6.0.0",
        "architecture": "amd64",
        "fsLayers": [
            { "blobSum": "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4" }
        ],
        "history": [
            { "v1Compatibility": "{\"id\":\"e45a5af57b00862e5ef5782a9925979a02ba2b12dff832fd0991335f4a11e5c5\"}" }
        ],
        "signatures": [
            { "header": { "alg": "ES256" }, "signature": "sig", "protected": "prot" }
        ]
    }"#;

    #[test]
    fn test_decode_schema2_by_content_type() {
        let manifest = Manifest::decode(
            Some(MEDIA_TYPE_SCHEMA2),
            Some("sha256:abc"),
            Bytes::from_static(SCHEMA2_BODY.as_bytes()),
        )
        .unwrap();

        assert_eq!(manifest.schema_version(), 2);
        assert_eq!(manifest.digest(), Some("sha256:abc"));
        assert_eq!(manifest.raw(), SCHEMA2_BODY.as_bytes());
        match manifest {
            Manifest::V2(m) => {
                assert_eq!(m.config.size, 7023);
                assert_eq!(m.layers.len(), 1);
            }
            Manifest::V1(_) => panic!("expected a schema2 manifest"),
        }
    }

    #[test]
    fn test_decode_schema2_digest_falls_back_to_body_hash() {
        let body = Bytes::from_static(SCHEMA2_BODY.as_bytes());
        let manifest = Manifest::decode(None, None, body.clone()).unwrap();
        assert_eq!(manifest.digest(), Some(sha256_digest(&body).as_str()));
    }

    #[test]
    fn test_decode_schema1_by_body() {
        let manifest = Manifest::decode(
            Some("application/json; charset=utf-8"),
            None,
            Bytes::from_static(SCHEMA1_BODY.as_bytes()),
        )
        .unwrap();

        assert_eq!(manifest.digest(), None);
        match manifest {
            Manifest::V1(m) => {
                assert_eq!(m.name, "appscode/voyager");
                assert_eq!(m.tag, "6.0.0");
                assert_eq!(m.fs_layers.len(), 1);
                assert_eq!(m.signatures.len(), 1);
            }
            Manifest::V2(_) => panic!("expected a schema1 manifest"),
        }
    }

    #[test]
    fn test_decode_rejects_manifest_lists() {
        let list = r#"{"schemaVersion": 2, "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json", "manifests": []}"#;

        assert!(matches!(
            Manifest::decode(
                Some(MEDIA_TYPE_MANIFEST_LIST),
                None,
                Bytes::from_static(list.as_bytes())
            ),
            Err(PullError::InvalidManifest(_))
        ));
        assert!(matches!(
            Manifest::decode(None, None, Bytes::from_static(list.as_bytes())),
            Err(PullError::InvalidManifest(_))
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Manifest::decode(None, None, Bytes::from_static(b"<html>")),
            Err(PullError::InvalidManifest(_))
        ));
        assert!(matches!(
            Manifest::decode(None, None, Bytes::from_static(br#"{"schemaVersion": 3}"#)),
            Err(PullError::InvalidManifest(_))
        ));
    }
}
