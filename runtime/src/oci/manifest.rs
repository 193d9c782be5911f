//! Image manifest model.
//!
//! Only the fields needed to drive layer retrieval are modelled; unknown fields are
//! ignored on parse and the raw bytes are kept alongside for verbatim bundling.

use std::collections::HashMap;

use layerfold_core::error::{FoldError, Result};
use serde::{Deserialize, Serialize};

use super::digest::{Digest, DigestAlgorithm};

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
pub const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Reference to a content-addressed blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobDescriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: i64,
}

impl BlobDescriptor {
    /// Compression implied by the media type.
    pub fn declared_compression(&self) -> DeclaredCompression {
        let media_type = self.media_type.as_str();
        if media_type.ends_with("+gzip") || media_type.ends_with(".tar.gzip") {
            DeclaredCompression::Gzip
        } else if media_type.ends_with("+zstd") {
            DeclaredCompression::Zstd
        } else {
            DeclaredCompression::None
        }
    }

    /// File extension used for this blob inside a bundle.
    pub fn bundle_extension(&self) -> &'static str {
        if self.media_type.contains("json") {
            return "json";
        }
        if !self.media_type.contains("layer") && !self.media_type.contains("rootfs") {
            return "bin";
        }
        match self.declared_compression() {
            DeclaredCompression::Gzip => "tar.gz",
            DeclaredCompression::Zstd => "tar.zst",
            DeclaredCompression::None => "tar",
        }
    }

    /// Declared size as unsigned, rejecting negative sizes.
    pub fn expected_size(&self) -> Result<u64> {
        u64::try_from(self.size).map_err(|_| {
            FoldError::Serialization(format!(
                "negative size {} declared for {}",
                self.size, self.digest
            ))
        })
    }
}

/// Compression announced by a layer media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclaredCompression {
    None,
    Gzip,
    Zstd,
}

/// Single-platform image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: BlobDescriptor,
    pub layers: Vec<BlobDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl Manifest {
    /// Parse manifest JSON, rejecting index/list documents and unsupported schema versions.
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(raw)?;
        if manifest.schema_version != 2 {
            return Err(FoldError::Serialization(format!(
                "unsupported manifest schemaVersion {}",
                manifest.schema_version
            )));
        }
        Ok(manifest)
    }
}

/// A manifest together with its own digest and the bytes it was parsed from.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub manifest: Manifest,
    pub digest: Digest,
    pub raw: Vec<u8>,
}

impl ResolvedManifest {
    /// Parse `raw` and compute its sha256 digest.
    pub fn from_raw(raw: Vec<u8>) -> Result<Self> {
        let manifest = Manifest::from_slice(&raw)?;
        let digest = Digest::of_bytes(DigestAlgorithm::Sha256, &raw);
        Ok(Self {
            manifest,
            digest,
            raw,
        })
    }

    /// Parse `raw` and check it against a digest announced by the registry.
    pub fn from_raw_with_digest(raw: Vec<u8>, expected: &Digest) -> Result<Self> {
        let actual = Digest::of_bytes(expected.algorithm(), &raw);
        if actual != *expected {
            return Err(FoldError::DigestMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        let manifest = Manifest::from_slice(&raw)?;
        Ok(Self {
            manifest,
            digest: actual,
            raw,
        })
    }

    /// Serialize `manifest` and compute its digest.
    pub fn from_manifest(manifest: Manifest) -> Result<Self> {
        let raw = serde_json::to_vec(&manifest)?;
        let digest = Digest::of_bytes(DigestAlgorithm::Sha256, &raw);
        Ok(Self {
            manifest,
            digest,
            raw,
        })
    }

    pub fn layers(&self) -> &[BlobDescriptor] {
        &self.manifest.layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(media_type: &str) -> BlobDescriptor {
        BlobDescriptor {
            media_type: media_type.to_string(),
            digest: Digest::of_bytes(DigestAlgorithm::Sha256, b"x"),
            size: 1,
        }
    }

    #[test]
    fn test_parse_oci_manifest() {
        let config = Digest::of_bytes(DigestAlgorithm::Sha256, b"config");
        let layer = Digest::of_bytes(DigestAlgorithm::Sha256, b"layer");
        let raw = format!(
            r#"{{
                "schemaVersion": 2,
                "mediaType": "{}",
                "config": {{"mediaType": "{}", "digest": "{}", "size": 6}},
                "layers": [{{"mediaType": "{}", "digest": "{}", "size": 5, "urls": []}}],
                "annotations": {{"org.opencontainers.image.title": "demo"}}
            }}"#,
            MEDIA_TYPE_OCI_MANIFEST, MEDIA_TYPE_OCI_CONFIG, config, MEDIA_TYPE_OCI_LAYER_GZIP, layer
        );

        let resolved = ResolvedManifest::from_raw(raw.clone().into_bytes()).unwrap();
        assert_eq!(resolved.manifest.layers.len(), 1);
        assert_eq!(resolved.manifest.layers[0].digest, layer);
        assert_eq!(resolved.manifest.config.size, 6);
        assert_eq!(resolved.raw, raw.as_bytes());
        assert_eq!(
            resolved.digest,
            Digest::of_bytes(DigestAlgorithm::Sha256, raw.as_bytes())
        );
    }

    #[test]
    fn test_parse_rejects_bad_layer_digest() {
        let raw = br#"{"schemaVersion":2,"config":{"mediaType":"a","digest":"sha256:00","size":1},"layers":[]}"#;
        assert!(matches!(
            Manifest::from_slice(raw),
            Err(FoldError::Serialization(_))
        ));
    }

    #[test]
    fn test_parse_rejects_schema_v1() {
        let config = Digest::of_bytes(DigestAlgorithm::Sha256, b"c");
        let raw = format!(
            r#"{{"schemaVersion":1,"config":{{"mediaType":"a","digest":"{}","size":1}},"layers":[]}}"#,
            config
        );
        assert!(Manifest::from_slice(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_from_raw_with_digest_mismatch() {
        let manifest = Manifest {
            schema_version: 2,
            media_type: None,
            config: descriptor(MEDIA_TYPE_OCI_CONFIG),
            layers: vec![],
            annotations: None,
        };
        let raw = serde_json::to_vec(&manifest).unwrap();
        let wrong = Digest::of_bytes(DigestAlgorithm::Sha256, b"other");
        assert!(matches!(
            ResolvedManifest::from_raw_with_digest(raw.clone(), &wrong),
            Err(FoldError::DigestMismatch { .. })
        ));

        let right = Digest::of_bytes(DigestAlgorithm::Sha256, &raw);
        let resolved = ResolvedManifest::from_raw_with_digest(raw, &right).unwrap();
        assert_eq!(resolved.digest, right);
    }

    #[test]
    fn test_bundle_extension() {
        assert_eq!(descriptor(MEDIA_TYPE_OCI_LAYER_GZIP).bundle_extension(), "tar.gz");
        assert_eq!(descriptor(MEDIA_TYPE_DOCKER_LAYER_GZIP).bundle_extension(), "tar.gz");
        assert_eq!(descriptor(MEDIA_TYPE_OCI_LAYER_ZSTD).bundle_extension(), "tar.zst");
        assert_eq!(descriptor(MEDIA_TYPE_OCI_LAYER).bundle_extension(), "tar");
        assert_eq!(descriptor(MEDIA_TYPE_OCI_CONFIG).bundle_extension(), "json");
        assert_eq!(
            descriptor("application/vnd.example.opaque").bundle_extension(),
            "bin"
        );
    }

    #[test]
    fn test_expected_size_rejects_negative() {
        let mut d = descriptor(MEDIA_TYPE_OCI_LAYER);
        d.size = -1;
        assert!(matches!(d.expected_size(), Err(FoldError::Serialization(_))));
    }
}
