//! OCI registry client.
//!
//! Uses the `oci-distribution` crate to resolve manifests and stream blobs from
//! container registries (Docker Hub, GHCR, etc.).

use async_trait::async_trait;
use layerfold_core::config::MaterializeConfig;
use layerfold_core::error::{FoldError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use tokio::io::AsyncSeekExt;

use super::digest::Digest;
use super::manifest::{
    BlobDescriptor, ResolvedManifest, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_OCI_MANIFEST,
};
use super::reference::ImageReference;
use super::source::{BlobFetcher, BlobStream, ManifestProvider};

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Create authentication from environment variables.
    ///
    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Falls back to anonymous if not set.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();

        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Manifest provider and blob fetcher backed by a live registry.
pub struct RegistryClient {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryClient {
    /// Registry client with anonymous authentication over HTTPS.
    pub fn new() -> Self {
        Self::with_auth(RegistryAuth::anonymous())
    }

    pub fn with_auth(auth: RegistryAuth) -> Self {
        Self::with_protocol(auth, ClientProtocol::Https)
    }

    /// Registry client that talks plain HTTP to the configured insecure registries.
    pub fn with_config(auth: RegistryAuth, config: &MaterializeConfig) -> Self {
        let protocol = if config.insecure_registries.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(config.insecure_registries.clone())
        };
        Self::with_protocol(auth, protocol)
    }

    fn with_protocol(auth: RegistryAuth, protocol: ClientProtocol) -> Self {
        let config = ClientConfig {
            protocol,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        let client = Client::new(config);

        Self { client, auth }
    }

    fn to_oci_reference(&self, reference: &ImageReference) -> Result<Reference> {
        let ref_str = reference.full_reference();
        ref_str.parse::<Reference>().map_err(|e| FoldError::InvalidReference {
            reference: ref_str.clone(),
            message: e.to_string(),
        })
    }
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ManifestProvider for RegistryClient {
    /// Resolve `reference` to the linux manifest for the host architecture.
    ///
    /// Image indexes are resolved first, then the chosen manifest is fetched again by
    /// digest so the stored bytes are exactly what the registry serves.
    async fn get_manifest(&self, reference: &ImageReference) -> Result<ResolvedManifest> {
        let oci_ref = self.to_oci_reference(reference)?;
        let auth = self.auth.to_oci_auth();
        let manifest_error = |message: String| FoldError::ManifestError {
            reference: reference.to_string(),
            message,
        };

        tracing::debug!(reference = %reference, "Resolving manifest");

        let (_, platform_digest) = self
            .client
            .pull_image_manifest(&oci_ref, &auth)
            .await
            .map_err(|e| manifest_error(format!("Failed to pull manifest: {}", e)))?;
        let digest = Digest::parse(&platform_digest)?;

        let pinned = self.to_oci_reference(&reference.with_digest(digest.clone()))?;
        let (raw, _) = self
            .client
            .pull_manifest_raw(
                &pinned,
                &auth,
                &[MEDIA_TYPE_OCI_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST],
            )
            .await
            .map_err(|e| manifest_error(format!("Failed to pull manifest {}: {}", digest, e)))?;

        let resolved = ResolvedManifest::from_raw_with_digest(raw, &digest)?;
        tracing::info!(
            reference = %reference,
            digest = %resolved.digest,
            layers = resolved.layers().len(),
            "Resolved manifest"
        );
        Ok(resolved)
    }
}

#[async_trait]
impl BlobFetcher for RegistryClient {
    /// Download a blob into an anonymous temp file and hand it back as a stream.
    async fn fetch(&self, reference: &ImageReference, descriptor: &BlobDescriptor) -> Result<BlobStream> {
        let oci_ref = self.to_oci_reference(reference)?;
        let fetch_failure = |message: String| FoldError::FetchFailure {
            digest: descriptor.digest.to_string(),
            message,
        };

        self.client
            .auth(&oci_ref, &self.auth.to_oci_auth(), RegistryOperation::Pull)
            .await
            .map_err(|e| fetch_failure(format!("Authentication failed: {}", e)))?;

        let layer = OciDescriptor {
            media_type: descriptor.media_type.clone(),
            digest: descriptor.digest.to_string(),
            size: descriptor.size,
            ..Default::default()
        };

        let spool = tempfile::tempfile().map_err(|e| fetch_failure(format!("Failed to create temp file: {}", e)))?;
        let mut file = tokio::fs::File::from_std(spool);
        self.client
            .pull_blob(&oci_ref, &layer, &mut file)
            .await
            .map_err(|e| fetch_failure(format!("Failed to pull blob: {}", e)))?;
        file.rewind()
            .await
            .map_err(|e| fetch_failure(format!("Failed to rewind blob: {}", e)))?;

        Ok(Box::new(file))
    }
}

/// Platform resolver that always selects linux images matching the host architecture.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}
