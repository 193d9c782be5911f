//! Collaborator boundaries for manifest resolution and blob retrieval.
//!
//! The materializer never talks to a registry directly; anything that can hand out
//! manifests and blob streams (the registry client, a saved bundle, a test double)
//! plugs in through these traits.

use async_trait::async_trait;
use layerfold_core::error::Result;
use tokio::io::AsyncRead;

use super::digest::Digest;
use super::manifest::{BlobDescriptor, ResolvedManifest};
use super::reference::ImageReference;

/// Byte stream of one blob, exactly as stored.
pub type BlobStream = Box<dyn AsyncRead + Send + Unpin>;

/// Resolves references to single-platform manifests.
#[async_trait]
pub trait ManifestProvider: Send + Sync {
    /// Resolve `reference` to a manifest, its digest and its raw bytes.
    async fn get_manifest(&self, reference: &ImageReference) -> Result<ResolvedManifest>;

    /// Resolve `reference` to its manifest digest.
    async fn resolve_digest(&self, reference: &ImageReference) -> Result<Digest> {
        Ok(self.get_manifest(reference).await?.digest)
    }
}

/// Opens blob streams by descriptor.
///
/// Retries and timeouts belong to the implementation; the caller verifies digest
/// and size of whatever it returns.
#[async_trait]
pub trait BlobFetcher: Send + Sync {
    async fn fetch(&self, reference: &ImageReference, descriptor: &BlobDescriptor)
        -> Result<BlobStream>;
}

/// Filesystem-safe content-address name for a reference or a bare digest.
///
/// A bare `algorithm:hex` digest is sanitized directly; anything else is parsed as an
/// image reference and resolved through `provider`.
pub async fn resolve_digest_name(
    provider: &dyn ManifestProvider,
    reference_or_digest: &str,
) -> Result<String> {
    if let Ok(digest) = Digest::parse(reference_or_digest.trim()) {
        return Ok(digest.sanitize_for_filesystem());
    }

    let reference = ImageReference::parse(reference_or_digest)?;
    let digest = provider.resolve_digest(&reference).await?;
    tracing::debug!(reference = %reference, digest = %digest, "Resolved digest name");
    Ok(digest.sanitize_for_filesystem())
}
