//! Reading images back out of a bundle.
//!
//! [`BundleSource`] serves the manifest and blobs of a bundle written by
//! [`ImageBundler`](super::bundle::ImageBundler), so an image saved once can be
//! materialized later without a registry.

use std::collections::HashMap;
use std::io::{BufReader, Read, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use layerfold_core::error::{FoldError, Result};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::bundle::{BundleIndex, BUNDLE_INDEX_FILE, BUNDLE_MANIFEST_FILE, BUNDLE_SCHEMA_VERSION};
use super::digest::Digest;
use super::manifest::{BlobDescriptor, ResolvedManifest};
use super::reference::ImageReference;
use super::source::{BlobFetcher, BlobStream, ManifestProvider};

#[derive(Debug, Clone, Copy)]
struct MemberSpan {
    offset: u64,
    size: u64,
}

/// An opened, validated bundle.
#[derive(Debug)]
pub struct BundleSource {
    path: PathBuf,
    index: BundleIndex,
    resolved: ResolvedManifest,
    blobs: HashMap<Digest, MemberSpan>,
}

impl BundleSource {
    /// Scan the bundle at `path` and check its index against the stored manifest.
    pub fn open(path: &Path) -> Result<Self> {
        let invalid = |message: String| FoldError::ManifestError {
            reference: path.display().to_string(),
            message,
        };

        let file = std::fs::File::open(path).map_err(|e| invalid(format!("cannot open bundle: {}", e)))?;
        let mut archive = tar::Archive::new(BufReader::new(file));

        let mut index_bytes = None;
        let mut manifest_bytes = None;
        let mut members: HashMap<String, MemberSpan> = HashMap::new();

        let entries = archive
            .entries()
            .map_err(|e| invalid(format!("unreadable bundle: {}", e)))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| invalid(format!("unreadable bundle entry: {}", e)))?;
            let name = entry
                .path()
                .map_err(|e| invalid(format!("bad member name: {}", e)))?
                .to_string_lossy()
                .into_owned();
            if name == BUNDLE_INDEX_FILE {
                index_bytes = Some(read_member(&mut entry, &name, path)?);
            } else if name == BUNDLE_MANIFEST_FILE {
                manifest_bytes = Some(read_member(&mut entry, &name, path)?);
            } else {
                let span = MemberSpan {
                    offset: entry.raw_file_position(),
                    size: entry.size(),
                };
                members.insert(name, span);
            }
        }

        let index_bytes = index_bytes.ok_or_else(|| invalid(format!("missing {}", BUNDLE_INDEX_FILE)))?;
        let manifest_bytes =
            manifest_bytes.ok_or_else(|| invalid(format!("missing {}", BUNDLE_MANIFEST_FILE)))?;

        let index: BundleIndex = serde_json::from_slice(&index_bytes)
            .map_err(|e| invalid(format!("invalid {}: {}", BUNDLE_INDEX_FILE, e)))?;
        if index.schema_version != BUNDLE_SCHEMA_VERSION {
            return Err(invalid(format!(
                "unsupported bundle schema version {}",
                index.schema_version
            )));
        }

        let resolved = ResolvedManifest::from_raw_with_digest(manifest_bytes, &index.manifest_digest)
            .map_err(|e| invalid(format!("stored manifest does not match index: {}", e)))?;

        if index.config.descriptor() != resolved.manifest.config {
            return Err(invalid("index config differs from manifest config".to_string()));
        }
        let index_layers: Vec<BlobDescriptor> = index.layers.iter().map(|l| l.descriptor()).collect();
        if index_layers != resolved.manifest.layers {
            return Err(invalid("index layers differ from manifest layers".to_string()));
        }

        let mut blobs = HashMap::new();
        for blob in index.blobs() {
            let span = members
                .get(&blob.file)
                .copied()
                .ok_or_else(|| invalid(format!("missing blob member {}", blob.file)))?;
            if i64::try_from(span.size).ok() != Some(blob.size) {
                return Err(invalid(format!(
                    "member {} holds {} bytes, index declares {}",
                    blob.file, span.size, blob.size
                )));
            }
            blobs.insert(blob.digest.clone(), span);
        }

        tracing::debug!(
            path = %path.display(),
            digest = %resolved.digest,
            blobs = blobs.len(),
            "Opened image bundle"
        );

        Ok(Self {
            path: path.to_path_buf(),
            index,
            resolved,
            blobs,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> &BundleIndex {
        &self.index
    }

    pub fn manifest(&self) -> &ResolvedManifest {
        &self.resolved
    }

    /// The reference the bundle was saved from, pinned to its manifest digest.
    pub fn reference(&self) -> Result<ImageReference> {
        let reference = ImageReference::parse(&self.index.reference)?;
        Ok(reference.with_digest(self.resolved.digest.clone()))
    }
}

fn read_member(entry: &mut impl Read, name: &str, bundle: &Path) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    entry.read_to_end(&mut data).map_err(|e| FoldError::ManifestError {
        reference: bundle.display().to_string(),
        message: format!("cannot read {}: {}", name, e),
    })?;
    Ok(data)
}

#[async_trait]
impl ManifestProvider for BundleSource {
    async fn get_manifest(&self, reference: &ImageReference) -> Result<ResolvedManifest> {
        if let Some(pinned) = &reference.digest {
            if *pinned != self.resolved.digest {
                return Err(FoldError::ManifestError {
                    reference: reference.to_string(),
                    message: format!("bundle holds manifest {}", self.resolved.digest),
                });
            }
        }
        Ok(self.resolved.clone())
    }
}

#[async_trait]
impl BlobFetcher for BundleSource {
    async fn fetch(&self, _reference: &ImageReference, descriptor: &BlobDescriptor) -> Result<BlobStream> {
        let fetch_failure = |message: String| FoldError::FetchFailure {
            digest: descriptor.digest.to_string(),
            message,
        };

        let span = self
            .blobs
            .get(&descriptor.digest)
            .copied()
            .ok_or_else(|| fetch_failure(format!("not present in bundle {}", self.path.display())))?;

        let mut file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| fetch_failure(format!("cannot open bundle: {}", e)))?;
        file.seek(SeekFrom::Start(span.offset))
            .await
            .map_err(|e| fetch_failure(format!("cannot seek bundle: {}", e)))?;
        Ok(Box::new(file.take(span.size)))
    }
}
