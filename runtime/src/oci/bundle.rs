//! Image bundles.
//!
//! A bundle is a single tar archive named after the manifest digest, holding the
//! index, the raw manifest, the config blob and every layer blob verbatim. Headers are
//! normalized so the same image always produces the same bytes.

use std::fs::Permissions;
use std::io::{self, BufWriter, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use layerfold_core::error::{FoldError, Result};
use serde::{Deserialize, Serialize};
use tar::{EntryType, Header};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

use super::digest::Digest;
use super::manifest::{BlobDescriptor, ResolvedManifest};
use super::reference::ImageReference;
use super::source::BlobFetcher;
use super::spool::{fetch_verified, VerifiedBlob};

pub const BUNDLE_INDEX_FILE: &str = "index.json";
pub const BUNDLE_MANIFEST_FILE: &str = "manifest.json";
pub const BUNDLE_SCHEMA_VERSION: u32 = 1;

/// Mode of a finished bundle file.
const BUNDLE_FILE_MODE: u32 = 0o644;

/// File name of the bundle for a manifest digest.
pub fn bundle_file_name(digest: &Digest) -> String {
    digest.sanitize_for_filesystem()
}

/// One blob recorded in a bundle index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleBlob {
    pub digest: Digest,
    pub media_type: String,
    pub size: i64,
    /// Archive member holding the blob
    pub file: String,
}

impl BundleBlob {
    fn config(descriptor: &BlobDescriptor) -> Self {
        Self::with_file(descriptor, format!("config.{}", descriptor.bundle_extension()))
    }

    fn layer(descriptor: &BlobDescriptor) -> Self {
        Self::with_file(
            descriptor,
            format!(
                "{}.{}",
                descriptor.digest.sanitize_for_filesystem(),
                descriptor.bundle_extension()
            ),
        )
    }

    fn with_file(descriptor: &BlobDescriptor, file: String) -> Self {
        Self {
            digest: descriptor.digest.clone(),
            media_type: descriptor.media_type.clone(),
            size: descriptor.size,
            file,
        }
    }

    pub fn descriptor(&self) -> BlobDescriptor {
        BlobDescriptor {
            media_type: self.media_type.clone(),
            digest: self.digest.clone(),
            size: self.size,
        }
    }
}

/// Contents of `index.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleIndex {
    pub schema_version: u32,
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub manifest_digest: Digest,
    pub config: BundleBlob,
    pub layers: Vec<BundleBlob>,
}

impl BundleIndex {
    pub fn for_manifest(
        reference: &ImageReference,
        name: Option<&str>,
        resolved: &ResolvedManifest,
    ) -> Self {
        Self {
            schema_version: BUNDLE_SCHEMA_VERSION,
            reference: reference.to_string(),
            name: name.map(str::to_string),
            manifest_digest: resolved.digest.clone(),
            config: BundleBlob::config(&resolved.manifest.config),
            layers: resolved.manifest.layers.iter().map(BundleBlob::layer).collect(),
        }
    }

    /// Config first, then layers in manifest order.
    pub fn blobs(&self) -> impl Iterator<Item = &BundleBlob> {
        std::iter::once(&self.config).chain(self.layers.iter())
    }
}

/// Writes bundles, fetching blobs through a [`BlobFetcher`].
#[derive(Clone)]
pub struct ImageBundler {
    fetcher: Arc<dyn BlobFetcher>,
    concurrency: usize,
}

impl ImageBundler {
    pub fn new(fetcher: Arc<dyn BlobFetcher>, concurrency: usize) -> Self {
        Self {
            fetcher,
            concurrency: concurrency.max(1),
        }
    }

    /// Write `<base_path>/<sanitized manifest digest>` and return its path.
    ///
    /// Nothing appears at the final path unless every blob was fetched and verified.
    pub async fn write_bundle(
        &self,
        reference: &ImageReference,
        resolved: &ResolvedManifest,
        base_path: &Path,
        name: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(base_path).await.map_err(|e| {
            FoldError::Io(io::Error::new(
                e.kind(),
                format!("Failed to create {}: {}", base_path.display(), e),
            ))
        })?;

        let final_path = base_path.join(bundle_file_name(&resolved.digest));
        let index = BundleIndex::for_manifest(reference, name, resolved);

        tracing::info!(
            reference = %reference,
            digest = %resolved.digest,
            blobs = index.layers.len() + 1,
            target = %final_path.display(),
            "Writing image bundle"
        );

        let descriptors: Vec<BlobDescriptor> = index.blobs().map(BundleBlob::descriptor).collect();
        let blobs: Vec<VerifiedBlob> = stream::iter(descriptors.iter())
            .map(|descriptor| self.fetch_blob(reference, descriptor, cancel))
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        if cancel.is_cancelled() {
            return Err(FoldError::Cancelled { layer: None });
        }

        let index_json = serde_json::to_vec_pretty(&index)?;
        let raw_manifest = resolved.raw.clone();
        let base = base_path.to_path_buf();
        let target = final_path.clone();
        tokio::task::spawn_blocking(move || {
            write_archive(&base, &target, &index, &index_json, &raw_manifest, blobs)
        })
        .await
        .map_err(|e| FoldError::Other(format!("Bundle writer task failed: {}", e)))??;

        tracing::info!(digest = %resolved.digest, path = %final_path.display(), "Bundle written");
        Ok(final_path)
    }

    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &BlobDescriptor,
        cancel: &CancellationToken,
    ) -> Result<VerifiedBlob> {
        tracing::debug!(digest = %descriptor.digest, size = descriptor.size, "Fetching blob for bundle");
        fetch_verified(self.fetcher.as_ref(), reference, descriptor, cancel)
            .await
            .map_err(|e| match e {
                FoldError::Cancelled { .. } => e,
                other => FoldError::IncompleteBundle {
                    digest: descriptor.digest.to_string(),
                    message: other.to_string(),
                },
            })
    }
}

fn write_archive(
    base: &Path,
    final_path: &Path,
    index: &BundleIndex,
    index_json: &[u8],
    raw_manifest: &[u8],
    blobs: Vec<VerifiedBlob>,
) -> Result<()> {
    let temp = NamedTempFile::new_in(base)?;
    let mut builder = tar::Builder::new(BufWriter::new(temp));

    append_member(&mut builder, BUNDLE_INDEX_FILE, index_json.len() as u64, index_json)?;
    append_member(
        &mut builder,
        BUNDLE_MANIFEST_FILE,
        raw_manifest.len() as u64,
        raw_manifest,
    )?;
    for (entry, blob) in index.blobs().zip(blobs) {
        let size = blob.size();
        append_member(&mut builder, &entry.file, size, blob.into_file())?;
    }

    let writer = builder.into_inner()?;
    let temp = writer.into_inner().map_err(|e| e.into_error())?;
    temp.as_file().set_permissions(Permissions::from_mode(BUNDLE_FILE_MODE))?;
    temp.as_file().sync_all()?;
    temp.persist(final_path).map_err(|e| {
        FoldError::Io(io::Error::new(
            e.error.kind(),
            format!("Failed to move bundle into {}: {}", final_path.display(), e.error),
        ))
    })?;
    Ok(())
}

/// Append a regular file with a normalized header.
fn append_member<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    size: u64,
    data: impl Read,
) -> io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    header.set_username("")?;
    header.set_groupname("")?;
    builder.append_data(&mut header, name, data)
}
