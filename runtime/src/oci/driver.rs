//! Materialization driver.
//!
//! Runs one image through `Resolving -> Fetching(i) -> Decoding(i) -> Applying(i)` for
//! every layer in manifest order, or hands the whole image to the bundler when the
//! target is an archive. Up to `prefetch_depth` later layers are fetched in the
//! background while the current one is applied; their results are still consumed in
//! order.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use layerfold_core::config::MaterializeConfig;
use layerfold_core::error::{FoldError, Result};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::bundle::ImageBundler;
use super::decoder::LayerDecoder;
use super::digest::Digest;
use super::manifest::{BlobDescriptor, ResolvedManifest};
use super::materializer::{LayerReport, TreeMaterializer};
use super::reference::ImageReference;
use super::source::{BlobFetcher, ManifestProvider};
use super::spool::{fetch_verified, VerifiedBlob};

/// Where an image is materialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MaterializationTarget {
    /// Unpack all layers into `base_path`
    DirectoryTree { base_path: PathBuf },
    /// Write a single bundle archive into `base_path`
    ArchiveBundle {
        base_path: PathBuf,
        name: Option<String>,
    },
}

impl MaterializationTarget {
    pub fn directory(base_path: impl Into<PathBuf>) -> Self {
        Self::DirectoryTree {
            base_path: base_path.into(),
        }
    }

    pub fn bundle(base_path: impl Into<PathBuf>, name: Option<String>) -> Self {
        Self::ArchiveBundle {
            base_path: base_path.into(),
            name,
        }
    }

    pub fn base_path(&self) -> &Path {
        match self {
            Self::DirectoryTree { base_path } | Self::ArchiveBundle { base_path, .. } => base_path,
        }
    }
}

/// Driver state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Resolving,
    Fetching(usize),
    Decoding(usize),
    Applying(usize),
    Bundling,
    Done,
    Failed,
}

impl Phase {
    /// Layer index the phase refers to, if any.
    pub fn layer(&self) -> Option<usize> {
        match self {
            Phase::Fetching(i) | Phase::Decoding(i) | Phase::Applying(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Resolving => write!(f, "resolving"),
            Phase::Fetching(i) => write!(f, "fetching({})", i),
            Phase::Decoding(i) => write!(f, "decoding({})", i),
            Phase::Applying(i) => write!(f, "applying({})", i),
            Phase::Bundling => write!(f, "bundling"),
            Phase::Done => write!(f, "done"),
            Phase::Failed => write!(f, "failed"),
        }
    }
}

fn log_phase(phase: Phase, digest: Option<&Digest>) {
    match digest {
        Some(digest) => tracing::debug!(phase = %phase, layer = ?phase.layer(), digest = %digest, "Materialization state"),
        None => tracing::debug!(phase = %phase, "Materialization state"),
    }
}

/// Outcome of a successful materialization.
#[derive(Debug, Clone, Serialize)]
pub struct MaterializeReport {
    pub reference: String,
    pub manifest_digest: Digest,
    /// Destination root, or the bundle file
    pub target: PathBuf,
    /// Per-layer statistics; empty for bundle targets
    pub layers: Vec<LayerReport>,
    /// Blobs written to the bundle, config included; zero for directory targets
    pub bundled_blobs: usize,
}

impl MaterializeReport {
    pub fn bytes_written(&self) -> u64 {
        self.layers.iter().map(|l| l.bytes_written).sum()
    }
}

/// Materializes images from a manifest provider and a blob fetcher.
///
/// Cheap to clone; clones share collaborators and the cancellation token.
#[derive(Clone)]
pub struct Materializer {
    provider: Arc<dyn ManifestProvider>,
    fetcher: Arc<dyn BlobFetcher>,
    config: MaterializeConfig,
    cancel: CancellationToken,
}

impl Materializer {
    pub fn new(
        provider: Arc<dyn ManifestProvider>,
        fetcher: Arc<dyn BlobFetcher>,
        config: MaterializeConfig,
    ) -> Self {
        Self {
            provider,
            fetcher,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Driver whose manifests and blobs come from the same source.
    pub fn from_source<S>(source: Arc<S>, config: MaterializeConfig) -> Self
    where
        S: ManifestProvider + BlobFetcher + 'static,
    {
        Self::new(source.clone(), source, config)
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that aborts every materialization run by this driver.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &MaterializeConfig {
        &self.config
    }

    /// Resolve `reference` and materialize it into `target`.
    pub async fn materialize(
        &self,
        reference: &ImageReference,
        target: MaterializationTarget,
    ) -> Result<MaterializeReport> {
        log_phase(Phase::Resolving, None);
        let resolved = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FoldError::Cancelled { layer: None }),
            result = self.provider.get_manifest(reference) => result,
        };
        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::debug!(phase = %Phase::Failed, error = %e, "Materialization state");
                return Err(e);
            }
        };
        self.materialize_manifest(reference, resolved, target).await
    }

    /// Materialize an already resolved manifest into `target`.
    pub async fn materialize_manifest(
        &self,
        reference: &ImageReference,
        resolved: ResolvedManifest,
        target: MaterializationTarget,
    ) -> Result<MaterializeReport> {
        self.config.validate()?;

        tracing::info!(
            reference = %reference,
            digest = %resolved.digest,
            layers = resolved.layers().len(),
            target = %target.base_path().display(),
            "Materializing image"
        );

        let result = match &target {
            MaterializationTarget::DirectoryTree { base_path } => {
                self.materialize_tree(reference, &resolved, base_path).await
            }
            MaterializationTarget::ArchiveBundle { base_path, name } => {
                self.materialize_bundle(reference, &resolved, base_path, name.as_deref())
                    .await
            }
        };

        match &result {
            Ok(report) => {
                log_phase(Phase::Done, Some(&resolved.digest));
                tracing::info!(
                    reference = %reference,
                    digest = %resolved.digest,
                    target = %report.target.display(),
                    bytes = report.bytes_written(),
                    "Image materialized"
                );
            }
            Err(e) => {
                tracing::debug!(phase = %Phase::Failed, layer = ?e.layer_index(), error = %e, "Materialization state");
            }
        }
        result
    }

    async fn materialize_bundle(
        &self,
        reference: &ImageReference,
        resolved: &ResolvedManifest,
        base_path: &Path,
        name: Option<&str>,
    ) -> Result<MaterializeReport> {
        log_phase(Phase::Bundling, Some(&resolved.digest));
        let bundler = ImageBundler::new(self.fetcher.clone(), self.config.bundle_concurrency);
        let path = bundler
            .write_bundle(reference, resolved, base_path, name, &self.cancel)
            .await?;

        Ok(MaterializeReport {
            reference: reference.to_string(),
            manifest_digest: resolved.digest.clone(),
            target: path,
            layers: Vec::new(),
            bundled_blobs: resolved.layers().len() + 1,
        })
    }

    async fn materialize_tree(
        &self,
        reference: &ImageReference,
        resolved: &ResolvedManifest,
        base_path: &Path,
    ) -> Result<MaterializeReport> {
        let tree = TreeMaterializer::new(base_path, &self.config)?;
        let fetch_cancel = self.cancel.child_token();
        let mut pending = VecDeque::new();

        let result = self
            .apply_layers(reference, resolved.layers(), &tree, &fetch_cancel, &mut pending)
            .await;

        if result.is_err() {
            fetch_cancel.cancel();
            for handle in pending {
                handle.abort();
            }
        }

        Ok(MaterializeReport {
            reference: reference.to_string(),
            manifest_digest: resolved.digest.clone(),
            target: tree.root().to_path_buf(),
            layers: result?,
            bundled_blobs: 0,
        })
    }

    async fn apply_layers(
        &self,
        reference: &ImageReference,
        layers: &[BlobDescriptor],
        tree: &TreeMaterializer,
        fetch_cancel: &CancellationToken,
        pending: &mut VecDeque<JoinHandle<Result<VerifiedBlob>>>,
    ) -> Result<Vec<LayerReport>> {
        let depth = self.config.prefetch_depth;
        let mut next_fetch = 0;
        let mut reports = Vec::with_capacity(layers.len());

        for (index, descriptor) in layers.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(FoldError::Cancelled { layer: Some(index) });
            }

            while next_fetch < layers.len() && next_fetch <= index + depth {
                pending.push_back(self.spawn_fetch(reference, &layers[next_fetch], next_fetch, fetch_cancel));
                next_fetch += 1;
            }

            let handle = pending
                .pop_front()
                .ok_or_else(|| FoldError::Other(format!("No fetch scheduled for layer {}", index)))?;
            let blob = handle
                .await
                .map_err(|e| FoldError::Other(format!("Fetch task for layer {} failed: {}", index, e)))?
                .map_err(|e| layer_error(e, index, &descriptor.digest))?;

            log_phase(Phase::Decoding(index), Some(&descriptor.digest));
            let tree = tree.clone();
            let cancel = self.cancel.clone();
            let digest = descriptor.digest.clone();
            let report = tokio::task::spawn_blocking(move || {
                let mut decoder = LayerDecoder::open(blob)?;
                log_phase(Phase::Applying(index), Some(&digest));
                let entries = decoder.entries()?;
                tree.apply_layer(index, &digest.to_string(), entries, &cancel)
            })
            .await
            .map_err(|e| FoldError::Other(format!("Apply task for layer {} failed: {}", index, e)))?
            .map_err(|e| layer_error(e, index, &descriptor.digest))?;

            tracing::info!(
                layer = index,
                digest = %descriptor.digest,
                entries = report.entries,
                bytes = report.bytes_written,
                skipped = report.skipped.len(),
                "Layer applied"
            );
            reports.push(report);
        }

        Ok(reports)
    }

    fn spawn_fetch(
        &self,
        reference: &ImageReference,
        descriptor: &BlobDescriptor,
        index: usize,
        cancel: &CancellationToken,
    ) -> JoinHandle<Result<VerifiedBlob>> {
        log_phase(Phase::Fetching(index), Some(&descriptor.digest));
        let fetcher = self.fetcher.clone();
        let reference = reference.clone();
        let descriptor = descriptor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { fetch_verified(fetcher.as_ref(), &reference, &descriptor, &cancel).await })
    }
}

fn layer_error(err: FoldError, index: usize, digest: &Digest) -> FoldError {
    match err {
        FoldError::Cancelled { layer: None } => FoldError::Cancelled { layer: Some(index) },
        other => other.in_layer(index, digest.to_string()),
    }
}
