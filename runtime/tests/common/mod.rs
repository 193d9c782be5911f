//! Shared fixtures: a layer builder and an in-memory registry.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;
use layerfold_core::{FoldError, Result};
use layerfold_runtime::oci::manifest::{
    Manifest, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_LAYER, MEDIA_TYPE_OCI_LAYER_GZIP,
};
use layerfold_runtime::oci::{BlobDescriptor, BlobStream, Digest, DigestAlgorithm, ResolvedManifest};
use layerfold_runtime::{BlobFetcher, ImageReference, ManifestProvider};
use tar::{EntryType, Header};
use tokio_util::sync::CancellationToken;

/// Builds layer tarballs, including entries the `tar` crate would refuse to write.
pub struct LayerBuilder {
    builder: tar::Builder<Vec<u8>>,
}

impl LayerBuilder {
    pub fn new() -> Self {
        Self {
            builder: tar::Builder::new(Vec::new()),
        }
    }

    pub fn dir(self, path: &str) -> Self {
        self.entry(path, EntryType::Directory, None, b"", 0o755)
    }

    pub fn file(self, path: &str, content: &[u8]) -> Self {
        self.entry(path, EntryType::Regular, None, content, 0o644)
    }

    pub fn file_with_mode(self, path: &str, content: &[u8], mode: u32) -> Self {
        self.entry(path, EntryType::Regular, None, content, mode)
    }

    pub fn symlink(self, path: &str, target: &str) -> Self {
        self.entry(path, EntryType::Symlink, Some(target), b"", 0o777)
    }

    pub fn hardlink(self, path: &str, target: &str) -> Self {
        self.entry(path, EntryType::Link, Some(target), b"", 0o644)
    }

    pub fn fifo(self, path: &str) -> Self {
        self.entry(path, EntryType::Fifo, None, b"", 0o644)
    }

    /// Append an entry with `path` and `link` copied verbatim into the header.
    pub fn entry(
        mut self,
        path: &str,
        kind: EntryType,
        link: Option<&str>,
        content: &[u8],
        mode: u32,
    ) -> Self {
        let mut header = Header::new_gnu();
        {
            let old = header.as_old_mut();
            old.name[..path.len()].copy_from_slice(path.as_bytes());
            if let Some(link) = link {
                old.linkname[..link.len()].copy_from_slice(link.as_bytes());
            }
        }
        header.set_entry_type(kind);
        header.set_size(content.len() as u64);
        header.set_mode(mode);
        header.set_mtime(0);
        header.set_cksum();
        self.builder.append(&header, content).unwrap();
        self
    }

    pub fn tar(self) -> Vec<u8> {
        self.builder.into_inner().unwrap()
    }

    pub fn gzip(self) -> Vec<u8> {
        let tar = self.tar();
        let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
        encoder.write_all(&tar).unwrap();
        encoder.finish().unwrap()
    }
}

/// A blob as it will appear in the manifest.
pub struct Layer {
    pub media_type: &'static str,
    pub data: Vec<u8>,
}

impl Layer {
    pub fn gzip(builder: LayerBuilder) -> Self {
        Self {
            media_type: MEDIA_TYPE_OCI_LAYER_GZIP,
            data: builder.gzip(),
        }
    }

    pub fn tar(builder: LayerBuilder) -> Self {
        Self {
            media_type: MEDIA_TYPE_OCI_LAYER,
            data: builder.tar(),
        }
    }
}

pub fn descriptor(media_type: &str, data: &[u8]) -> BlobDescriptor {
    BlobDescriptor {
        media_type: media_type.to_string(),
        digest: Digest::of_bytes(DigestAlgorithm::Sha256, data),
        size: data.len() as i64,
    }
}

/// Registry double serving one image from memory.
pub struct MemoryRegistry {
    pub manifest: ResolvedManifest,
    blobs: HashMap<Digest, Vec<u8>>,
    failing: HashSet<Digest>,
    delays: HashMap<Digest, Duration>,
    cancel_on_fetch: Option<(Digest, CancellationToken)>,
    fetches: AtomicUsize,
    fetched: Mutex<Vec<Digest>>,
}

impl MemoryRegistry {
    pub fn new(layers: Vec<Layer>) -> Self {
        let config = br#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers"}}"#.to_vec();
        let manifest = Manifest {
            schema_version: 2,
            media_type: None,
            config: descriptor(MEDIA_TYPE_OCI_CONFIG, &config),
            layers: layers
                .iter()
                .map(|l| descriptor(l.media_type, &l.data))
                .collect(),
            annotations: None,
        };

        let mut blobs = HashMap::new();
        blobs.insert(manifest.config.digest.clone(), config);
        for layer in layers {
            blobs.insert(Digest::of_bytes(DigestAlgorithm::Sha256, &layer.data), layer.data);
        }

        Self {
            manifest: ResolvedManifest::from_manifest(manifest).unwrap(),
            blobs,
            failing: HashSet::new(),
            delays: HashMap::new(),
            cancel_on_fetch: None,
            fetches: AtomicUsize::new(0),
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn layer_digest(&self, index: usize) -> Digest {
        self.manifest.manifest.layers[index].digest.clone()
    }

    /// Make fetches of layer `index` fail.
    pub fn fail_layer(mut self, index: usize) -> Self {
        self.failing.insert(self.layer_digest(index));
        self
    }

    /// Serve `data` in place of layer `index`, keeping the manifest unchanged.
    pub fn tamper_layer(mut self, index: usize, data: Vec<u8>) -> Self {
        self.blobs.insert(self.layer_digest(index), data);
        self
    }

    pub fn delay_layer(mut self, index: usize, delay: Duration) -> Self {
        self.delays.insert(self.layer_digest(index), delay);
        self
    }

    /// Cancel `token` when layer `index` is fetched.
    pub fn cancel_on_layer(mut self, index: usize, token: CancellationToken) -> Self {
        self.cancel_on_fetch = Some((self.layer_digest(index), token));
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn was_fetched(&self, digest: &Digest) -> bool {
        self.fetched.lock().unwrap().contains(digest)
    }

    pub fn reference(&self) -> ImageReference {
        ImageReference::parse("registry.test/layerfold/fixture:v1").unwrap()
    }
}

#[async_trait]
impl ManifestProvider for MemoryRegistry {
    async fn get_manifest(&self, reference: &ImageReference) -> Result<ResolvedManifest> {
        if let Some(pinned) = &reference.digest {
            if *pinned != self.manifest.digest {
                return Err(FoldError::ManifestError {
                    reference: reference.to_string(),
                    message: "manifest unknown".to_string(),
                });
            }
        }
        Ok(self.manifest.clone())
    }
}

#[async_trait]
impl BlobFetcher for MemoryRegistry {
    async fn fetch(&self, _reference: &ImageReference, descriptor: &BlobDescriptor) -> Result<BlobStream> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.fetched.lock().unwrap().push(descriptor.digest.clone());

        if let Some(delay) = self.delays.get(&descriptor.digest) {
            tokio::time::sleep(*delay).await;
        }
        if let Some((digest, token)) = &self.cancel_on_fetch {
            if *digest == descriptor.digest {
                token.cancel();
            }
        }
        if self.failing.contains(&descriptor.digest) {
            return Err(FoldError::FetchFailure {
                digest: descriptor.digest.to_string(),
                message: "connection reset by peer".to_string(),
            });
        }

        match self.blobs.get(&descriptor.digest) {
            Some(data) => Ok(Box::new(std::io::Cursor::new(data.clone()))),
            None => Err(FoldError::FetchFailure {
                digest: descriptor.digest.to_string(),
                message: "blob unknown".to_string(),
            }),
        }
    }
}
