//! OCI image materialization.
//!
//! Turns an image reference into either an unpacked root filesystem or a single
//! bundle archive. Blobs are verified against their digests before any byte of them is
//! decoded, and archive entries are treated as untrusted input.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐    ┌──────────────┐    ┌──────────────┐    ┌──────────────────┐
//! │ ManifestProvider │───▶│ BlobFetcher  │───▶│ spool/verify │───▶│ LayerDecoder     │
//! │ (registry,       │    │ (prefetched  │    │ (temp file,  │    │ (gzip/tar, lazy) │
//! │  bundle)         │    │  in order)   │    │  digest)     │    └────────┬─────────┘
//! └──────────────────┘    └──────┬───────┘    └──────────────┘             │
//!                                │                                         ▼
//!                                ▼                               ┌──────────────────┐
//!                        ┌──────────────┐                        │ TreeMaterializer │
//!                        │ ImageBundler │                        │ (rooted, safe)   │
//!                        └──────────────┘                        └──────────────────┘
//! ```

pub mod bundle;
pub mod bundle_source;
pub mod decoder;
pub mod digest;
pub mod driver;
pub mod manifest;
pub mod materializer;
pub mod reference;
pub mod registry;
mod safepath;
pub mod source;
mod spool;

pub use bundle::{bundle_file_name, BundleBlob, BundleIndex, ImageBundler};
pub use bundle_source::BundleSource;
pub use decoder::{ArchiveEntry, Compression, EntryKind, LayerDecoder};
pub use digest::{Digest, DigestAlgorithm, DigestHasher};
pub use driver::{MaterializationTarget, MaterializeReport, Materializer, Phase};
pub use manifest::{BlobDescriptor, Manifest, ResolvedManifest};
pub use materializer::{LayerReport, TreeMaterializer};
pub use reference::ImageReference;
pub use registry::{RegistryAuth, RegistryClient};
pub use source::{resolve_digest_name, BlobFetcher, BlobStream, ManifestProvider};
pub use spool::{fetch_verified, spool_blob, VerifiedBlob};
