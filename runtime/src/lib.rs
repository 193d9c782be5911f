//! Layerfold Runtime - OCI layer materialization.
//!
//! Resolves images, verifies their blobs, and applies layers safely to a directory
//! tree or writes them out as a single bundle archive.

#![allow(clippy::result_large_err)]

pub mod oci;

// Re-export common types
pub use oci::{resolve_digest_name, BlobFetcher, BlobStream, ManifestProvider};
pub use oci::{BundleSource, ImageBundler, ImageReference, RegistryAuth, RegistryClient};
pub use oci::{Digest, DigestAlgorithm, ResolvedManifest};
pub use oci::{LayerReport, MaterializationTarget, MaterializeReport, Materializer};

/// Layerfold Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
