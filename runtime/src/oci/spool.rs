//! Blob spooling.
//!
//! A fetched blob is copied into an anonymous temp file while it is hashed. Only a
//! blob whose size and digest both match its descriptor comes out as a
//! [`VerifiedBlob`]; anything else is discarded together with its temp file.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use layerfold_core::error::{FoldError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::digest::{Digest, DigestHasher};
use super::manifest::BlobDescriptor;
use super::reference::ImageReference;
use super::source::{BlobFetcher, BlobStream};

const SPOOL_BUFFER_SIZE: usize = 64 * 1024;

/// A blob whose content has been checked against its descriptor.
///
/// The backing file is unlinked already and disappears when this value is dropped.
#[derive(Debug)]
pub struct VerifiedBlob {
    descriptor: BlobDescriptor,
    file: File,
    size: u64,
}

impl VerifiedBlob {
    /// Verify an in-memory blob and spool it.
    pub fn from_bytes(descriptor: &BlobDescriptor, data: &[u8]) -> Result<Self> {
        let expected = descriptor.expected_size()?;
        if data.len() as u64 != expected {
            return Err(FoldError::SizeMismatch {
                digest: descriptor.digest.to_string(),
                expected,
                actual: data.len() as u64,
            });
        }
        let actual = Digest::of_bytes(descriptor.digest.algorithm(), data);
        if actual != descriptor.digest {
            return Err(FoldError::DigestMismatch {
                expected: descriptor.digest.to_string(),
                actual: actual.to_string(),
            });
        }

        let mut file = tempfile::tempfile()?;
        file.write_all(data)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(Self {
            descriptor: descriptor.clone(),
            file,
            size: expected,
        })
    }

    pub fn descriptor(&self) -> &BlobDescriptor {
        &self.descriptor
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Backing file, positioned at the start of the content.
    pub fn into_file(self) -> File {
        self.file
    }
}

/// Fetch a blob and spool it, mapping any collaborator error to `FetchFailure`.
pub async fn fetch_verified(
    fetcher: &dyn BlobFetcher,
    reference: &ImageReference,
    descriptor: &BlobDescriptor,
    cancel: &CancellationToken,
) -> Result<VerifiedBlob> {
    let stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(FoldError::Cancelled { layer: None }),
        result = fetcher.fetch(reference, descriptor) => result.map_err(|e| match e {
            FoldError::FetchFailure { .. } | FoldError::Cancelled { .. } => e,
            other => FoldError::FetchFailure {
                digest: descriptor.digest.to_string(),
                message: other.to_string(),
            },
        })?,
    };

    spool_blob(stream, descriptor, cancel).await
}

/// Copy `stream` into a temp file, checking size and digest against `descriptor`.
///
/// Reading stops as soon as more bytes than the declared size arrive.
pub async fn spool_blob(
    mut stream: BlobStream,
    descriptor: &BlobDescriptor,
    cancel: &CancellationToken,
) -> Result<VerifiedBlob> {
    let expected = descriptor.expected_size()?;
    let digest = descriptor.digest.to_string();

    let spool = tempfile::tempfile().map_err(|e| {
        FoldError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to create spool file for {}: {}", digest, e),
        ))
    })?;
    let mut file = tokio::fs::File::from_std(spool);
    let mut hasher = DigestHasher::new(descriptor.digest.algorithm());
    let mut buf = vec![0u8; SPOOL_BUFFER_SIZE];
    let mut received: u64 = 0;

    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FoldError::Cancelled { layer: None }),
            result = stream.read(&mut buf) => result.map_err(|e| FoldError::FetchFailure {
                digest: digest.clone(),
                message: format!("stream read failed after {} bytes: {}", received, e),
            })?,
        };
        if n == 0 {
            break;
        }

        received += n as u64;
        if received > expected {
            return Err(FoldError::SizeMismatch {
                digest,
                expected,
                actual: received,
            });
        }

        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
    }

    if received != expected {
        return Err(FoldError::SizeMismatch {
            digest,
            expected,
            actual: received,
        });
    }

    let actual = hasher.finalize();
    if actual != descriptor.digest {
        return Err(FoldError::DigestMismatch {
            expected: digest,
            actual: actual.to_string(),
        });
    }

    file.flush().await?;
    let mut file = file.into_std().await;
    file.seek(SeekFrom::Start(0))?;

    tracing::debug!(digest = %descriptor.digest, size = received, "Spooled verified blob");

    Ok(VerifiedBlob {
        descriptor: descriptor.clone(),
        file,
        size: received,
    })
}
