use std::path::PathBuf;

use thiserror::Error;

/// Layerfold error types
#[derive(Error, Debug)]
pub enum FoldError {
    /// A digest string is not `algorithm:hex` or the hex part is wrong for the algorithm
    #[error("Malformed digest '{value}': {reason}")]
    MalformedDigest { value: String, reason: String },

    /// Fetched content does not hash to the expected digest
    #[error("Digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Fetched content does not have the declared size
    #[error("Size mismatch for {digest}: expected {expected} bytes, received {actual}")]
    SizeMismatch {
        digest: String,
        expected: u64,
        actual: u64,
    },

    /// Layer blob could not be decompressed
    #[error("Decompression failed for {digest}: {message}")]
    DecompressionError { digest: String, message: String },

    /// Layer archive structure is malformed
    #[error("Malformed archive in {digest}: {message}")]
    ArchiveParseError { digest: String, message: String },

    /// Entry path or link target escapes the destination root
    #[error("Path traversal rejected for '{}': {reason}", path.display())]
    PathTraversal { path: PathBuf, reason: String },

    /// Entry conflicts with what already exists at its path
    #[error("Path conflict at '{}': {message}", path.display())]
    PathConflict { path: PathBuf, message: String },

    /// Entry or layer exceeds the configured size limit
    #[error("Entry too large at '{}': {size} bytes exceeds limit of {limit}", path.display())]
    EntryTooLarge { path: PathBuf, size: u64, limit: u64 },

    /// Special file rejected by the configured policy
    #[error("Unsupported entry type '{kind}' at '{}'", path.display())]
    UnsupportedEntry { path: PathBuf, kind: String },

    /// Blob fetch reported by the fetch collaborator
    #[error("Failed to fetch {digest}: {message}")]
    FetchFailure { digest: String, message: String },

    /// Manifest could not be resolved for a reference
    #[error("Manifest error for {reference}: {message}")]
    ManifestError { reference: String, message: String },

    /// Image reference could not be parsed
    #[error("Invalid image reference '{reference}': {message}")]
    InvalidReference { reference: String, message: String },

    /// A blob referenced by the manifest could not be bundled
    #[error("Incomplete bundle: blob {digest} unavailable: {message}")]
    IncompleteBundle { digest: String, message: String },

    /// Materialization was cancelled
    #[error("Materialization cancelled{}", layer.map(|i| format!(" at layer {}", i)).unwrap_or_default())]
    Cancelled { layer: Option<usize> },

    /// Failure while processing a specific layer
    #[error("Layer {index} ({digest}) failed: {source}")]
    Layer {
        index: usize,
        digest: String,
        #[source]
        source: Box<FoldError>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl FoldError {
    /// Wrap an error with the index and digest of the layer being processed.
    ///
    /// Already-wrapped errors and cancellations pass through unchanged.
    pub fn in_layer(self, index: usize, digest: impl Into<String>) -> Self {
        match self {
            FoldError::Layer { .. } | FoldError::Cancelled { .. } => self,
            other => FoldError::Layer {
                index,
                digest: digest.into(),
                source: Box::new(other),
            },
        }
    }

    /// The underlying error kind, looking through layer context.
    pub fn innermost(&self) -> &FoldError {
        match self {
            FoldError::Layer { source, .. } => source.innermost(),
            other => other,
        }
    }

    /// Index of the layer the error occurred in, if known.
    pub fn layer_index(&self) -> Option<usize> {
        match self {
            FoldError::Layer { index, .. } => Some(*index),
            FoldError::Cancelled { layer } => *layer,
            _ => None,
        }
    }
}

impl From<serde_json::Error> for FoldError {
    fn from(err: serde_json::Error) -> Self {
        FoldError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for FoldError {
    fn from(err: serde_yaml::Error) -> Self {
        FoldError::Serialization(err.to_string())
    }
}

/// Result type alias for layerfold operations
pub type Result<T> = std::result::Result<T, FoldError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_digest_display() {
        let error = FoldError::MalformedDigest {
            value: "sha256:xyz".to_string(),
            reason: "expected 64 hex characters".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Malformed digest 'sha256:xyz': expected 64 hex characters"
        );
    }

    #[test]
    fn test_path_traversal_display() {
        let error = FoldError::PathTraversal {
            path: PathBuf::from("../../etc/passwd"),
            reason: "parent directory component".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Path traversal rejected for '../../etc/passwd': parent directory component"
        );
    }

    #[test]
    fn test_cancelled_display() {
        assert_eq!(
            FoldError::Cancelled { layer: None }.to_string(),
            "Materialization cancelled"
        );
        assert_eq!(
            FoldError::Cancelled { layer: Some(2) }.to_string(),
            "Materialization cancelled at layer 2"
        );
    }

    #[test]
    fn test_in_layer_wraps_and_innermost_unwraps() {
        let error = FoldError::FetchFailure {
            digest: "sha256:abc".to_string(),
            message: "connection reset".to_string(),
        }
        .in_layer(1, "sha256:abc");

        assert_eq!(error.layer_index(), Some(1));
        assert!(matches!(error.innermost(), FoldError::FetchFailure { .. }));
        assert_eq!(
            error.to_string(),
            "Layer 1 (sha256:abc) failed: Failed to fetch sha256:abc: connection reset"
        );
    }

    #[test]
    fn test_in_layer_does_not_double_wrap() {
        let error = FoldError::Other("boom".to_string())
            .in_layer(0, "sha256:a")
            .in_layer(3, "sha256:b");
        assert_eq!(error.layer_index(), Some(0));
    }

    #[test]
    fn test_in_layer_keeps_cancellation() {
        let error = FoldError::Cancelled { layer: Some(4) }.in_layer(4, "sha256:a");
        assert!(matches!(error, FoldError::Cancelled { layer: Some(4) }));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let fold_error: FoldError = io_error.into();
        assert!(matches!(fold_error, FoldError::Io(_)));
        assert!(fold_error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let fold_error: FoldError = result.unwrap_err().into();
        assert!(matches!(fold_error, FoldError::Serialization(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let fold_error: FoldError = result.unwrap_err().into();
        assert!(matches!(fold_error, FoldError::Serialization(_)));
    }
}
