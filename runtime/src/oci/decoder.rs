//! Layer decoding.
//!
//! Turns a verified layer blob into a lazy, forward-only sequence of archive entries.
//! Compression is detected from the blob's magic bytes; decompression and tar parsing
//! happen as the sequence is consumed.

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use layerfold_core::error::{FoldError, Result};
use tar::{Archive, EntryType};

use super::manifest::DeclaredCompression;
use super::spool::VerifiedBlob;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const COPY_BUFFER_SIZE: usize = 64 * 1024;

type LayerStream = Box<dyn Read + Send>;

/// Compression format detected from a blob's leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zstd,
    Uncompressed,
}

impl Compression {
    pub fn detect(header: &[u8]) -> Self {
        if header.starts_with(&GZIP_MAGIC) {
            Self::Gzip
        } else if header.starts_with(&ZSTD_MAGIC) {
            Self::Zstd
        } else {
            Self::Uncompressed
        }
    }

    fn matches(&self, declared: DeclaredCompression) -> bool {
        matches!(
            (self, declared),
            (Self::Gzip, DeclaredCompression::Gzip)
                | (Self::Zstd, DeclaredCompression::Zstd)
                | (Self::Uncompressed, DeclaredCompression::None)
        )
    }
}

/// Kind of an archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    HardLink,
    /// Devices, fifos, global headers and anything else; carries the type name.
    Other(String),
}

impl EntryKind {
    fn from_tar(entry_type: EntryType) -> Self {
        match entry_type {
            EntryType::Regular | EntryType::Continuous => Self::File,
            EntryType::Directory => Self::Directory,
            EntryType::Symlink => Self::Symlink,
            EntryType::Link => Self::HardLink,
            EntryType::Char => Self::Other("character-device".to_string()),
            EntryType::Block => Self::Other("block-device".to_string()),
            EntryType::Fifo => Self::Other("fifo".to_string()),
            EntryType::XGlobalHeader => Self::Other("pax-global-header".to_string()),
            EntryType::GNUSparse => Self::Other("gnu-sparse".to_string()),
            other => Self::Other(format!("type-{}", other.as_byte())),
        }
    }
}

/// Marks io errors raised by the decompressor so they can be told apart from
/// archive structure errors after passing through the tar reader.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct DecompressFault(String);

struct FaultMarkingReader<R> {
    inner: R,
}

impl<R: Read> Read for FaultMarkingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner
            .read(buf)
            .map_err(|e| io::Error::new(e.kind(), DecompressFault(e.to_string())))
    }
}

fn is_decompress_fault(err: &io::Error) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> =
        err.get_ref().map(|e| e as &(dyn StdError + 'static));
    while let Some(e) = current {
        if e.is::<DecompressFault>() {
            return true;
        }
        current = match e.downcast_ref::<io::Error>() {
            Some(inner) => inner.get_ref().map(|e| e as &(dyn StdError + 'static)),
            None => e.source(),
        };
    }
    false
}

/// Map an io error raised while reading a layer to the matching error kind.
fn classify(digest: &str, err: io::Error) -> FoldError {
    if is_decompress_fault(&err) {
        FoldError::DecompressionError {
            digest: digest.to_string(),
            message: err.to_string(),
        }
    } else {
        FoldError::ArchiveParseError {
            digest: digest.to_string(),
            message: err.to_string(),
        }
    }
}

/// Decoder for one verified layer blob.
pub struct LayerDecoder {
    digest: String,
    compression: Compression,
    archive: Archive<LayerStream>,
}

impl LayerDecoder {
    /// Prepare a decoder; nothing is decompressed until entries are read.
    pub fn open(blob: VerifiedBlob) -> Result<Self> {
        let descriptor = blob.descriptor().clone();
        let digest = descriptor.digest.to_string();
        let mut file = blob.into_file();

        let mut magic = [0u8; 4];
        let n = read_prefix(&mut file, &mut magic)?;
        file.seek(SeekFrom::Start(0))?;
        let compression = Compression::detect(&magic[..n]);

        if !compression.matches(descriptor.declared_compression()) {
            tracing::warn!(
                digest = %digest,
                media_type = %descriptor.media_type,
                detected = ?compression,
                "Layer media type disagrees with detected compression"
            );
        }

        let stream: LayerStream = match compression {
            Compression::Gzip => Box::new(FaultMarkingReader {
                inner: MultiGzDecoder::new(BufReader::with_capacity(COPY_BUFFER_SIZE, file)),
            }),
            Compression::Zstd => {
                return Err(FoldError::DecompressionError {
                    digest,
                    message: "zstd compressed layers are not supported".to_string(),
                })
            }
            Compression::Uncompressed => Box::new(BufReader::with_capacity(COPY_BUFFER_SIZE, file)),
        };

        tracing::debug!(digest = %digest, compression = ?compression, "Opened layer");

        Ok(Self {
            digest,
            compression,
            archive: Archive::new(stream),
        })
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// The lazy entry sequence. Can only be consumed once.
    pub fn entries(&mut self) -> Result<ArchiveEntries<'_>> {
        let digest = self.digest.clone();
        let inner = self.archive.entries().map_err(|e| classify(&digest, e))?;
        Ok(ArchiveEntries {
            inner,
            digest,
            finished: false,
        })
    }
}

fn read_prefix(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Forward-only iterator over the entries of one layer.
///
/// Yields `Err` at most once; iteration ends after the first error.
pub struct ArchiveEntries<'a> {
    inner: tar::Entries<'a, LayerStream>,
    digest: String,
    finished: bool,
}

impl<'a> Iterator for ArchiveEntries<'a> {
    type Item = Result<ArchiveEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let next = match self.inner.next()? {
            Ok(entry) => ArchiveEntry::from_tar(entry, &self.digest),
            Err(e) => Err(classify(&self.digest, e)),
        };
        if next.is_err() {
            self.finished = true;
        }
        Some(next)
    }
}

/// One archive entry. Its content must be consumed before the next entry is read.
pub struct ArchiveEntry<'a> {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub mode: u32,
    pub size: u64,
    pub link_target: Option<PathBuf>,
    digest: String,
    content: tar::Entry<'a, LayerStream>,
}

impl<'a> ArchiveEntry<'a> {
    fn from_tar(entry: tar::Entry<'a, LayerStream>, digest: &str) -> Result<Self> {
        let parse_error = |message: String| FoldError::ArchiveParseError {
            digest: digest.to_string(),
            message,
        };

        let path = entry
            .path()
            .map_err(|e| parse_error(format!("invalid entry path: {}", e)))?
            .into_owned();
        let header = entry.header();
        let kind = EntryKind::from_tar(header.entry_type());
        let mode = header
            .mode()
            .map_err(|e| parse_error(format!("invalid mode for '{}': {}", path.display(), e)))?;
        let link_target = entry
            .link_name()
            .map_err(|e| parse_error(format!("invalid link name for '{}': {}", path.display(), e)))?
            .map(Cow::into_owned);
        let size = entry.size();

        Ok(Self {
            path,
            kind,
            mode,
            size,
            link_target,
            digest: digest.to_string(),
            content: entry,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy the entry content to `out`, returning the number of bytes written.
    ///
    /// Read failures are reported as decompression or archive errors; write failures
    /// as I/O errors.
    pub fn copy_content_to(&mut self, out: &mut impl Write) -> Result<u64> {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut written: u64 = 0;
        loop {
            let n = match self.content.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(classify(&self.digest, e)),
            };
            out.write_all(&buf[..n])?;
            written += n as u64;
        }
        Ok(written)
    }

    /// Read the whole content into memory.
    pub fn read_content(&mut self) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(self.size.min(COPY_BUFFER_SIZE as u64) as usize);
        self.copy_content_to(&mut data)?;
        Ok(data)
    }
}
