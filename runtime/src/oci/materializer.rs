//! Filesystem materialization.
//!
//! Applies decoded layer entries to a destination tree in order, with OCI whiteout
//! semantics. Every path goes through [`RootedFs`] so writes stay inside the root.

use std::collections::HashSet;
use std::fs::{self, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use layerfold_core::config::{MaterializeConfig, SpecialFilePolicy};
use layerfold_core::error::{FoldError, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::decoder::{ArchiveEntry, EntryKind};
use super::safepath::{normalize_entry_path, RootedFs};

/// Prefix marking a whiteout entry.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Name of the opaque directory marker.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;
const MODE_MASK: u32 = 0o7777;

/// Statistics for one applied layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LayerReport {
    pub index: usize,
    pub digest: String,
    pub entries: u64,
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub hardlinks: u64,
    pub whiteouts: u64,
    pub bytes_written: u64,
    /// Special entries skipped by policy
    pub skipped: Vec<PathBuf>,
}

/// Per-layer bookkeeping.
#[derive(Default)]
struct LayerState {
    report: LayerReport,
    /// Resolved paths written by the current layer
    written: HashSet<PathBuf>,
    /// Directory modes applied once the layer is complete
    dir_modes: Vec<(PathBuf, u32)>,
    unpacked: u64,
}

/// Applies layers to a directory tree.
#[derive(Debug, Clone)]
pub struct TreeMaterializer {
    fs: RootedFs,
    max_entry_size: u64,
    max_layer_unpacked_size: u64,
    special_files: SpecialFilePolicy,
    apply_whiteouts: bool,
    preserve_permissions: bool,
}

impl TreeMaterializer {
    /// Open `base_path` (created if missing) as the destination root.
    pub fn new(base_path: &Path, config: &MaterializeConfig) -> Result<Self> {
        Ok(Self {
            fs: RootedFs::open(base_path)?,
            max_entry_size: config.max_entry_size,
            max_layer_unpacked_size: config.max_layer_unpacked_size,
            special_files: config.special_files,
            apply_whiteouts: config.apply_whiteouts,
            preserve_permissions: config.preserve_permissions,
        })
    }

    /// Canonical destination root.
    pub fn root(&self) -> &Path {
        self.fs.root()
    }

    /// Apply one layer's entries.
    ///
    /// Cancellation is checked before every entry. On error the layer is left partially
    /// applied.
    pub fn apply_layer<'a, I>(
        &self,
        index: usize,
        digest: &str,
        entries: I,
        cancel: &CancellationToken,
    ) -> Result<LayerReport>
    where
        I: IntoIterator<Item = Result<ArchiveEntry<'a>>>,
    {
        let mut state = LayerState {
            report: LayerReport {
                index,
                digest: digest.to_string(),
                ..Default::default()
            },
            ..Default::default()
        };

        let mut entries = entries.into_iter();
        loop {
            if cancel.is_cancelled() {
                return Err(FoldError::Cancelled { layer: Some(index) });
            }
            let Some(entry) = entries.next() else {
                break;
            };
            let mut entry = entry?;
            state.report.entries += 1;
            self.apply_entry(&mut state, &mut entry)?;
        }

        // deepest first so read-only parents do not block their children
        state
            .dir_modes
            .sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
        for (path, mode) in &state.dir_modes {
            fs::set_permissions(path, Permissions::from_mode(*mode))?;
        }

        Ok(state.report)
    }

    fn apply_entry(&self, state: &mut LayerState, entry: &mut ArchiveEntry<'_>) -> Result<()> {
        let rel = normalize_entry_path(entry.path())?;
        if rel.as_os_str().is_empty() {
            return Ok(());
        }

        if entry.size > self.max_entry_size {
            return Err(FoldError::EntryTooLarge {
                path: rel,
                size: entry.size,
                limit: self.max_entry_size,
            });
        }
        state.unpacked = state.unpacked.saturating_add(entry.size);
        if state.unpacked > self.max_layer_unpacked_size {
            return Err(FoldError::EntryTooLarge {
                path: rel,
                size: state.unpacked,
                limit: self.max_layer_unpacked_size,
            });
        }

        if self.apply_whiteouts {
            if let Some(name) = rel.file_name().and_then(|n| n.to_str()) {
                if name == OPAQUE_WHITEOUT {
                    return self.apply_opaque(state, &rel);
                }
                if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                    let hidden = hidden.to_string();
                    return self.apply_whiteout(state, &rel, &hidden);
                }
            }
        }

        tracing::debug!(path = %rel.display(), kind = ?entry.kind, size = entry.size, "Applying entry");

        match entry.kind.clone() {
            EntryKind::Directory => self.create_directory(state, &rel, entry.mode),
            EntryKind::File => self.write_file(state, &rel, entry),
            EntryKind::Symlink => self.create_symlink(state, &rel, entry),
            EntryKind::HardLink => self.create_hardlink(state, &rel, entry),
            EntryKind::Other(kind) => match self.special_files {
                SpecialFilePolicy::Skip => {
                    tracing::warn!(path = %rel.display(), kind = %kind, "Skipping special file");
                    state.report.skipped.push(rel);
                    Ok(())
                }
                SpecialFilePolicy::Fail => Err(FoldError::UnsupportedEntry { path: rel, kind }),
            },
        }
    }

    fn create_directory(&self, state: &mut LayerState, rel: &Path, mode: u32) -> Result<()> {
        let (parent, name) = self.fs.prepare_parent(rel)?;
        let dest = parent.absolute.join(&name);

        match fs::symlink_metadata(&dest) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(FoldError::PathConflict {
                    path: rel.to_path_buf(),
                    message: "a non-directory already exists at this path".to_string(),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::DirBuilder::new()
                    .mode(DEFAULT_DIR_MODE)
                    .create(&dest)
                    .map_err(|e| io_context(e, "create directory", &dest))?;
            }
            Err(e) => return Err(io_context(e, "inspect", &dest)),
        }

        if self.preserve_permissions {
            state.dir_modes.push((dest, mode & MODE_MASK));
        }
        state.written.insert(parent.relative.join(&name));
        state.report.directories += 1;
        Ok(())
    }

    fn write_file(&self, state: &mut LayerState, rel: &Path, entry: &mut ArchiveEntry<'_>) -> Result<()> {
        let (parent, name) = self.fs.prepare_parent(rel)?;
        let dest = parent.absolute.join(&name);
        remove_non_directory(rel, &dest)?;

        let mode = if self.preserve_permissions {
            entry.mode & MODE_MASK
        } else {
            DEFAULT_FILE_MODE
        };

        // create_new never follows a link that appeared at the final path
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&dest)
            .map_err(|e| io_context(e, "create file", &dest))?;
        let written = entry.copy_content_to(&mut file)?;
        file.set_permissions(Permissions::from_mode(mode))?;

        state.written.insert(parent.relative.join(&name));
        state.report.files += 1;
        state.report.bytes_written += written;
        Ok(())
    }

    fn create_symlink(&self, state: &mut LayerState, rel: &Path, entry: &ArchiveEntry<'_>) -> Result<()> {
        let target = link_target(rel, entry)?;
        let (parent, name) = self.fs.prepare_parent(rel)?;
        self.fs.check_link_target(rel, &parent.relative, &target)?;

        let dest = parent.absolute.join(&name);
        remove_non_directory(rel, &dest)?;
        std::os::unix::fs::symlink(&target, &dest)
            .map_err(|e| io_context(e, "create symlink", &dest))?;

        state.written.insert(parent.relative.join(&name));
        state.report.symlinks += 1;
        Ok(())
    }

    fn create_hardlink(&self, state: &mut LayerState, rel: &Path, entry: &ArchiveEntry<'_>) -> Result<()> {
        let target = normalize_entry_path(&link_target(rel, entry)?)?;
        let source = self.fs.resolve_nofollow(&target)?;
        match fs::symlink_metadata(&source.absolute) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(FoldError::PathConflict {
                    path: rel.to_path_buf(),
                    message: format!("hard link target '{}' is not a regular file", target.display()),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FoldError::PathConflict {
                    path: rel.to_path_buf(),
                    message: format!("hard link target '{}' does not exist", target.display()),
                })
            }
            Err(e) => return Err(io_context(e, "inspect", &source.absolute)),
        }

        let (parent, name) = self.fs.prepare_parent(rel)?;
        let dest = parent.absolute.join(&name);
        if dest == source.absolute {
            return Ok(());
        }
        remove_non_directory(rel, &dest)?;
        fs::hard_link(&source.absolute, &dest).map_err(|e| io_context(e, "create hard link", &dest))?;

        state.written.insert(parent.relative.join(&name));
        state.report.hardlinks += 1;
        Ok(())
    }

    /// `.wh.<name>` removes `<name>` from lower layers.
    fn apply_whiteout(&self, state: &mut LayerState, rel: &Path, hidden: &str) -> Result<()> {
        if hidden.is_empty() || hidden == "." || hidden == ".." {
            return Err(FoldError::PathTraversal {
                path: rel.to_path_buf(),
                reason: format!("invalid whiteout target '{}'", hidden),
            });
        }
        state.report.whiteouts += 1;

        let Some((parent, _)) = self.fs.existing_parent(rel)? else {
            return Ok(());
        };
        let victim = parent.absolute.join(hidden);
        tracing::debug!(path = %parent.relative.join(hidden).display(), "Applying whiteout");
        remove_path(&victim)
    }

    /// `.wh..wh..opq` hides everything lower layers put in the directory.
    fn apply_opaque(&self, state: &mut LayerState, rel: &Path) -> Result<()> {
        state.report.whiteouts += 1;

        let Some((dir, _)) = self.fs.existing_parent(rel)? else {
            return Ok(());
        };
        tracing::debug!(path = %dir.relative.display(), "Applying opaque whiteout");
        prune_lower(&state.written, &dir.absolute, &dir.relative)
    }
}

/// Remove everything under `absolute` the current layer did not write.
///
/// Directories holding current-layer paths are descended into rather than kept whole.
fn prune_lower(written: &HashSet<PathBuf>, absolute: &Path, relative: &Path) -> Result<()> {
    let children = fs::read_dir(absolute).map_err(|e| io_context(e, "read directory", absolute))?;
    for child in children {
        let child = child.map_err(|e| io_context(e, "read directory", absolute))?;
        let child_rel = relative.join(child.file_name());
        let child_path = child.path();

        if !written.iter().any(|w| w.starts_with(&child_rel)) {
            remove_path(&child_path)?;
            continue;
        }
        let is_dir = fs::symlink_metadata(&child_path)
            .map_err(|e| io_context(e, "inspect", &child_path))?
            .is_dir();
        if is_dir {
            prune_lower(written, &child_path, &child_rel)?;
        }
    }
    Ok(())
}

fn link_target(rel: &Path, entry: &ArchiveEntry<'_>) -> Result<PathBuf> {
    entry
        .link_target
        .clone()
        .filter(|t| !t.as_os_str().is_empty())
        .ok_or_else(|| FoldError::PathConflict {
            path: rel.to_path_buf(),
            message: "link entry has no target".to_string(),
        })
}

/// Unlink whatever non-directory sits at `dest`; a directory is a conflict.
fn remove_non_directory(rel: &Path, dest: &Path) -> Result<()> {
    match fs::symlink_metadata(dest) {
        Ok(meta) if meta.is_dir() => Err(FoldError::PathConflict {
            path: rel.to_path_buf(),
            message: "a directory already exists at this path".to_string(),
        }),
        Ok(_) => fs::remove_file(dest).map_err(|e| io_context(e, "remove", dest)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_context(e, "inspect", dest)),
    }
}

/// Remove a file, link or directory tree; a missing path is not an error.
fn remove_path(path: &Path) -> Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_context(e, "remove", path)),
    }
}

fn io_context(err: io::Error, action: &str, path: &Path) -> FoldError {
    FoldError::Io(io::Error::new(
        err.kind(),
        format!("Failed to {} {}: {}", action, path.display(), err),
    ))
}
