//! Path safety for untrusted archive entries.
//!
//! Entry paths are normalized lexically, then walked component by component against
//! the destination tree. Symlinks already on disk are followed inside the root only,
//! so no write performed through a resolved path can land outside it.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};

use layerfold_core::error::{FoldError, Result};

/// Symlink hops allowed while resolving one path.
pub const MAX_SYMLINK_HOPS: usize = 40;

/// Mode for parent directories created implicitly.
const IMPLICIT_DIR_MODE: u32 = 0o755;

/// Normalize an archive entry path to a relative path without `.` components.
///
/// Absolute paths and `..` components are rejected. The archive root normalizes to
/// the empty path.
pub fn normalize_entry_path(raw: &Path) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(FoldError::PathTraversal {
                    path: raw.to_path_buf(),
                    reason: "parent directory component".to_string(),
                })
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(FoldError::PathTraversal {
                    path: raw.to_path_buf(),
                    reason: "absolute path".to_string(),
                })
            }
        }
    }
    Ok(normalized)
}

/// A path resolved inside the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootedPath {
    /// Path relative to the root, free of symlinks in every component but possibly the last
    pub relative: PathBuf,
    /// Absolute path on disk
    pub absolute: PathBuf,
}

/// Destination tree with in-root path resolution.
#[derive(Debug, Clone)]
pub struct RootedFs {
    root: PathBuf,
}

impl RootedFs {
    /// Open `base_path` as a root, creating it if needed.
    pub fn open(base_path: &Path) -> Result<Self> {
        fs::create_dir_all(base_path).map_err(|e| {
            FoldError::Io(io::Error::new(
                e.kind(),
                format!("Failed to create {}: {}", base_path.display(), e),
            ))
        })?;
        let root = fs::canonicalize(base_path)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the parent of a normalized entry path, creating missing directories.
    ///
    /// Returns the resolved parent and the entry's final name.
    pub fn prepare_parent(&self, entry: &Path) -> Result<(RootedPath, OsString)> {
        let name = entry
            .file_name()
            .ok_or_else(|| FoldError::PathTraversal {
                path: entry.to_path_buf(),
                reason: "entry has no file name".to_string(),
            })?
            .to_os_string();
        let parent = entry.parent().unwrap_or_else(|| Path::new(""));
        let resolved = self.walk(entry, parent, true, true)?;
        Ok((resolved, name))
    }

    /// Resolve the parent of a normalized entry path without creating anything.
    ///
    /// Returns `None` when some component of the parent does not exist.
    pub fn existing_parent(&self, entry: &Path) -> Result<Option<(RootedPath, OsString)>> {
        let Some(name) = entry.file_name() else {
            return Ok(None);
        };
        let parent = entry.parent().unwrap_or_else(|| Path::new(""));
        let resolved = self.walk(entry, parent, true, false)?;
        if resolved.absolute.is_dir() {
            Ok(Some((resolved, name.to_os_string())))
        } else {
            Ok(None)
        }
    }

    /// Resolve a normalized path, following intermediate symlinks but not the last one.
    pub fn resolve_nofollow(&self, entry: &Path) -> Result<RootedPath> {
        self.walk(entry, entry, false, false)
    }

    /// Check a symlink target as the container would see it from `link_parent`.
    ///
    /// Relative targets start at the link's resolved parent, absolute ones at the
    /// root. A relative target that climbs above the root is rejected; in an absolute
    /// target `..` at the root stays at the root.
    pub fn check_link_target(&self, link: &Path, link_parent: &Path, target: &Path) -> Result<()> {
        let rooted = target.has_root();
        let mut stack: Vec<OsString> = if rooted {
            Vec::new()
        } else {
            link_parent
                .components()
                .map(|c| c.as_os_str().to_os_string())
                .collect()
        };

        for component in target.components() {
            match component {
                Component::Normal(part) => stack.push(part.to_os_string()),
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    if stack.pop().is_none() && !rooted {
                        return Err(FoldError::PathTraversal {
                            path: link.to_path_buf(),
                            reason: format!("link target '{}' escapes the root", target.display()),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Walk `path` from the root.
    ///
    /// Intermediate symlinks are replaced by their targets (absolute targets restart
    /// at the root, where `..` is clamped). When `follow_last` is false the final
    /// component is taken as is.
    /// With `create`, missing intermediate and final components become directories.
    fn walk(&self, entry: &Path, path: &Path, follow_last: bool, create: bool) -> Result<RootedPath> {
        let traversal = |reason: String| FoldError::PathTraversal {
            path: entry.to_path_buf(),
            reason,
        };

        // each pending component remembers whether it came from an absolute link target
        let mut pending: VecDeque<(OsString, bool)> = path
            .components()
            .map(|c| (c.as_os_str().to_os_string(), false))
            .collect();
        let mut resolved: Vec<OsString> = Vec::new();
        let mut hops = 0;

        while let Some((part, rooted)) = pending.pop_front() {
            match Path::new(&part).components().next() {
                Some(Component::Normal(_)) => {}
                Some(Component::ParentDir) => {
                    if resolved.pop().is_none() && !rooted {
                        return Err(traversal("symlink resolution climbs above the root".to_string()));
                    }
                    continue;
                }
                _ => continue,
            }

            let is_last = pending.is_empty();
            let candidate = self.absolute(&resolved).join(&part);

            match fs::symlink_metadata(&candidate) {
                Ok(meta) if meta.file_type().is_symlink() && (follow_last || !is_last) => {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(traversal(format!(
                            "more than {} symlinks while resolving",
                            MAX_SYMLINK_HOPS
                        )));
                    }
                    let target = fs::read_link(&candidate)?;
                    let rooted = target.has_root();
                    if rooted {
                        resolved.clear();
                    }
                    for component in target.components().rev() {
                        match component {
                            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
                            other => pending.push_front((other.as_os_str().to_os_string(), rooted)),
                        }
                    }
                }
                Ok(meta) if meta.is_dir() || (is_last && !follow_last) => resolved.push(part),
                Ok(_) if is_last && !create => resolved.push(part),
                Ok(_) => {
                    return Err(FoldError::PathConflict {
                        path: self.relative(&resolved).join(&part),
                        message: format!(
                            "'{}' is not a directory",
                            self.relative(&resolved).join(&part).display()
                        ),
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if create {
                        fs::DirBuilder::new()
                            .mode(IMPLICIT_DIR_MODE)
                            .create(&candidate)
                            .map_err(|e| {
                                FoldError::Io(io::Error::new(
                                    e.kind(),
                                    format!("Failed to create {}: {}", candidate.display(), e),
                                ))
                            })?;
                    }
                    resolved.push(part);
                }
                Err(e) => return Err(FoldError::Io(e)),
            }
        }

        Ok(RootedPath {
            relative: self.relative(&resolved),
            absolute: self.absolute(&resolved),
        })
    }

    fn absolute(&self, components: &[OsString]) -> PathBuf {
        let mut path = self.root.clone();
        path.extend(components);
        path
    }

    fn relative(&self, components: &[OsString]) -> PathBuf {
        components.iter().collect()
    }
}
