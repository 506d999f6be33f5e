//! Root-confined filesystem operations.
//!
//! Every path the worker writes goes through this module. Each operation
//! takes a target path and a confinement root; the target must resolve to
//! a location inside the root or the operation fails with
//! [`FsError::PathEscape`]. Reads refuse symlink targets outright, and
//! writes refuse any symlink in the parent chain, so a hostile working
//! tree cannot redirect worker output outside the handoff directory.

use std::fmt;
use std::fs;
use std::io;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

// ---------------------------------------------------------------------------
// FsError
// ---------------------------------------------------------------------------

/// Errors from confined filesystem operations.
#[derive(Debug)]
pub enum FsError {
    /// The target path resolves outside the confinement root.
    PathEscape {
        /// The offending path as given by the caller.
        path: PathBuf,
    },

    /// The target (or a parent component on write) is a symlink.
    Symlink {
        /// The offending path.
        path: PathBuf,
    },

    /// An underlying I/O error.
    Io {
        /// The path the operation was acting on.
        path: PathBuf,
        /// The error reported by the OS.
        source: io::Error,
    },
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PathEscape { path } => {
                write!(f, "path '{}' escapes the confinement root", path.display())
            }
            Self::Symlink { path } => {
                write!(f, "refusing symlink at '{}'", path.display())
            }
            Self::Io { path, source } => {
                write!(f, "I/O error at '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for FsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl FsError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Containment
// ---------------------------------------------------------------------------

/// Resolve `path` against `root` and verify containment.
///
/// The root must exist and is fully canonicalized. The target may not yet
/// exist: its deepest existing ancestor is canonicalized (resolving any
/// symlinked directories to their real location) and the remaining
/// components are appended after lexical normalization. `..` components
/// that would climb above the root are rejected.
pub fn resolve(path: &Path, root: &Path) -> Result<PathBuf, FsError> {
    let root_c = fs::canonicalize(root).map_err(|e| FsError::io(root, e))?;

    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root_c.join(path)
    };

    // Lexical normalization: strip `.`, apply `..` without touching the fs.
    let mut normal = PathBuf::new();
    for comp in joined.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normal.pop() {
                    return Err(FsError::PathEscape {
                        path: path.to_path_buf(),
                    });
                }
            }
            other => normal.push(other.as_os_str()),
        }
    }

    // Canonicalize the deepest existing ancestor so symlinked directories
    // resolve to their real location before the prefix check.
    let mut existing = normal.clone();
    let mut remainder: Vec<std::ffi::OsString> = Vec::new();
    let resolved = loop {
        match fs::canonicalize(&existing) {
            Ok(real) => {
                let mut r = real;
                for part in remainder.iter().rev() {
                    r.push(part);
                }
                break r;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let Some(name) = existing.file_name() else {
                    return Err(FsError::PathEscape {
                        path: path.to_path_buf(),
                    });
                };
                remainder.push(name.to_os_string());
                existing.pop();
            }
            Err(e) => return Err(FsError::io(&normal, e)),
        }
    };

    if resolved == root_c || resolved.starts_with(&root_c) {
        Ok(resolved)
    } else {
        Err(FsError::PathEscape {
            path: path.to_path_buf(),
        })
    }
}

/// Whether `path` resolves to the root itself or a location under it.
pub fn is_contained(path: &Path, root: &Path) -> bool {
    resolve(path, root).is_ok()
}

/// Like [`resolve`], but never follows the terminal component.
///
/// The parent is canonicalized and containment-checked; the final name is
/// appended lexically. Used by operations that must act on a symlink node
/// itself rather than its target (read, write, unlink).
fn resolve_no_follow(path: &Path, root: &Path) -> Result<PathBuf, FsError> {
    let root_c = fs::canonicalize(root).map_err(|e| FsError::io(root, e))?;

    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root_c.join(path)
    };

    let mut normal = PathBuf::new();
    for comp in joined.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normal.pop() {
                    return Err(FsError::PathEscape {
                        path: path.to_path_buf(),
                    });
                }
            }
            other => normal.push(other.as_os_str()),
        }
    }

    let name = normal
        .file_name()
        .ok_or_else(|| FsError::PathEscape {
            path: path.to_path_buf(),
        })?
        .to_os_string();
    let parent = normal.parent().ok_or_else(|| FsError::PathEscape {
        path: path.to_path_buf(),
    })?;

    let parent_resolved = resolve(parent, &root_c)?;
    Ok(parent_resolved.join(name))
}

/// Lexically normalize `path` against an already-canonical root, without
/// touching the filesystem. Rejects `..` climbing and non-contained
/// results. Mutating operations use this so that a symlinked ancestor is
/// *detected* by the parent-chain walk rather than silently resolved.
fn normalize_lexical(path: &Path, root_c: &Path) -> Result<PathBuf, FsError> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root_c.join(path)
    };

    let mut normal = PathBuf::new();
    for comp in joined.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normal.pop() {
                    return Err(FsError::PathEscape {
                        path: path.to_path_buf(),
                    });
                }
            }
            other => normal.push(other.as_os_str()),
        }
    }

    if normal == *root_c || normal.starts_with(root_c) {
        Ok(normal)
    } else {
        Err(FsError::PathEscape {
            path: path.to_path_buf(),
        })
    }
}

/// Verify that no ancestor of `target` strictly below `root` is a symlink.
///
/// Walks each ancestor with `symlink_metadata` (non-following). Missing
/// ancestors are fine — they will be created as real directories.
fn check_parent_chain(target: &Path, root: &Path) -> Result<(), FsError> {
    for ancestor in target.ancestors().skip(1) {
        if ancestor == root || !ancestor.starts_with(root) {
            break;
        }
        match fs::symlink_metadata(ancestor) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(FsError::Symlink {
                    path: ancestor.to_path_buf(),
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(FsError::io(ancestor, e)),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Read a file, refusing symlink targets.
///
/// The open itself uses `O_NOFOLLOW`, so a symlink swapped in between the
/// metadata check and the open still fails instead of being followed.
pub fn read(path: &Path, root: &Path) -> Result<Vec<u8>, FsError> {
    let resolved = resolve_no_follow(path, root)?;

    match fs::symlink_metadata(&resolved) {
        Ok(meta) if meta.file_type().is_symlink() => {
            return Err(FsError::Symlink { path: resolved });
        }
        Ok(_) => {}
        Err(e) => return Err(FsError::io(&resolved, e)),
    }

    let mut opts = fs::OpenOptions::new();
    opts.read(true);
    #[cfg(unix)]
    opts.custom_flags(libc::O_NOFOLLOW);

    let mut file = match opts.open(&resolved) {
        Ok(f) => f,
        #[cfg(unix)]
        Err(e) if e.raw_os_error() == Some(libc::ELOOP) => {
            return Err(FsError::Symlink { path: resolved });
        }
        Err(e) => return Err(FsError::io(&resolved, e)),
    };

    let mut buf = Vec::new();
    io::Read::read_to_end(&mut file, &mut buf).map_err(|e| FsError::io(&resolved, e))?;
    Ok(buf)
}

/// Write a file atomically: nonce-named sibling temp, then rename.
///
/// The parent chain below the root is validated symlink-free first.
/// Missing parent directories are created. On any failure the temp file
/// is removed.
pub fn write_atomic(path: &Path, bytes: &[u8], root: &Path) -> Result<(), FsError> {
    let root_c = fs::canonicalize(root).map_err(|e| FsError::io(root, e))?;
    let resolved = normalize_lexical(path, &root_c)?;
    check_parent_chain(&resolved, &root_c)?;

    let parent = resolved.parent().ok_or_else(|| FsError::PathEscape {
        path: path.to_path_buf(),
    })?;
    fs::create_dir_all(parent).map_err(|e| FsError::io(parent, e))?;

    let name = resolved
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("out");
    let nonce: u64 = rand::random();
    let tmp = parent.join(format!(".{name}.{nonce:016x}.tmp"));

    let result = write_temp_and_rename(&tmp, &resolved, bytes);
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn write_temp_and_rename(tmp: &Path, target: &Path, bytes: &[u8]) -> Result<(), FsError> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    opts.mode(0o644);

    let mut file = opts.open(tmp).map_err(|e| FsError::io(tmp, e))?;
    file.write_all(bytes).map_err(|e| FsError::io(tmp, e))?;
    drop(file);

    fs::rename(tmp, target).map_err(|e| FsError::io(target, e))
}

/// Remove a file. No-op if it does not exist.
pub fn unlink(path: &Path, root: &Path) -> Result<(), FsError> {
    let root_c = fs::canonicalize(root).map_err(|e| FsError::io(root, e))?;
    let resolved = normalize_lexical(path, &root_c)?;
    check_parent_chain(&resolved, &root_c)?;

    match fs::remove_file(&resolved) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FsError::io(&resolved, e)),
    }
}

/// Create a directory (and missing parents) under the root.
pub fn mkdir(path: &Path, root: &Path) -> Result<(), FsError> {
    let root_c = fs::canonicalize(root).map_err(|e| FsError::io(root, e))?;
    let resolved = normalize_lexical(path, &root_c)?;
    check_parent_chain(&resolved, &root_c)?;
    fs::create_dir_all(&resolved).map_err(|e| FsError::io(&resolved, e))
}

/// Recursively remove a directory strictly inside the root.
///
/// Removing the root itself is refused.
pub fn rmdir(path: &Path, root: &Path) -> Result<(), FsError> {
    let root_c = fs::canonicalize(root).map_err(|e| FsError::io(root, e))?;
    let resolved = normalize_lexical(path, &root_c)?;
    check_parent_chain(&resolved, &root_c)?;
    if resolved == root_c {
        return Err(FsError::PathEscape {
            path: path.to_path_buf(),
        });
    }

    match fs::remove_dir_all(&resolved) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FsError::io(&resolved, e)),
    }
}

/// Whether the target exists (without following a terminal symlink).
pub fn exists(path: &Path, root: &Path) -> Result<bool, FsError> {
    let resolved = resolve(path, root)?;
    Ok(fs::symlink_metadata(&resolved).is_ok())
}

/// List directory entries (full paths), re-validating containment.
pub fn read_dir(path: &Path, root: &Path) -> Result<Vec<PathBuf>, FsError> {
    let resolved = resolve(path, root)?;
    let mut entries = Vec::new();
    for entry in fs::read_dir(&resolved).map_err(|e| FsError::io(&resolved, e))? {
        let entry = entry.map_err(|e| FsError::io(&resolved, e))?;
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
