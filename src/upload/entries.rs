//! Upload entry resolution and packaging.
//!
//! File-set globs expand to concrete files, get target names relative to
//! their common root, and are grouped into bounded packages before the
//! bulk-vs-chunked decision is made per package.

use crate::config::UploadConfig;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

// =============================================================================
// UploadEntry
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum UploadSource {
    /// A path on the local filesystem.
    File(PathBuf),
    /// An in-memory payload with no filesystem identity.
    Bytes(Bytes),
}

/// One payload scheduled for upload and its name in the remote namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct UploadEntry {
    pub source: UploadSource,
    pub target_path: String,
}

impl UploadEntry {
    pub fn from_file(source: PathBuf, target_path: String) -> Self {
        UploadEntry {
            source: UploadSource::File(source),
            target_path,
        }
    }

    pub fn from_bytes(content: Bytes, target_path: String) -> Self {
        UploadEntry {
            source: UploadSource::Bytes(content),
            target_path,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.source, UploadSource::Bytes(_))
    }

    pub fn length(&self) -> Result<u64> {
        match &self.source {
            UploadSource::Bytes(bytes) => Ok(bytes.len() as u64),
            UploadSource::File(path) => match std::fs::metadata(path) {
                Ok(meta) => Ok(meta.len()),
                Err(err) => Err(Error::FileUpload {
                    path: path.display().to_string(),
                    reason: err.to_string(),
                }),
            },
        }
    }

    /// POSIX permission string for the transfer headers. Streams and vanished
    /// sources report no permissions at all.
    pub fn permissions(&self) -> String {
        match &self.source {
            UploadSource::Bytes(_) => NO_PERMISSIONS.to_owned(),
            UploadSource::File(path) => permissions_to_unix_string(path),
        }
    }
}

pub const NO_PERMISSIONS: &str = "----------";

#[cfg(unix)]
pub fn permissions_to_unix_string(path: &Path) -> String {
    use std::os::unix::fs::MetadataExt;
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(_) => return NO_PERMISSIONS.to_owned(),
    };
    let mode = meta.mode();
    let mut out = String::with_capacity(10);
    out.push(if meta.is_dir() { 'd' } else { '-' });
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

#[cfg(not(unix))]
pub fn permissions_to_unix_string(_path: &Path) -> String {
    NO_PERMISSIONS.to_owned()
}

// =============================================================================
// Glob resolution and directory scanning
// =============================================================================

/// Expands file-set globs into unique upload entries. Target names are taken
/// relative to the common root of all matches; directory matches are walked
/// recursively.
pub fn resolve_glob_entries(file_globs: &[String]) -> Result<BTreeSet<UploadEntry>> {
    let mut absolute_paths = BTreeSet::new();
    for file_glob in file_globs {
        let matches = glob::glob(file_glob)
            .map_err(|err| Error::InternalClient(format!("invalid glob {file_glob}: {err}")))?;
        for entry in matches.flatten() {
            absolute_paths.insert(absolutize(&entry)?);
        }
    }

    let paths: Vec<PathBuf> = absolute_paths.into_iter().collect();
    let root = common_root(&paths);

    let mut entries = Vec::with_capacity(paths.len());
    for path in paths {
        let target = match &root {
            Some(root) => path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_path_buf(),
            None => path.clone(),
        };
        entries.push(UploadEntry::from_file(path, normalize_target(&target)));
    }
    scan_unique_entries(entries)
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Longest shared ancestor directory of all paths, `None` when there is none.
fn common_root(paths: &[PathBuf]) -> Option<PathBuf> {
    let first = paths.first()?;
    let mut root: PathBuf = if first.is_file() {
        first.parent()?.to_path_buf()
    } else {
        first.clone()
    };
    for path in &paths[1..] {
        while !path.starts_with(&root) {
            root = root.parent()?.to_path_buf();
        }
    }
    if root.is_file() {
        root = root.parent()?.to_path_buf();
    }
    // Matches under the working directory keep names relative to it, so a
    // project tree uploads with stable, recognizable targets.
    if let Ok(cwd) = std::env::current_dir() {
        if root.starts_with(&cwd) {
            root = cwd;
        }
    }
    Some(root)
}

fn normalize_target(path: &Path) -> String {
    path.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/")
}

/// Replaces directory entries with one entry per contained file, recursively,
/// dropping duplicates.
fn scan_unique_entries(entries: Vec<UploadEntry>) -> Result<BTreeSet<UploadEntry>> {
    let mut out = BTreeSet::new();
    for entry in entries {
        match &entry.source {
            UploadSource::File(path) if path.is_dir() => {
                walk_dir(path, &entry.target_path, &mut out)?;
            }
            _ => {
                out.insert(entry);
            }
        }
    }
    Ok(out)
}

fn walk_dir(dir: &Path, target_root: &str, out: &mut BTreeSet<UploadEntry>) -> Result<()> {
    for item in std::fs::read_dir(dir)? {
        let item = item?;
        let path = item.path();
        let target = format!("{}/{}", target_root, item.file_name().to_string_lossy());
        if path.is_dir() {
            walk_dir(&path, &target, out)?;
        } else {
            out.insert(UploadEntry::from_file(path, target));
        }
    }
    Ok(())
}

// =============================================================================
// Packaging
// =============================================================================

/// A group of entries uploaded together.
#[derive(Debug, Default, PartialEq)]
pub struct UploadPackage {
    pub items: Vec<UploadEntry>,
    pub size: u64,
}

impl UploadPackage {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn push(&mut self, entry: UploadEntry, size: u64) {
        self.items.push(entry);
        self.size += size;
    }

    fn take(&mut self) -> UploadPackage {
        std::mem::take(self)
    }
}

/// Splits entries into packages bounded by cumulative size and file count.
/// Stream entries always travel alone. The trailing package may be empty;
/// the caller decides whether an empty package still needs to be sent.
pub fn split_into_packages(
    entries: impl IntoIterator<Item = UploadEntry>,
    config: &UploadConfig,
) -> Result<Vec<UploadPackage>> {
    let mut packages = Vec::new();
    let mut current = UploadPackage::default();

    for entry in entries {
        if entry.is_stream() {
            if !current.is_empty() {
                packages.push(current.take());
            }
            let size = entry.length()?;
            current.push(entry, size);
            packages.push(current.take());
        } else {
            let size = entry.length()?;
            let over_size = size + current.size > config.max_package_size;
            let over_count = current.items.len() >= config.max_package_files;
            if (over_size || over_count) && !current.is_empty() {
                packages.push(current.take());
            }
            current.push(entry, size);
        }
    }

    packages.push(current);
    Ok(packages)
}
