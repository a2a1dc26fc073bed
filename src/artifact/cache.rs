//! Local file-hash cache.
//!
//! Re-hashing large tracked files on every run is wasteful, so content
//! hashes are remembered per absolute path in a small text file under the
//! user cache directory. A stored hash is trusted only while the recorded
//! modification time is not older than the file's current one.

use crate::artifact::hasher::file_content_hash;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

const FORMAT_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq)]
struct CacheEntry {
    hash: String,
    mtime_ns: i64,
}

pub struct LocalHashCache {
    cache_file: PathBuf,
    entries: HashMap<PathBuf, CacheEntry>,
    dirty: bool,
}

impl LocalHashCache {
    /// Opens the cache at `file`, or at the default per-user location.
    pub fn open(file: Option<PathBuf>) -> Result<Self> {
        let cache_file = match file {
            Some(file) => file,
            None => default_cache_file()?,
        };
        let entries = if cache_file.exists() {
            load_from_file(&cache_file)?
        } else {
            HashMap::new()
        };
        Ok(LocalHashCache {
            cache_file,
            entries,
            dirty: false,
        })
    }

    /// Content hash of `path`, reusing the cached value while the file's
    /// modification time has not advanced past the recorded one.
    pub fn file_hash(&mut self, path: &Path) -> Result<String> {
        let absolute = path.canonicalize()?;
        let mtime_ns = current_mtime_ns(&absolute)?;

        if let Some(entry) = self.entries.get(&absolute) {
            if entry.mtime_ns >= mtime_ns {
                return Ok(entry.hash.clone());
            }
        }

        let hash = file_content_hash(&absolute)?;
        self.entries.insert(
            absolute,
            CacheEntry {
                hash: hash.clone(),
                mtime_ns,
            },
        );
        self.dirty = true;
        Ok(hash)
    }

    /// Persists the cache if anything changed since open or the last save.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.cache_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp_file = self.cache_file.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&temp_file)?;
            writeln!(file, "# runsync file hashes {}", FORMAT_VERSION)?;

            let mut sorted: Vec<(&PathBuf, &CacheEntry)> = self.entries.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            for (path, entry) in sorted {
                writeln!(
                    file,
                    "{} {} {}",
                    entry.mtime_ns,
                    entry.hash,
                    path.display()
                )?;
            }
        }
        std::fs::rename(&temp_file, &self.cache_file)?;
        self.dirty = false;
        Ok(())
    }
}

fn default_cache_file() -> Result<PathBuf> {
    let base = dirs::cache_dir().ok_or_else(|| {
        Error::InternalClient("cannot determine the user cache directory".into())
    })?;
    Ok(base.join("runsync").join("file_hashes.lst"))
}

fn current_mtime_ns(path: &Path) -> Result<i64> {
    let mtime = std::fs::metadata(path)?.modified()?;
    Ok(mtime.duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as i64)
}

fn load_from_file(path: &Path) -> Result<HashMap<PathBuf, CacheEntry>> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut entries = HashMap::new();

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        // <mtime_ns> <hash> <path>
        let parts: Vec<&str> = line.splitn(3, ' ').collect();
        if parts.len() != 3 {
            continue;
        }
        let mtime_ns: i64 = match parts[0].parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        entries.insert(
            PathBuf::from(parts[2]),
            CacheEntry {
                hash: parts[1].to_owned(),
                mtime_ns,
            },
        );
    }
    Ok(entries)
}
