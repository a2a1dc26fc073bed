//! Canonical artifact digests.
//!
//! The backend recomputes the same digest from the uploaded file list, so
//! the byte layout is a wire contract: `#`-divided, length-prefixed fields
//! in fixed order, files sorted by path, metadata pairs sorted by key.

use crate::artifact::ArtifactFileData;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

const HASH_ELEMENT_DIVISOR: &[u8] = b"#";
const META_ELEMENT_DIVISOR: &[u8] = b"|";

fn update_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u32).to_be_bytes());
    hasher.update(value.as_bytes());
}

/// Digest of a whole tracked file set. Identical file lists hash identically
/// regardless of discovery order.
pub fn artifact_hash(files: &[ArtifactFileData]) -> String {
    let mut sorted: Vec<&ArtifactFileData> = files.iter().collect();
    sorted.sort_by(|a, b| a.file_path.cmp(&b.file_path));

    let mut hasher = Sha256::new();
    for file in sorted {
        hasher.update(HASH_ELEMENT_DIVISOR);
        update_str(&mut hasher, &file.file_path);
        hasher.update(HASH_ELEMENT_DIVISOR);
        hasher.update(file.file_hash.as_bytes());
        hasher.update(HASH_ELEMENT_DIVISOR);
        if let Some(size) = file.size {
            hasher.update(size.to_be_bytes());
        }
        hasher.update(HASH_ELEMENT_DIVISOR);
        update_str(&mut hasher, &file.file_type);
        hasher.update(HASH_ELEMENT_DIVISOR);
        for (key, value) in &file.metadata {
            hasher.update(META_ELEMENT_DIVISOR);
            update_str(&mut hasher, key);
            hasher.update(META_ELEMENT_DIVISOR);
            update_str(&mut hasher, value);
        }
    }
    hex::encode(hasher.finalize())
}

/// Streamed content digest of one local file.
pub fn file_content_hash(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
