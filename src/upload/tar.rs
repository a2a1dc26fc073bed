//! In-memory tar.gz packaging for bulk file-set uploads.

use crate::error::Result;
use crate::upload::entries::{UploadEntry, UploadSource};
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Packs upload entries into one gzip-compressed tar archive held in memory.
/// Symlinked sources are dereferenced so the archive carries file content,
/// never links.
pub fn compress_to_tar_gz(entries: &[UploadEntry]) -> Result<Bytes> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(true);

    for entry in entries {
        match &entry.source {
            UploadSource::File(path) => {
                builder.append_path_with_name(path, &entry.target_path)?;
            }
            UploadSource::Bytes(bytes) => {
                let mut header = tar::Header::new_gnu();
                header.set_size(bytes.len() as u64);
                header.set_mode(0o644);
                builder.append_data(&mut header, &entry.target_path, bytes.as_ref())?;
            }
        }
    }

    let encoder = builder.into_inner()?;
    Ok(Bytes::from(encoder.finish()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::{Read, Write};
    use tempfile::TempDir;

    fn unpack(archive: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut tar = tar::Archive::new(GzDecoder::new(archive));
        let mut out = Vec::new();
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            out.push((name, content));
        }
        out
    }

    #[test]
    fn test_archive_round_trip() {
        let dir = TempDir::new().unwrap();
        let file_path = dir.path().join("a.txt");
        std::fs::File::create(&file_path)
            .unwrap()
            .write_all(b"from disk")
            .unwrap();

        let entries = vec![
            UploadEntry::from_file(file_path, "src/a.txt".into()),
            UploadEntry::from_bytes(Bytes::from_static(b"from memory"), "src/b.txt".into()),
        ];
        let archive = compress_to_tar_gz(&entries).unwrap();
        let unpacked = unpack(&archive);
        assert_eq!(
            unpacked,
            vec![
                ("src/a.txt".to_owned(), b"from disk".to_vec()),
                ("src/b.txt".to_owned(), b"from memory".to_vec()),
            ]
        );
    }

    #[test]
    fn test_empty_entry_list_still_builds_an_archive() {
        let archive = compress_to_tar_gz(&[]).unwrap();
        assert!(unpack(&archive).is_empty());
    }
}
