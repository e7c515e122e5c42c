// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Zip packaging and unpacking for build result transfer.
//!
//! The agent packages a result directory into a zip archive with
//! [`zip_folder_contents`]; the coordinator unpacks received bytes with
//! [`unzip_to_location`]. Entry names always use `/`-separated paths
//! relative to the source directory, regardless of host path convention.
//!
//! An empty source directory produces *no* archive (the file is deleted
//! rather than left as a zero-entry artifact); a zero-entry archive on the
//! unpack side is a distinguishable [`ArchiveError::NoEntries`] failure.

use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

/// Errors from archive packaging and unpacking.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("source directory does not exist: {0}")]
    MissingSource(PathBuf),

    #[error("archive has no entries")]
    NoEntries,

    #[error("archive entry '{0}' escapes the destination directory")]
    UnsafeEntry(String),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Recursively zip the contents of `source_dir` into `archive_path`.
///
/// Returns `Ok(true)` when an archive was written, `Ok(false)` when the
/// source directory held no files; in that case the archive file is removed
/// so callers see "nothing to transfer" rather than an empty file.
pub fn zip_folder_contents(
    archive_path: &Path,
    source_dir: &Path,
) -> Result<bool, ArchiveError> {
    if !source_dir.is_dir() {
        return Err(ArchiveError::MissingSource(source_dir.to_path_buf()));
    }

    let file = File::create(archive_path)?;
    let mut writer = ZipWriter::new(file);
    let entries = zip_files(source_dir, source_dir, &mut writer)?;
    writer.finish()?;

    if entries == 0 {
        debug!(archive = %archive_path.display(), "deleting empty archive");
        std::fs::remove_file(archive_path)?;
        return Ok(false);
    }

    debug!(
        archive = %archive_path.display(),
        entries,
        "finished zipping folder contents"
    );
    Ok(true)
}

/// Walk `dir` depth-first, streaming every file into the writer. Returns the
/// number of file entries written. Directory entries are sorted by name so
/// archive layout is deterministic.
fn zip_files(
    root: &Path,
    dir: &Path,
    writer: &mut ZipWriter<File>,
) -> Result<usize, ArchiveError> {
    let mut children: Vec<PathBuf> = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<_, _>>()?;
    children.sort();

    let mut entries = 0;
    let mut buf = [0u8; 8192];

    for child in children {
        if child.is_dir() {
            entries += zip_files(root, &child, writer)?;
            continue;
        }

        let entry_name = relative_entry_name(root, &child);
        writer.start_file(entry_name.as_str(), FileOptions::default())?;

        let mut input = File::open(&child)?;
        loop {
            let n = input.read(&mut buf)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n])?;
        }
        entries += 1;
    }

    Ok(entries)
}

/// Entry name for `path` relative to `root`, `/`-separated on every host.
fn relative_entry_name(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Unpack archive bytes into `dest_dir`, recreating directory structure.
///
/// Returns the number of file entries written. A zero-entry archive (or an
/// empty byte slice) fails with [`ArchiveError::NoEntries`]: the agent never
/// intentionally produces one, so receiving it indicates a broken transfer.
pub fn unzip_to_location(bytes: &[u8], dest_dir: &Path) -> Result<usize, ArchiveError> {
    if bytes.is_empty() {
        return Err(ArchiveError::NoEntries);
    }

    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    if archive.len() == 0 {
        return Err(ArchiveError::NoEntries);
    }

    std::fs::create_dir_all(dest_dir)?;

    let mut files = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(rel) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(ArchiveError::UnsafeEntry(entry.name().to_string()));
        };
        let dest = dest_dir.join(rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&dest)?;
            continue;
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&dest)?;
        io::copy(&mut entry, &mut out)?;
        files += 1;
    }

    debug!(dest = %dest_dir.display(), files, "unpacked archive");
    Ok(files)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn write_file(path: &Path, contents: &[u8]) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    /// Collect a directory tree as relative-path -> contents.
    fn collect_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
        fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
            for entry in std::fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    walk(root, &path, out);
                } else {
                    let rel = relative_entry_name(root, &path);
                    out.insert(rel, std::fs::read(&path).unwrap());
                }
            }
        }
        let mut out = BTreeMap::new();
        walk(root, root, &mut out);
        out
    }

    #[test]
    fn round_trip_preserves_tree() {
        let src = TempDir::new().unwrap();
        write_file(&src.path().join("build.log"), b"line one\nline two\n");
        write_file(&src.path().join("sub/dir/artifact.bin"), &[0u8, 1, 2, 255]);
        write_file(&src.path().join("sub/empty.txt"), b"");

        let work = TempDir::new().unwrap();
        let archive = work.path().join("logs.zip");
        assert!(zip_folder_contents(&archive, src.path()).unwrap());

        let bytes = std::fs::read(&archive).unwrap();
        let dest = TempDir::new().unwrap();
        let count = unzip_to_location(&bytes, dest.path()).unwrap();
        assert_eq!(count, 3);

        assert_eq!(collect_tree(src.path()), collect_tree(dest.path()));
    }

    #[test]
    fn entry_names_use_forward_slashes() {
        let src = TempDir::new().unwrap();
        write_file(&src.path().join("a/b/c.txt"), b"x");

        let work = TempDir::new().unwrap();
        let archive = work.path().join("out.zip");
        zip_folder_contents(&archive, src.path()).unwrap();

        let bytes = std::fs::read(&archive).unwrap();
        let mut zip = ZipArchive::new(Cursor::new(&bytes[..])).unwrap();
        let names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["a/b/c.txt".to_string()]);
    }

    #[test]
    fn empty_directory_produces_no_archive() {
        let src = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let archive = work.path().join("empty.zip");

        assert!(!zip_folder_contents(&archive, src.path()).unwrap());
        assert!(!archive.exists(), "empty archive file must be deleted");
    }

    #[test]
    fn missing_source_directory_is_an_error() {
        let work = TempDir::new().unwrap();
        let archive = work.path().join("x.zip");
        let err = zip_folder_contents(&archive, &work.path().join("nope")).unwrap_err();
        assert!(matches!(err, ArchiveError::MissingSource(_)));
    }

    #[test]
    fn unzip_rejects_empty_bytes_and_zero_entry_archives() {
        let dest = TempDir::new().unwrap();

        let err = unzip_to_location(&[], dest.path()).unwrap_err();
        assert!(matches!(err, ArchiveError::NoEntries));

        // A syntactically valid archive with zero entries is rejected too.
        let mut empty = Vec::new();
        {
            let mut writer = ZipWriter::new(Cursor::new(&mut empty));
            writer.finish().unwrap();
        }
        let err = unzip_to_location(&empty, dest.path()).unwrap_err();
        assert!(matches!(err, ArchiveError::NoEntries));
    }
}
