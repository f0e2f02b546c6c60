//! Gallery archive packaging.
//!
//! File hosts and hooks both consume whole galleries as ZIP containers.
//! Archives are written in store mode (no compression) because the contents
//! are already-compressed images and transfer speed wins over size.

mod error;

pub use self::error::{Error, ErrorKind, Result};

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::*;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::ix::agent::config::constants as c;
use crate::ix::util::strings;

/// Compression mode for gallery archives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    /// No compression, maximum speed. The default for upload archives.
    Store,
    Deflate,
}

impl Compression {
    fn method(self) -> CompressionMethod {
        match self {
            Compression::Store => CompressionMethod::Stored,
            Compression::Deflate => CompressionMethod::Deflated,
        }
    }
}

/// Zips a folder recursively into `output_path`, entries named relative to
/// the folder's parent (so the archive unpacks into one directory).
pub fn zip_folder(folder: &Path, output_path: &Path, compression: Compression) -> Result<PathBuf> {
    if !folder.is_dir() {
        return Err(Error::not_a_directory(folder.to_path_buf()));
    }
    let base = folder.parent().unwrap_or(folder);

    let file = File::create(output_path)?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default()
        .compression_method(compression.method())
        .large_file(true);

    let mut entries = 0usize;
    for entry in WalkDir::new(folder) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(base)
            .expect("walked entries live under the base directory");
        writer.start_file(relative.to_string_lossy().replace('\\', "/"), options)?;
        let mut input = File::open(entry.path())?;
        io::copy(&mut input, &mut writer)?;
        entries += 1;
    }
    writer.finish()?;

    if entries == 0 {
        let _ = std::fs::remove_file(output_path);
        return Err(Error::empty_folder(folder.to_path_buf()));
    }
    debug!("archived {} file(s) into {:?}", entries, output_path);
    Ok(output_path.to_path_buf())
}

/// Creates a store-mode ZIP of the folder in the system temp directory,
/// named after the folder. An unremovable leftover gets a random suffix
/// instead.
pub fn create_temp_zip(folder: &Path) -> Result<PathBuf> {
    let folder_name = folder
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("gallery");

    let mut target = std::env::temp_dir().join(format!("{}.zip", folder_name));
    if target.exists() && std::fs::remove_file(&target).is_err() {
        target = std::env::temp_dir().join(format!(
            "{}.zip",
            strings::random_suffix(folder_name)
        ));
    }
    zip_folder(folder, &target, Compression::Store)
}

/// Removes a temporary file, retrying with exponential backoff. External
/// processes may hold the handle briefly after their process exits; up to
/// five attempts are made, 100 ms doubling to 1.6 s.
pub fn remove_temp_file_with_retry(path: &Path) -> bool {
    if !path.exists() {
        return true;
    }
    let mut delay = Duration::from_millis(c::TEMP_REMOVE_INITIAL_DELAY_MS);
    for attempt in 0..c::TEMP_REMOVE_MAX_RETRIES {
        match std::fs::remove_file(path) {
            Ok(()) => {
                debug!("removed temporary file {:?} (attempt {})", path, attempt + 1);
                return true;
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => return true,
            Err(e) => {
                if attempt + 1 == c::TEMP_REMOVE_MAX_RETRIES {
                    warn!(
                        "couldn't remove temporary file after {} attempts ({}): {:?}",
                        c::TEMP_REMOVE_MAX_RETRIES, e, path
                    );
                    return false;
                }
                thread::sleep(delay);
                delay *= 2;
            }
        }
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{Read, Write as _};

    fn gallery_with_files(files: &[(&str, &[u8])]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, contents) in files {
            File::create(dir.path().join(name))
                .unwrap()
                .write_all(contents)
                .unwrap();
        }
        dir
    }

    #[test]
    fn zip_folder_stores_every_file() {
        let dir = gallery_with_files(&[("a.jpg", b"aaaa"), ("b.jpg", b"bb")]);
        let out = dir.path().parent().unwrap().join(format!(
            "{}-test.zip",
            dir.path().file_name().unwrap().to_str().unwrap()
        ));
        zip_folder(dir.path(), &out, Compression::Store).unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
        let folder_name = dir.path().file_name().unwrap().to_str().unwrap().to_string();
        let mut contents = String::new();
        archive
            .by_name(&format!("{}/a.jpg", folder_name))
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "aaaa");
        let _ = std::fs::remove_file(out);
    }

    #[test]
    fn store_mode_does_not_compress() {
        let dir = gallery_with_files(&[("a.jpg", &[7u8; 1024])]);
        let out = std::env::temp_dir().join(crate::ix::util::strings::random_suffix("store-test"));
        zip_folder(dir.path(), &out, Compression::Store).unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
        let entry = archive.by_index(0).unwrap();
        assert_eq!(entry.compression(), CompressionMethod::Stored);
        assert_eq!(entry.compressed_size(), entry.size());
        let _ = std::fs::remove_file(out);
    }

    #[test]
    fn empty_folder_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = std::env::temp_dir().join(crate::ix::util::strings::random_suffix("empty-test"));
        assert!(zip_folder(dir.path(), &out, Compression::Store).is_err());
        assert!(!out.exists());
    }

    #[test]
    fn create_temp_zip_lands_in_temp_dir() {
        let dir = gallery_with_files(&[("a.jpg", b"x")]);
        let zip_path = create_temp_zip(dir.path()).unwrap();
        assert!(zip_path.starts_with(std::env::temp_dir()));
        assert!(zip_path.exists());
        assert!(remove_temp_file_with_retry(&zip_path));
        assert!(!zip_path.exists());
    }

    #[test]
    fn removing_a_missing_file_succeeds() {
        assert!(remove_temp_file_with_retry(Path::new(
            "/tmp/imxup-definitely-not-here.zip"
        )));
    }
}
