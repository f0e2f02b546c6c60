//! Path utilities.

use std::io;
use std::path::PathBuf;

/// Creates an empty, uniquely named temporary file with the given prefix and
/// extension, returning its path. The file lives in the system temp
/// directory and is not removed automatically.
pub fn temp(prefix: &str, extension: &str) -> io::Result<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(extension)
        .tempfile()?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

/// Returns the lowercase extension of the given path, if any.
pub fn lower_extension(path: &std::path::Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn temp_creates_unique_files() {
        let a = temp("imxup-test", ".db").unwrap();
        let b = temp("imxup-test", ".db").unwrap();
        assert_ne!(a, b);
        assert!(a.exists());
        assert!(b.exists());
        let _ = std::fs::remove_file(a);
        let _ = std::fs::remove_file(b);
    }

    #[test]
    fn lower_extension_normalizes_case() {
        assert_eq!(
            lower_extension(std::path::Path::new("/g/a/IMG.JPG")),
            Some("jpg".to_string())
        );
        assert_eq!(lower_extension(std::path::Path::new("/g/a/noext")), None);
    }
}
