//! The primary-host API client.
//!
//! The engine talks to the host exclusively through the `GalleryHost` trait:
//! gallery creation plus per-image multipart uploads whose request bodies
//! stream through a counting reader, so every transmitted byte lands in both
//! the global and the per-gallery counters as it leaves the process.

mod error;

pub use self::error::{Error, ErrorKind, Result};

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::*;
use serde_derive::Deserialize;

use crate::ix::agent::config::constants as c;
use crate::ix::agent::config::{self, UploadSettings};
use crate::ix::util::path::lower_extension;

/// The pair of byte counters fed by in-flight uploads: one global (the
/// bandwidth sampler reads it) and one per-gallery (the running average).
#[derive(Clone, Default)]
pub struct ByteCounters {
    pub global: Arc<AtomicU64>,
    pub gallery: Arc<AtomicU64>,
}

impl ByteCounters {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add(&self, bytes: u64) {
        self.global.fetch_add(bytes, Ordering::Relaxed);
        self.gallery.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn global_total(&self) -> u64 {
        self.global.load(Ordering::Relaxed)
    }

    pub fn gallery_total(&self) -> u64 {
        self.gallery.load(Ordering::Relaxed)
    }
}

/// A reader that bumps the byte counters as the wrapped stream is consumed.
pub struct CountingReader<R> {
    inner: R,
    counters: ByteCounters,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R, counters: ByteCounters) -> Self {
        Self { inner, counters }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.counters.add(n as u64);
        }
        Ok(n)
    }
}

/// Identity assigned by the host when a gallery is created.
#[derive(Clone, Debug, PartialEq)]
pub struct CreatedGallery {
    pub gallery_id: String,
    pub gallery_url: String,
}

/// Result of one image upload.
#[derive(Clone, Debug, PartialEq)]
pub struct UploadedImage {
    pub image_url: String,
    pub thumbnail_url: String,
}

/// The operations the upload engine needs from the primary host.
pub trait GalleryHost: Send + Sync {
    fn create_gallery(&self, name: &str, settings: &UploadSettings) -> Result<CreatedGallery>;

    fn upload_image(
        &self,
        gallery_id: &str,
        file: &Path,
        settings: &UploadSettings,
        counters: &ByteCounters,
    ) -> Result<UploadedImage>;
}

#[derive(Deserialize)]
struct CreateGalleryResponse {
    status: String,
    #[serde(default)]
    gallery_id: String,
    #[serde(default)]
    gallery_url: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct UploadImageResponse {
    status: String,
    #[serde(default)]
    image_url: String,
    #[serde(default)]
    thumbnail_url: String,
    #[serde(default)]
    message: String,
}

/// The HTTP implementation against the imx.to API. API-only: no web login
/// happens here; the rename worker owns the authenticated web session.
pub struct ImxClient {
    client: reqwest::Client,
    api_key: String,
    api_url: String,
}

impl ImxClient {
    pub fn new(api_key: String, settings: &UploadSettings) -> Result<ImxClient> {
        Self::with_api_url(api_key, settings, c::BASE_API_URL.to_string())
    }

    pub fn with_api_url(
        api_key: String,
        settings: &UploadSettings,
        api_url: String,
    ) -> Result<ImxClient> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(ImxClient {
            client,
            api_key,
            api_url,
        })
    }

    /// Builds a client with the API key from the OS secret store.
    pub fn from_secret_store(settings: &UploadSettings) -> Result<ImxClient> {
        let api_key = config::get_secret(c::KEYRING_API_KEY_ENTRY)
            .map_err(|e| Error::transient(e.to_string()))?
            .ok_or_else(Error::missing_api_key)?;
        Self::new(api_key, settings)
    }

    fn check_status(response: &reqwest::Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::from_status(status.as_u16(), "upload endpoint"))
        }
    }
}

fn mime_for(path: &Path) -> &'static str {
    match lower_extension(path).as_ref().map(String::as_str) {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}

impl GalleryHost for ImxClient {
    fn create_gallery(&self, name: &str, settings: &UploadSettings) -> Result<CreatedGallery> {
        let params = [
            ("api_key", self.api_key.as_str()),
            ("action", "create_gallery"),
            ("gallery_name", name),
            ("public", if settings.public_gallery { "1" } else { "0" }),
        ];
        let mut response = self
            .client
            .post(&format!("{}/gallery.php", self.api_url))
            .form(&params)
            .send()?;
        Self::check_status(&response)?;

        let parsed: CreateGalleryResponse = response
            .json()
            .map_err(|e| Error::malformed_response(e.to_string()))?;
        if parsed.status != "ok" {
            return Err(Error::rejected(parsed.message));
        }
        if parsed.gallery_id.is_empty() {
            return Err(Error::malformed_response("response carried no gallery_id"));
        }
        debug!("created gallery {} ({})", parsed.gallery_id, name);
        Ok(CreatedGallery {
            gallery_id: parsed.gallery_id,
            gallery_url: parsed.gallery_url,
        })
    }

    fn upload_image(
        &self,
        gallery_id: &str,
        file: &Path,
        settings: &UploadSettings,
        counters: &ByteCounters,
    ) -> Result<UploadedImage> {
        let size = file.metadata()?.len();
        let basename = file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("image")
            .to_string();
        let reader = CountingReader::new(File::open(file)?, counters.clone());

        let part = reqwest::multipart::Part::reader_with_length(reader, size)
            .file_name(basename)
            .mime_str(mime_for(file))
            .map_err(|e| Error::malformed_response(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("api_key", self.api_key.clone())
            .text("gallery_id", gallery_id.to_string())
            .text("thumbnail_size", settings.thumbnail_size.code().to_string())
            .text(
                "thumbnail_format",
                settings.thumbnail_format.code().to_string(),
            )
            .part("image", part);

        let mut response = self
            .client
            .post(&format!("{}/upload.php", self.api_url))
            .multipart(form)
            .send()?;
        Self::check_status(&response)?;

        let parsed: UploadImageResponse = response
            .json()
            .map_err(|e| Error::malformed_response(e.to_string()))?;
        if parsed.status != "ok" {
            return Err(Error::rejected(parsed.message));
        }
        if parsed.image_url.is_empty() {
            return Err(Error::malformed_response("response carried no image_url"));
        }
        Ok(UploadedImage {
            image_url: parsed.image_url,
            thumbnail_url: parsed.thumbnail_url,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn counting_reader_tracks_both_counters() {
        let counters = ByteCounters::new();
        let mut reader = CountingReader::new(Cursor::new(vec![0u8; 4096]), counters.clone());
        let mut sink = Vec::new();
        io::copy(&mut reader, &mut sink).unwrap();

        assert_eq!(sink.len(), 4096);
        assert_eq!(counters.global_total(), 4096);
        assert_eq!(counters.gallery_total(), 4096);
    }

    #[test]
    fn gallery_counter_resets_independently() {
        let shared_global = Arc::new(AtomicU64::new(0));
        let first = ByteCounters {
            global: shared_global.clone(),
            gallery: Arc::new(AtomicU64::new(0)),
        };
        first.add(100);
        let second = ByteCounters {
            global: shared_global.clone(),
            gallery: Arc::new(AtomicU64::new(0)),
        };
        second.add(50);

        assert_eq!(first.global_total(), 150);
        assert_eq!(second.gallery_total(), 50);
        assert_eq!(first.gallery_total(), 100);
    }

    #[test]
    fn status_taxonomy_splits_transient_and_fatal() {
        assert!(Error::from_status(500, "x").is_transient());
        assert!(Error::from_status(503, "x").is_transient());
        assert!(!Error::from_status(404, "x").is_transient());
        assert!(!Error::from_status(422, "x").is_transient());
    }

    #[test]
    fn mime_is_derived_from_extension() {
        assert_eq!(mime_for(Path::new("a.JPG")), "image/jpeg");
        assert_eq!(mime_for(Path::new("a.png")), "image/png");
        assert_eq!(mime_for(Path::new("a.gif")), "image/gif");
        assert_eq!(mime_for(Path::new("a")), "application/octet-stream");
    }
}
