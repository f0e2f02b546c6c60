//! One-shot CLI operations against the queue database.
//!
//! The `server` command runs the full agent; everything else here operates
//! on the same store through a queue manager without the upload engine, so
//! state changes (start, retry, remove) are picked up by the next running
//! server.

mod error;
pub mod output;

pub use self::error::{Error, ErrorKind, Result};

use std::fs;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::*;

use crate::ix;
use crate::ix::agent::artifacts::{self, Manifest};
use crate::ix::agent::config::{self, constants as c, Config};
use crate::ix::agent::database::{
    Database, FileHostStatus, FileHostUpload, GalleryStatus, Source, StoreWriter,
};
use crate::ix::agent::messages::{Event, EventBus};
use crate::ix::agent::queue::{QueueManager, Scanner};
use crate::ix::agent::rename::{RenameWorker, StatusCheckGallery};
use crate::ix::agent::types::{ServiceHandle, ServiceId, ShutdownFlag};

const SCAN_WAIT: Duration = Duration::from_secs(120);

/// The CLI context: a queue manager (with scan worker) over the standard
/// database, without the upload engine.
pub struct Cli {
    config: Config,
    db: Database,
    queue: Arc<QueueManager>,
    writer: StoreWriter,
    services: Vec<ServiceHandle>,
}

impl Cli {
    pub fn new(config: Config) -> Result<Cli> {
        ix::ensure_home_layout().map_err(|e| Error::refused(e.to_string()))?;
        let db = Database::new(&Source::File(
            ix::database_file()
                .map_err(|e| Error::refused(e.to_string()))?
                .to_path_buf(),
        ))?;
        let (writer, writer_thread) = StoreWriter::spawn(db.clone());
        let events = EventBus::new();
        let (queue, scan_rx) = QueueManager::new(db.clone(), writer.clone(), events)?;
        let scanner = Scanner::spawn(queue.clone(), scan_rx, config.scanning.clone());

        let mut services = vec![scanner];
        services.push(ServiceHandle::new(
            ServiceId("StoreWriter"),
            ShutdownFlag::new(),
            writer_thread,
        ));

        Ok(Cli {
            config,
            db,
            queue,
            writer,
            services,
        })
    }

    /// Flushes pending writes and stops the helper threads.
    pub fn finish(mut self) {
        self.writer.flush();
        self.writer.shutdown();
        for service in &self.services {
            service.stop();
        }
        for service in self.services.iter_mut() {
            service.join();
        }
    }

    /// Adds folders to the queue and waits for their scans to settle.
    pub fn add(&self, paths: &[String], template: Option<&str>, tab: Option<&str>) -> Result<()> {
        let report = if paths.len() == 1 {
            let mut report = crate::ix::agent::queue::AddReport::default();
            match self.queue.add_item(&paths[0], None, template, tab) {
                Ok(true) => report.added.push(paths[0].clone()),
                Ok(false) => report.duplicates.push(paths[0].clone()),
                Err(e) => report.failed.push((paths[0].clone(), e.to_string())),
            }
            report
        } else {
            self.queue.add_multiple_items(paths, template)
        };

        for (path, reason) in &report.failed {
            eprintln!("failed: {} ({})", path, reason);
        }
        for path in &report.duplicates {
            eprintln!("already queued: {}", path);
        }

        // Wait for the scan worker to settle every added item.
        let deadline = Instant::now() + SCAN_WAIT;
        for path in &report.added {
            loop {
                let status = self
                    .queue
                    .get_item(path)
                    .map(|item| item.status)
                    .ok_or_else(|| Error::unknown_gallery(path.clone()))?;
                match status {
                    GalleryStatus::Validating | GalleryStatus::Scanning => {
                        if Instant::now() > deadline {
                            eprintln!("scan still running for {}", path);
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(100));
                    }
                    _ => break,
                }
            }
            if let Some(item) = self.queue.get_item(path) {
                match item.status {
                    GalleryStatus::ScanFailed => println!(
                        "{}: scan failed ({})",
                        path,
                        item.error_message.unwrap_or_default()
                    ),
                    _ => println!(
                        "{}: {} image(s), {}",
                        path,
                        item.total_images,
                        item.status.as_ref()
                    ),
                }
            }
        }
        Ok(())
    }

    /// Queues galleries for upload. With `all`, every startable item goes.
    pub fn start(&self, paths: &[String], all: bool) -> Result<()> {
        let targets: Vec<String> = if all {
            self.queue
                .get_all_items()
                .into_iter()
                .filter(|item| item.status.is_startable())
                .map(|item| item.path)
                .collect()
        } else {
            paths.to_vec()
        };
        if targets.is_empty() {
            println!("Nothing to start.");
            return Ok(());
        }
        let mut started = 0;
        for path in &targets {
            if self.queue.start_item(path) {
                started += 1;
            } else {
                eprintln!("not startable: {}", path);
            }
        }
        println!("Queued {} gallery(ies); a running server picks them up.", started);
        Ok(())
    }

    /// Prints the current queue.
    pub fn print_queue(&self) {
        output::print_queue(&self.queue.get_all_items());
    }

    /// Prints the configured tabs.
    pub fn print_tabs(&self) -> Result<()> {
        output::print_tabs(&self.db.get_tabs()?);
        Ok(())
    }

    /// Retries a failed upload (full retry or resume, decided by progress).
    pub fn retry(&self, path: &str) -> Result<()> {
        if !self.queue.retry_failed_upload(path) {
            return Err(Error::unknown_gallery(path));
        }
        let status = self.queue.get_item(path).map(|item| item.status);
        println!("{} -> {}", path, status.map(|s| s.as_ref().to_string()).unwrap_or_default());
        Ok(())
    }

    /// Removes a gallery from the queue.
    pub fn remove(&self, path: &str) -> Result<()> {
        let present = self.queue.get_item(path).is_some();
        if !present {
            return Err(Error::unknown_gallery(path));
        }
        if !self.queue.remove_item(path) {
            return Err(Error::refused("cannot remove a gallery while it uploads"));
        }
        println!("Removed {}.", path);
        Ok(())
    }

    /// Additive rescan: picks up new images without losing progress.
    pub fn rescan(&self, path: &str) -> Result<()> {
        if !self.queue.rescan_gallery_additive(path) {
            return Err(Error::unknown_gallery(path));
        }
        self.wait_for_scan(path)
    }

    /// Full reset: wipes host identity and upload progress, then rescans.
    pub fn reset(&self, path: &str) -> Result<()> {
        if !self.queue.reset_gallery_complete(path) {
            return Err(Error::unknown_gallery(path));
        }
        self.wait_for_scan(path)
    }

    fn wait_for_scan(&self, path: &str) -> Result<()> {
        let deadline = Instant::now() + SCAN_WAIT;
        loop {
            let item = self
                .queue
                .get_item(path)
                .ok_or_else(|| Error::unknown_gallery(path))?;
            match item.status {
                GalleryStatus::Validating | GalleryStatus::Scanning => {
                    if Instant::now() > deadline {
                        return Err(Error::refused("scan did not finish in time"));
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                status => {
                    println!(
                        "{}: {} image(s), {}",
                        path,
                        item.total_images,
                        status.as_ref()
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Runs the canonical auto-archive pass once.
    pub fn archive_pass(&self) {
        let minutes = self.config.auto_archive.archive_after_minutes;
        let moved = self.queue.execute_auto_archive(minutes);
        println!("Archived {} gallery(ies).", moved);
    }

    /// Lists galleries whose rename is still pending.
    pub fn print_unnamed(&self) -> Result<()> {
        output::print_unnamed(&self.db.get_unnamed_galleries()?);
        Ok(())
    }

    /// Shows per-host upload state: for one gallery, or for every gallery
    /// with per-host records when no path is given.
    pub fn print_hosts(&self, path: Option<&str>) -> Result<()> {
        match path {
            Some(path) => {
                let item = self
                    .queue
                    .get_item(path)
                    .ok_or_else(|| Error::unknown_gallery(path))?;
                let db_id = item
                    .db_id
                    .ok_or_else(|| Error::refused("gallery was never persisted"))?;
                output::print_file_host_uploads(&self.db.get_file_host_uploads(db_id)?);
            }
            None => {
                let grouped = self.db.get_all_file_host_uploads_batch()?;
                let mut flattened: Vec<_> =
                    grouped.into_iter().flat_map(|(_, records)| records).collect();
                flattened.sort_by(|a, b| {
                    (a.gallery_db_id, a.host_name.clone())
                        .cmp(&(b.gallery_db_id, b.host_name.clone()))
                });
                output::print_file_host_uploads(&flattened);
            }
        }
        Ok(())
    }

    /// Commands an upload of a gallery to a configured file host.
    pub fn push_to_host(&self, path: &str, host: &str) -> Result<()> {
        if !self
            .config
            .file_hosts
            .iter()
            .any(|h| h.name == host && h.enabled)
        {
            return Err(Error::refused(format!("no enabled file host named {:?}", host)));
        }
        let item = self
            .queue
            .get_item(path)
            .ok_or_else(|| Error::unknown_gallery(path))?;
        let db_id = item
            .db_id
            .ok_or_else(|| Error::refused("gallery was never persisted"))?;

        let mut record = FileHostUpload::new(db_id, host);
        record.status = FileHostStatus::Pending;
        record.total_bytes = item.total_size;
        self.db.upsert_file_host_upload(&record)?;
        println!(
            "Queued {} for {}; a running server performs the upload.",
            path, host
        );
        Ok(())
    }

    /// Checks the online status of every completed gallery's images (or
    /// just the given paths), using the authenticated web session.
    pub fn check_status(&self, paths: &[String]) -> Result<()> {
        let items = self.queue.get_all_items();
        let selected: Vec<_> = items
            .into_iter()
            .filter(|item| item.status == GalleryStatus::Completed)
            .filter(|item| paths.is_empty() || paths.contains(&item.path))
            .collect();
        if selected.is_empty() {
            println!("No completed galleries to check.");
            return Ok(());
        }

        let mut galleries = vec![];
        for item in &selected {
            match self.load_manifest_urls(&item.name, item.gallery_id.as_deref()) {
                Ok(image_urls) if !image_urls.is_empty() => {
                    galleries.push(StatusCheckGallery {
                        db_id: item.db_id.unwrap_or(0),
                        path: item.path.clone(),
                        name: item.name.clone(),
                        image_urls,
                    });
                }
                Ok(_) => eprintln!("no image URLs recorded for {}", item.path),
                Err(e) => eprintln!("skipping {}: {}", item.path, e),
            }
        }
        if galleries.is_empty() {
            return Err(Error::refused("no galleries with recorded image URLs"));
        }

        let events = EventBus::new();
        let rx = events.subscribe();
        let (handle, mut services) =
            RenameWorker::spawn(self.db.clone(), &self.config, events)
                .map_err(|e| Error::refused(e.to_string()))?;
        handle.check_image_status(galleries);

        let deadline = Instant::now()
            + Duration::from_secs(c::STATUS_CHECK_TIMEOUT_SECS + c::LOGIN_WAIT_TIMEOUT_SECS);
        let outcome = loop {
            if Instant::now() > deadline {
                break Err(Error::refused("status check timed out"));
            }
            match rx.recv_timeout(Duration::from_millis(500)) {
                Ok(Event::StatusCheckCompleted { results }) => break Ok(results),
                Ok(Event::StatusCheckError { error }) => break Err(Error::refused(error)),
                Ok(Event::StatusCheckProgress { done, total }) => {
                    debug!("status check progress: {}/{}", done, total)
                }
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    break Err(Error::refused("status-check worker went away"))
                }
            }
        };

        for service in &services {
            service.stop();
        }
        for service in services.iter_mut() {
            service.join();
        }

        let results = outcome?;
        for (path, result) in &results {
            self.queue.update_imx_status(path, result.online, result.total);
        }
        let mut rows: Vec<_> = results.iter().collect();
        rows.sort_by(|a, b| a.0.cmp(b.0));
        output::print_status_check(&rows);
        Ok(())
    }

    // Reads image URLs back out of the gallery's completion manifest.
    fn load_manifest_urls(&self, name: &str, gallery_id: Option<&str>) -> Result<Vec<String>> {
        let stem = artifacts::artifact_stem(name, gallery_id.unwrap_or(""));
        let central = ix::galleries_dir()
            .map_err(|e| Error::refused(e.to_string()))?
            .join(format!("{}.json", stem));
        if !central.exists() {
            return Err(Error::no_manifest(central.to_string_lossy().to_string()));
        }
        let manifest: Manifest = serde_json::from_str(&fs::read_to_string(&central)?)?;
        Ok(manifest
            .images
            .into_iter()
            .map(|image| image.image_url)
            .filter(|url| !url.is_empty())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Credential management (secret store only; never the ini file)
// ---------------------------------------------------------------------------

/// Stores the primary-host API key.
pub fn store_api_key(key: &str) -> Result<()> {
    config::set_secret(c::KEYRING_API_KEY_ENTRY, key)?;
    println!("API key saved to the secret store.");
    Ok(())
}

/// Stores the web-session password (the username lives in the ini).
pub fn store_web_password(password: &str) -> Result<()> {
    config::set_secret(c::KEYRING_WEB_PASSWORD_ENTRY, password)?;
    println!("Web password saved to the secret store.");
    Ok(())
}

/// Stores a file-host password.
pub fn store_filehost_password(host: &str, password: &str) -> Result<()> {
    config::set_secret(&format!("filehost:{}", host), password)?;
    println!("Password for {} saved to the secret store.", host);
    Ok(())
}

/// Prints the resolved configuration.
pub fn print_config(config: &Config) {
    print!("{}", config);
}

/// Prints a commented example configuration.
pub fn print_config_example() {
    print!("{}", Config::default());
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn example_config_parses_back() {
        let example = Config::default().to_string();
        assert!(example.parse::<Config>().is_ok());
    }
}
