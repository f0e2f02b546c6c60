//! The queue manager: authoritative in-memory state of every gallery,
//! backed by the durable store.
//!
//! All mutations go through this type. Status transitions publish
//! `status_changed` events in per-path order, every mutation bumps the
//! version counter, and persistence happens through the single store-writer
//! thread (or synchronously for first inserts, which assign `db_id`).

mod error;
pub mod scanner;

pub use self::error::{Error, ErrorKind, Result};
pub use self::scanner::{ScanOutcome, Scanner};

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use log::*;

use crate::ix::agent::config::constants as c;
use crate::ix::agent::database::{Database, Field, GalleryRecord, GalleryStatus, StoreWriter};
use crate::ix::agent::messages::{Event, EventBus, StatusAggregate};
use crate::ix::util::temporal;

/// A request for the scan worker.
#[derive(Clone, Debug)]
pub struct ScanRequest {
    pub path: String,
    /// Additive rescans keep `uploaded_files`; fresh scans start over.
    pub additive: bool,
}

/// Result of a batched add.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AddReport {
    pub added: Vec<String>,
    pub duplicates: Vec<String>,
    pub failed: Vec<(String, String)>,
}

struct Inner {
    items: HashMap<String, GalleryRecord>,
    run_queue: VecDeque<String>,
    /// Membership set for the run queue; a path appears at most once.
    queued: HashSet<String>,
    pending_upload: Option<String>,
    next_insertion_order: i64,
    batch_depth: u32,
    batch_dirty: HashSet<String>,
}

pub struct QueueManager {
    db: Database,
    writer: StoreWriter,
    events: EventBus,
    scan_tx: Sender<ScanRequest>,
    inner: Mutex<Inner>,
    version: AtomicU64,
}

/// Scope guard returned by `batch_updates`. All saves that happen while at
/// least one guard is live collapse into a single trailing write when the
/// outermost guard drops, and only if something actually changed.
pub struct BatchGuard<'a> {
    queue: &'a QueueManager,
}

impl<'a> Drop for BatchGuard<'a> {
    fn drop(&mut self) {
        let mut inner = self.queue.lock();
        inner.batch_depth -= 1;
        if inner.batch_depth == 0 && !inner.batch_dirty.is_empty() {
            let dirty: Vec<String> = inner.batch_dirty.drain().collect();
            let records: Vec<GalleryRecord> = dirty
                .iter()
                .filter_map(|path| inner.items.get(path).cloned())
                .collect();
            self.queue.writer.save_async(records);
        }
    }
}

impl QueueManager {
    /// Restores state from the store and returns the manager plus the scan
    /// queue receiver for the scan worker.
    pub fn new(
        db: Database,
        writer: StoreWriter,
        events: EventBus,
    ) -> Result<(Arc<QueueManager>, Receiver<ScanRequest>)> {
        db.initialize_default_tabs()?;
        let restored = db.load_all_items()?;
        let next_insertion_order = restored
            .iter()
            .map(|r| r.insertion_order)
            .max()
            .unwrap_or(0)
            + 1;
        // Items persisted as `queued` re-enter the run queue in insertion
        // order; they were waiting when the process last exited.
        let mut run_queue = VecDeque::new();
        let mut queued = HashSet::new();
        for record in restored.iter().filter(|r| r.status == GalleryStatus::Queued) {
            run_queue.push_back(record.path.clone());
            queued.insert(record.path.clone());
        }
        let items: HashMap<String, GalleryRecord> = restored
            .into_iter()
            .map(|r| (r.path.clone(), r))
            .collect();
        info!(
            "queue-manager: restored {} gallery record(s), {} queued",
            items.len(),
            run_queue.len()
        );

        let (scan_tx, scan_rx) = mpsc::channel();
        let manager = Arc::new(QueueManager {
            db,
            writer,
            events,
            scan_tx,
            inner: Mutex::new(Inner {
                items,
                run_queue,
                queued,
                pending_upload: None,
                next_insertion_order,
                batch_depth: 0,
                batch_dirty: HashSet::new(),
            }),
            version: AtomicU64::new(0),
        });
        Ok((manager, scan_rx))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("queue manager lock poisoned")
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Monotonic counter bumped on every mutation; consumers use it to
    /// debounce refreshes.
    pub fn get_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    // Queues a save for the given path. Inside a batch scope this only
    // marks the path dirty; the outermost scope exit writes once.
    fn save(&self, inner: &mut Inner, path: &str) {
        if inner.batch_depth > 0 {
            inner.batch_dirty.insert(path.to_string());
        } else if let Some(record) = inner.items.get(path) {
            self.writer.save_async(vec![record.clone()]);
        }
    }

    /// Opens a batch-update scope. Nesting is allowed; only the outermost
    /// exit flushes.
    pub fn batch_updates(&self) -> BatchGuard<'_> {
        self.lock().batch_depth += 1;
        BatchGuard { queue: self }
    }

    /// Creates a gallery in `validating` and enqueues a scan. Returns false
    /// when the path is already present.
    pub fn add_item(
        &self,
        path: &str,
        name: Option<&str>,
        template: Option<&str>,
        tab: Option<&str>,
    ) -> Result<bool> {
        if !Path::new(path).is_dir() {
            return Err(Error::not_a_directory(path));
        }

        let record = {
            let mut inner = self.lock();
            if inner.items.contains_key(path) {
                return Ok(false);
            }
            let mut record = GalleryRecord::new(path, GalleryRecord::folder_basename(path));
            if let Some(name) = name {
                record.name = name.to_string();
            }
            if let Some(template) = template {
                record.template_name = template.to_string();
            }
            if let Some(tab) = tab {
                record.tab_name = tab.to_string();
            }
            record.insertion_order = inner.next_insertion_order;
            inner.next_insertion_order += 1;

            // First persistence happens synchronously so the db_id exists
            // before any per-host records reference it.
            self.db.insert_item(&mut record)?;
            inner.items.insert(path.to_string(), record.clone());
            self.events.publish(Event::gallery_added(path));
            record
        };
        self.bump();

        let _ = self.scan_tx.send(ScanRequest {
            path: record.path,
            additive: false,
        });
        Ok(true)
    }

    /// Batched add. Per-item errors are collected, never raised.
    pub fn add_multiple_items(&self, paths: &[String], template: Option<&str>) -> AddReport {
        let mut report = AddReport::default();
        let _batch = self.batch_updates();
        for path in paths {
            match self.add_item(path, None, template, None) {
                Ok(true) => report.added.push(path.clone()),
                Ok(false) => report.duplicates.push(path.clone()),
                Err(e) => report.failed.push((path.clone(), e.to_string())),
            }
        }
        report
    }

    /// Deletes an item from memory and the store. Refused while the item is
    /// uploading.
    pub fn remove_item(&self, path: &str) -> bool {
        let removed = {
            let mut inner = self.lock();
            match inner.items.get(path) {
                None => return false,
                Some(item) if item.status == GalleryStatus::Uploading => return false,
                Some(_) => {}
            }
            inner.items.remove(path);
            inner.queued.remove(path);
            inner.run_queue.retain(|p| p != path);
            self.writer.delete_async(vec![path.to_string()]);
            self.events.publish(Event::gallery_removed(path));
            true
        };
        self.bump();
        removed
    }

    /// Atomic status transition with event emission. `completed` pins
    /// progress at 100; terminal states record the finish time. No-op when
    /// the path is unknown.
    pub fn update_item_status(&self, path: &str, new: GalleryStatus) -> bool {
        {
            let mut inner = self.lock();
            let item = match inner.items.get_mut(path) {
                Some(item) => item,
                None => return false,
            };
            let old = item.status;
            item.status = new;
            if new == GalleryStatus::Completed {
                item.progress = 100;
            }
            if new.is_terminal() {
                item.finished_time = temporal::epoch_secs();
            }
            self.events.publish(Event::status_changed(path, old, new));
            self.save(&mut inner, path);
        }
        self.bump();
        true
    }

    /// Transitions a startable item into `queued` and appends it to the run
    /// queue. A path is never queued twice.
    pub fn start_item(&self, path: &str) -> bool {
        {
            let mut inner = self.lock();
            let startable = match inner.items.get(path) {
                Some(item) => item.status.is_startable() && !inner.queued.contains(path),
                None => false,
            };
            if !startable {
                return false;
            }
            let item = inner.items.get_mut(path).expect("checked above");
            let old = item.status;
            item.status = GalleryStatus::Queued;
            item.error_message = None;
            self.events
                .publish(Event::status_changed(path, old, GalleryStatus::Queued));
            inner.queued.insert(path.to_string());
            inner.run_queue.push_back(path.to_string());
            self.save(&mut inner, path);
        }
        self.bump();
        true
    }

    /// Pops the next queued gallery FIFO, marking it as the pending upload
    /// target. Returns `None` when the run queue is empty.
    pub fn get_next_item(&self) -> Option<GalleryRecord> {
        let mut inner = self.lock();
        let path = inner.run_queue.pop_front()?;
        inner.queued.remove(&path);
        inner.pending_upload = Some(path.clone());
        inner.items.get(&path).cloned()
    }

    /// Full retry when nothing uploaded yet (or the gallery was never
    /// created on the host); resume otherwise.
    pub fn retry_failed_upload(&self, path: &str) -> bool {
        {
            let mut inner = self.lock();
            let item = match inner.items.get_mut(path) {
                Some(item) => item,
                None => return false,
            };
            let old = item.status;
            let new = if item.uploaded_images == 0 || item.gallery_id.is_none() {
                GalleryStatus::Ready
            } else {
                GalleryStatus::Incomplete
            };
            item.status = new;
            item.error_message = None;
            item.failed_files.clear();
            self.events.publish(Event::status_changed(path, old, new));
            self.save(&mut inner, path);
        }
        self.bump();
        true
    }

    /// Enqueues an additive rescan: counts are refreshed without losing
    /// `uploaded_files`.
    pub fn rescan_gallery_additive(&self, path: &str) -> bool {
        if !self.lock().items.contains_key(path) {
            return false;
        }
        let _ = self.scan_tx.send(ScanRequest {
            path: path.to_string(),
            additive: true,
        });
        true
    }

    /// Wipes host state and upload progress, then enqueues a fresh scan.
    pub fn reset_gallery_complete(&self, path: &str) -> bool {
        {
            let mut inner = self.lock();
            let item = match inner.items.get_mut(path) {
                Some(item) => item,
                None => return false,
            };
            let old = item.status;
            item.gallery_id = None;
            item.gallery_url = None;
            item.uploaded_images = 0;
            item.uploaded_bytes = 0;
            item.uploaded_files.clear();
            item.failed_files.clear();
            item.progress = 0;
            item.scan_complete = false;
            item.status = GalleryStatus::Scanning;
            self.events
                .publish(Event::status_changed(path, old, GalleryStatus::Scanning));
            self.save(&mut inner, path);
        }
        self.bump();
        let _ = self.scan_tx.send(ScanRequest {
            path: path.to_string(),
            additive: false,
        });
        true
    }

    /// Records an upload failure with its message and the per-image failure
    /// list when known.
    pub fn mark_upload_failed(&self, path: &str, message: &str, failed_files: Option<Vec<String>>) {
        {
            let mut inner = self.lock();
            let item = match inner.items.get_mut(path) {
                Some(item) => item,
                None => return,
            };
            let old = item.status;
            item.status = GalleryStatus::UploadFailed;
            item.error_message = Some(message.to_string());
            item.finished_time = temporal::epoch_secs();
            if let Some(failed) = failed_files {
                item.failed_files = failed;
            }
            self.events
                .publish(Event::status_changed(path, old, GalleryStatus::UploadFailed));
            self.events.publish(Event::gallery_failed(path, message));
            self.save(&mut inner, path);
        }
        self.bump();
    }

    /// Records a scan failure with its diagnostic message.
    pub fn mark_scan_failed(&self, path: &str, message: &str) {
        {
            let mut inner = self.lock();
            let item = match inner.items.get_mut(path) {
                Some(item) => item,
                None => return,
            };
            let old = item.status;
            item.status = GalleryStatus::ScanFailed;
            item.error_message = Some(message.to_string());
            item.finished_time = temporal::epoch_secs();
            self.events
                .publish(Event::status_changed(path, old, GalleryStatus::ScanFailed));
            self.save(&mut inner, path);
        }
        self.bump();
    }

    /// Writes one custom/ext field, persisting immediately. Returns false
    /// on an unknown field name or path.
    pub fn update_custom_field(&self, path: &str, field_name: &str, value: &str) -> bool {
        let field: Field = match field_name.parse() {
            Ok(field) => field,
            Err(_) => return false,
        };
        {
            let mut inner = self.lock();
            let item = match inner.items.get_mut(path) {
                Some(item) => item,
                None => return false,
            };
            if item.field(field) == value {
                // Identical update: nothing changed, nothing to write.
                return true;
            }
            item.set_field(field, value.to_string());
        }
        if let Err(e) = self.db.update_item_custom_field(path, field, value) {
            warn!("queue-manager: custom field write failed: {}", e);
        }
        self.bump();
        true
    }

    /// Merges hook-produced ext fields into an item and persists them.
    pub fn apply_ext_fields(&self, path: &str, fields: &HashMap<String, String>) {
        if fields.is_empty() {
            return;
        }
        let mut applied = HashMap::new();
        for (name, value) in fields {
            if self.update_custom_field(path, name, value) {
                applied.insert(name.clone(), value.clone());
            }
        }
        if !applied.is_empty() {
            self.events.publish(Event::ExtFieldsUpdated {
                path: path.to_string(),
                fields: applied,
            });
        }
    }

    /// Snapshot of all items sorted by insertion order, then db id.
    pub fn get_all_items(&self) -> Vec<GalleryRecord> {
        let inner = self.lock();
        let mut items: Vec<GalleryRecord> = inner.items.values().cloned().collect();
        items.sort_by(|a, b| {
            a.insertion_order
                .cmp(&b.insertion_order)
                .then(a.db_id.cmp(&b.db_id))
        });
        items
    }

    /// Snapshot of a single item.
    pub fn get_item(&self, path: &str) -> Option<GalleryRecord> {
        self.lock().items.get(path).cloned()
    }

    /// Per-status aggregate of `{count, images, bytes}`.
    pub fn get_queue_stats(&self) -> HashMap<String, StatusAggregate> {
        let inner = self.lock();
        let mut stats: HashMap<String, StatusAggregate> = HashMap::new();
        for item in inner.items.values() {
            let entry = stats.entry(item.status.as_ref().to_string()).or_default();
            entry.count += 1;
            entry.images += item.total_images;
            entry.bytes += item.total_size;
        }
        stats
    }

    /// The canonical auto-archive pass: completed galleries older than the
    /// given age move to the `Archive` tab. Returns how many moved.
    pub fn execute_auto_archive(&self, older_than_minutes: u64) -> usize {
        let cutoff = temporal::epoch_secs() - (older_than_minutes as i64) * 60;
        let moved: Vec<String> = {
            let mut inner = self.lock();
            let moved: Vec<String> = inner
                .items
                .values()
                .filter(|item| {
                    item.status == GalleryStatus::Completed
                        && item.finished_time > 0
                        && item.finished_time <= cutoff
                        && item.tab_name != c::ARCHIVE_TAB
                })
                .map(|item| item.path.clone())
                .collect();
            for path in &moved {
                if let Some(item) = inner.items.get_mut(path) {
                    item.tab_name = c::ARCHIVE_TAB.to_string();
                }
            }
            for path in &moved {
                self.save(&mut inner, path);
            }
            moved
        };
        if !moved.is_empty() {
            info!("auto-archive: moved {} gallery(ies)", moved.len());
            self.bump();
        }
        moved.len()
    }

    // ------------------------------------------------------------------
    // Engine-facing mutations. `uploaded_files` is only ever touched here,
    // under the queue lock.
    // ------------------------------------------------------------------

    /// Stamps the start of an upload run.
    pub fn record_upload_started(&self, path: &str) {
        {
            let mut inner = self.lock();
            if let Some(item) = inner.items.get_mut(path) {
                item.start_time = temporal::epoch_secs();
                item.error_message = None;
            }
            self.save(&mut inner, path);
        }
        self.bump();
    }

    /// Records the host-assigned gallery identity.
    pub fn set_item_gallery(&self, path: &str, gallery_id: &str, gallery_url: &str) {
        {
            let mut inner = self.lock();
            if let Some(item) = inner.items.get_mut(path) {
                item.gallery_id = Some(gallery_id.to_string());
                item.gallery_url = Some(gallery_url.to_string());
            }
            self.save(&mut inner, path);
        }
        self.bump();
    }

    /// Atomically records one uploaded image, returning `(completed,
    /// total)` after the update. Emits `progress_updated`.
    pub fn record_image_uploaded(&self, path: &str, basename: &str, bytes: u64) -> (i64, i64) {
        let result = {
            let mut inner = self.lock();
            let item = match inner.items.get_mut(path) {
                Some(item) => item,
                None => return (0, 0),
            };
            if item.uploaded_files.insert(basename.to_string()) {
                item.uploaded_images = item.uploaded_files.len() as i64;
                item.uploaded_bytes += bytes as i64;
            }
            if item.total_images > 0 {
                item.progress =
                    ((item.uploaded_images as f64 / item.total_images as f64) * 100.0) as i32;
            }
            let result = (item.uploaded_images, item.total_images);
            self.events.publish(Event::progress_updated(
                path,
                result.0,
                result.1,
                basename,
            ));
            self.save(&mut inner, path);
            result
        };
        self.bump();
        result
    }

    /// Records observed transfer rates for display.
    pub fn set_item_rates(&self, path: &str, current_kibps: f64, final_kibps: Option<f64>) {
        {
            let mut inner = self.lock();
            if let Some(item) = inner.items.get_mut(path) {
                item.current_kibps = current_kibps;
                if let Some(final_kibps) = final_kibps {
                    item.final_kibps = final_kibps;
                }
            }
            self.save(&mut inner, path);
        }
        self.bump();
    }

    /// Applies a status-check result: "online/total" plus the check time.
    pub fn update_imx_status(&self, path: &str, online: usize, total: usize) {
        {
            let mut inner = self.lock();
            if let Some(item) = inner.items.get_mut(path) {
                item.imx_status = Some(format!("{}/{}", online, total));
                item.imx_status_checked = temporal::epoch_secs();
            }
            self.save(&mut inner, path);
        }
        self.bump();
    }

    /// Applies a finished scan. `uploaded_files` survives as the
    /// intersection with the files currently on disk.
    pub(crate) fn apply_scan_result(&self, path: &str, outcome: &ScanOutcome) {
        {
            let mut inner = self.lock();
            let item = match inner.items.get_mut(path) {
                Some(item) => item,
                None => return,
            };
            let current: HashSet<&String> = outcome.files.iter().collect();
            item.uploaded_files = item
                .uploaded_files
                .iter()
                .filter(|f| current.contains(f))
                .cloned()
                .collect();
            item.uploaded_images = item.uploaded_files.len() as i64;
            item.total_images = outcome.total_images;
            item.total_size = outcome.total_size;
            item.avg_width = outcome.avg_width;
            item.avg_height = outcome.avg_height;
            item.scan_complete = true;
            if item.total_images > 0 {
                item.progress =
                    ((item.uploaded_images as f64 / item.total_images as f64) * 100.0) as i32;
            }

            let old = item.status;
            let new = if item.uploaded_images > 0 && item.uploaded_images < item.total_images {
                GalleryStatus::Incomplete
            } else if item.total_images > 0 && item.uploaded_images == item.total_images {
                // Every image on disk is already uploaded: an additive
                // rescan that found nothing new leaves the gallery finished.
                GalleryStatus::Completed
            } else {
                GalleryStatus::Ready
            };
            item.status = new;
            self.events.publish(Event::status_changed(path, old, new));
            self.save(&mut inner, path);
        }
        self.bump();
    }

    /// Marks a path as scanning when a scan begins. Used by the scan
    /// worker, which may coalesce duplicate requests.
    pub(crate) fn mark_scanning(&self, path: &str) -> bool {
        self.update_item_status(path, GalleryStatus::Scanning)
    }

    /// Access to the backing store for collaborating workers.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Forces any queued async writes to be attempted now.
    pub fn flush_writes(&self) {
        self.writer.flush();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ix::util;
    use std::fs::File;
    use std::io::Write as _;

    fn folder_with_images(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            let mut f = File::create(dir.path().join(name)).unwrap();
            f.write_all(b"not really an image").unwrap();
        }
        dir
    }

    fn manager() -> (Arc<QueueManager>, Receiver<ScanRequest>) {
        let db = util::database::temp().unwrap();
        let (writer, _handle) = StoreWriter::spawn(db.clone());
        QueueManager::new(db, writer, EventBus::new()).unwrap()
    }

    fn outcome(files: &[&str]) -> ScanOutcome {
        ScanOutcome {
            total_images: files.len() as i64,
            total_size: 1024 * files.len() as i64,
            avg_width: 800,
            avg_height: 600,
            files: files.iter().map(|f| f.to_string()).collect(),
        }
    }

    #[test]
    fn add_item_is_idempotent_per_path() {
        let (queue, scan_rx) = manager();
        let dir = folder_with_images(&["a.jpg"]);
        let path = dir.path().to_str().unwrap();

        assert!(queue.add_item(path, Some("Alpha"), None, None).unwrap());
        assert!(!queue.add_item(path, None, None, None).unwrap());

        let item = queue.get_item(path).unwrap();
        assert_eq!(item.name, "Alpha");
        assert_eq!(item.status, GalleryStatus::Validating);
        assert!(item.db_id.is_some());
        assert_eq!(scan_rx.try_recv().unwrap().path, path);
    }

    #[test]
    fn add_item_rejects_missing_folder() {
        let (queue, _scan_rx) = manager();
        assert!(queue.add_item("/definitely/not/here", None, None, None).is_err());
    }

    #[test]
    fn add_multiple_partitions_results() {
        let (queue, _scan_rx) = manager();
        let dir_a = folder_with_images(&["a.jpg"]);
        let dir_b = folder_with_images(&["b.jpg"]);
        let path_a = dir_a.path().to_str().unwrap().to_string();
        let path_b = dir_b.path().to_str().unwrap().to_string();
        queue.add_item(&path_a, None, None, None).unwrap();

        let report = queue.add_multiple_items(
            &[path_a.clone(), path_b.clone(), "/missing".to_string()],
            Some("tpl"),
        );
        assert_eq!(report.duplicates, vec![path_a]);
        assert_eq!(report.added, vec![path_b]);
        assert_eq!(report.failed.len(), 1);
    }

    #[test]
    fn version_strictly_increases_on_mutation() {
        let (queue, _scan_rx) = manager();
        let dir = folder_with_images(&["a.jpg"]);
        let path = dir.path().to_str().unwrap();
        let v0 = queue.get_version();
        queue.add_item(path, None, None, None).unwrap();
        let v1 = queue.get_version();
        assert!(v1 > v0);
        queue.update_item_status(path, GalleryStatus::Ready);
        assert!(queue.get_version() > v1);
    }

    #[test]
    fn start_item_requires_startable_status() {
        let (queue, _scan_rx) = manager();
        let dir = folder_with_images(&["a.jpg"]);
        let path = dir.path().to_str().unwrap();
        queue.add_item(path, None, None, None).unwrap();

        // Still validating: not startable.
        assert!(!queue.start_item(path));

        queue.apply_scan_result(path, &outcome(&["a.jpg"]));
        assert!(queue.start_item(path));
        assert_eq!(queue.get_item(path).unwrap().status, GalleryStatus::Queued);

        // Already queued: a path appears in the run queue at most once.
        assert!(!queue.start_item(path));
    }

    #[test]
    fn run_queue_is_fifo() {
        let (queue, _scan_rx) = manager();
        let dir_a = folder_with_images(&["a.jpg"]);
        let dir_b = folder_with_images(&["b.jpg"]);
        let path_a = dir_a.path().to_str().unwrap();
        let path_b = dir_b.path().to_str().unwrap();
        for path in [path_a, path_b].iter() {
            queue.add_item(path, None, None, None).unwrap();
            queue.apply_scan_result(path, &outcome(&["x.jpg"]));
            queue.start_item(path);
        }

        assert_eq!(queue.get_next_item().unwrap().path, *path_a);
        assert_eq!(queue.get_next_item().unwrap().path, *path_b);
        assert!(queue.get_next_item().is_none());
    }

    #[test]
    fn remove_is_refused_while_uploading() {
        let (queue, _scan_rx) = manager();
        let dir = folder_with_images(&["a.jpg"]);
        let path = dir.path().to_str().unwrap();
        queue.add_item(path, None, None, None).unwrap();
        queue.update_item_status(path, GalleryStatus::Uploading);

        assert!(!queue.remove_item(path));
        assert_eq!(
            queue.get_item(path).unwrap().status,
            GalleryStatus::Uploading
        );

        queue.update_item_status(path, GalleryStatus::Completed);
        assert!(queue.remove_item(path));
        assert!(queue.get_item(path).is_none());
    }

    #[test]
    fn completed_pins_progress_and_finish_time() {
        let (queue, _scan_rx) = manager();
        let dir = folder_with_images(&["a.jpg"]);
        let path = dir.path().to_str().unwrap();
        queue.add_item(path, None, None, None).unwrap();

        queue.update_item_status(path, GalleryStatus::Completed);
        let item = queue.get_item(path).unwrap();
        assert_eq!(item.progress, 100);
        assert!(item.finished_time > 0);
    }

    #[test]
    fn retry_resets_or_resumes() {
        let (queue, _scan_rx) = manager();
        let dir = folder_with_images(&["a.jpg"]);
        let path = dir.path().to_str().unwrap();
        queue.add_item(path, None, None, None).unwrap();
        queue.mark_upload_failed(path, "boom", None);

        // Nothing uploaded yet: full retry.
        assert!(queue.retry_failed_upload(path));
        assert_eq!(queue.get_item(path).unwrap().status, GalleryStatus::Ready);

        // Partial progress with a created gallery: resume.
        queue.set_item_gallery(path, "g1", "https://imx.to/g/g1");
        queue.apply_scan_result(path, &outcome(&["a.jpg", "b.jpg"]));
        queue.record_image_uploaded(path, "a.jpg", 100);
        queue.mark_upload_failed(path, "boom again", Some(vec!["b.jpg".into()]));
        assert!(queue.retry_failed_upload(path));
        assert_eq!(
            queue.get_item(path).unwrap().status,
            GalleryStatus::Incomplete
        );
    }

    #[test]
    fn scan_result_preserves_uploaded_files_intersection() {
        let (queue, _scan_rx) = manager();
        let dir = folder_with_images(&["a.jpg"]);
        let path = dir.path().to_str().unwrap();
        queue.add_item(path, None, None, None).unwrap();
        queue.apply_scan_result(path, &outcome(&["a.jpg", "b.jpg", "gone.jpg"]));
        queue.record_image_uploaded(path, "a.jpg", 10);
        queue.record_image_uploaded(path, "gone.jpg", 10);

        // Rescan finds that gone.jpg disappeared and c.jpg arrived.
        queue.apply_scan_result(path, &outcome(&["a.jpg", "b.jpg", "c.jpg"]));
        let item = queue.get_item(path).unwrap();
        assert_eq!(item.uploaded_images, 1);
        assert!(item.uploaded_files.contains("a.jpg"));
        assert_eq!(item.status, GalleryStatus::Incomplete);
    }

    #[test]
    fn record_image_uploaded_is_idempotent_per_file() {
        let (queue, _scan_rx) = manager();
        let dir = folder_with_images(&["a.jpg"]);
        let path = dir.path().to_str().unwrap();
        queue.add_item(path, None, None, None).unwrap();
        queue.apply_scan_result(path, &outcome(&["a.jpg", "b.jpg"]));

        assert_eq!(queue.record_image_uploaded(path, "a.jpg", 10), (1, 2));
        assert_eq!(queue.record_image_uploaded(path, "a.jpg", 10), (1, 2));
        assert_eq!(queue.get_item(path).unwrap().uploaded_bytes, 10);
    }

    #[test]
    fn unknown_custom_field_is_rejected() {
        let (queue, _scan_rx) = manager();
        let dir = folder_with_images(&["a.jpg"]);
        let path = dir.path().to_str().unwrap();
        queue.add_item(path, None, None, None).unwrap();

        assert!(!queue.update_custom_field(path, "custom9", "x"));
        assert!(queue.update_custom_field(path, "custom1", "x"));
        assert_eq!(queue.get_item(path).unwrap().custom1, "x");
    }

    #[test]
    fn identical_custom_field_updates_write_once() {
        let (queue, _scan_rx) = manager();
        let dir = folder_with_images(&["a.jpg"]);
        let path = dir.path().to_str().unwrap();
        queue.add_item(path, None, None, None).unwrap();

        assert!(queue.update_custom_field(path, "ext1", "v"));
        let version = queue.get_version();
        // The identical update changes nothing and produces no write.
        assert!(queue.update_custom_field(path, "ext1", "v"));
        assert_eq!(queue.get_version(), version);
        let persisted = queue.database().get_item_by_path(path).unwrap().unwrap();
        assert_eq!(persisted.ext1, "v");
    }

    #[test]
    fn restart_requeues_persisted_queued_items() {
        let db = util::database::temp().unwrap();
        let dir = folder_with_images(&["a.jpg"]);
        let path = dir.path().to_str().unwrap();
        {
            let (writer, _handle) = StoreWriter::spawn(db.clone());
            let (queue, _scan_rx) =
                QueueManager::new(db.clone(), writer, EventBus::new()).unwrap();
            queue.add_item(path, None, None, None).unwrap();
            queue.apply_scan_result(path, &outcome(&["a.jpg"]));
            assert!(queue.start_item(path));
            queue.flush_writes();
        }

        // A fresh process restores the waiting item into the run queue.
        let (writer, _handle) = StoreWriter::spawn(db.clone());
        let (queue, _scan_rx) = QueueManager::new(db, writer, EventBus::new()).unwrap();
        let next = queue.get_next_item().unwrap();
        assert_eq!(next.path, path);
        assert_eq!(next.status, GalleryStatus::Queued);
        assert!(queue.get_next_item().is_none());
    }

    #[test]
    fn queue_stats_aggregate_by_status() {
        let (queue, _scan_rx) = manager();
        let dir_a = folder_with_images(&["a.jpg"]);
        let dir_b = folder_with_images(&["b.jpg"]);
        let path_a = dir_a.path().to_str().unwrap();
        let path_b = dir_b.path().to_str().unwrap();
        queue.add_item(path_a, None, None, None).unwrap();
        queue.add_item(path_b, None, None, None).unwrap();
        queue.apply_scan_result(path_a, &outcome(&["a.jpg"]));
        queue.apply_scan_result(path_b, &outcome(&["b.jpg", "c.jpg"]));

        let stats = queue.get_queue_stats();
        let ready = stats.get("ready").unwrap();
        assert_eq!(ready.count, 2);
        assert_eq!(ready.images, 3);
    }

    #[test]
    fn batch_updates_flush_once_on_outermost_exit() {
        let (queue, _scan_rx) = manager();
        let dir = folder_with_images(&["a.jpg"]);
        let path = dir.path().to_str().unwrap();
        queue.add_item(path, None, None, None).unwrap();

        {
            let _outer = queue.batch_updates();
            {
                let _inner = queue.batch_updates();
                queue.update_item_status(path, GalleryStatus::Ready);
                queue.update_item_status(path, GalleryStatus::Paused);
            }
            // Still inside the outer scope: nothing flushed yet, but state
            // is current in memory.
            assert_eq!(queue.get_item(path).unwrap().status, GalleryStatus::Paused);
        }
        queue.flush_writes();
        let persisted = queue.database().get_item_by_path(path).unwrap().unwrap();
        assert_eq!(persisted.status, GalleryStatus::Paused);
    }

    #[test]
    fn auto_archive_moves_old_completed_items() {
        let (queue, _scan_rx) = manager();
        let dir = folder_with_images(&["a.jpg"]);
        let path = dir.path().to_str().unwrap();
        queue.add_item(path, None, None, None).unwrap();
        queue.update_item_status(path, GalleryStatus::Completed);

        // Too fresh to archive.
        assert_eq!(queue.execute_auto_archive(60), 0);

        // Backdate the finish time, then archive.
        {
            let mut inner = queue.lock();
            inner.items.get_mut(path).unwrap().finished_time -= 2 * 60 * 60;
        }
        assert_eq!(queue.execute_auto_archive(60), 1);
        assert_eq!(queue.get_item(path).unwrap().tab_name, "Archive");
        // Second pass is a no-op.
        assert_eq!(queue.execute_auto_archive(60), 0);
    }

    #[test]
    fn status_events_preserve_per_path_order() {
        let db = util::database::temp().unwrap();
        let (writer, _handle) = StoreWriter::spawn(db.clone());
        let events = EventBus::new();
        let rx = events.subscribe();
        let (queue, _scan_rx) = QueueManager::new(db, writer, events).unwrap();

        let dir = folder_with_images(&["a.jpg"]);
        let path = dir.path().to_str().unwrap();
        queue.add_item(path, None, None, None).unwrap();
        queue.update_item_status(path, GalleryStatus::Scanning);
        queue.update_item_status(path, GalleryStatus::Ready);

        let mut transitions = vec![];
        while let Ok(event) = rx.try_recv() {
            if let Event::StatusChanged { old, new, .. } = event {
                transitions.push((old, new));
            }
        }
        assert_eq!(
            transitions,
            vec![
                ("validating".to_string(), "scanning".to_string()),
                ("scanning".to_string(), "ready".to_string())
            ]
        );
    }
}
