//! The upload engine: a single long-running loop that turns queued
//! galleries into primary-host uploads.
//!
//! One gallery runs at a time; inside it a bounded pool of worker threads
//! uploads images in parallel with exponential-backoff retries. Soft-stop
//! is cooperative: workers observe the flag between images, in-flight
//! requests finish, and the gallery lands in `incomplete`. A crash in one
//! gallery never tears the loop down.

mod error;

pub use self::error::{Error, ErrorKind, Result};

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::*;

use crate::ix::agent::api::{ByteCounters, GalleryHost};
use crate::ix::agent::artifacts::{ArtifactWriter, GalleryResults, ImageResult};
use crate::ix::agent::bandwidth::BandwidthAggregator;
use crate::ix::agent::config::constants as c;
use crate::ix::agent::config::UploadSettings;
use crate::ix::agent::database::{GalleryRecord, GalleryStatus};
use crate::ix::agent::hooks::{HookContext, HookEvent, HookExecutor};
use crate::ix::agent::messages::{Event, EventBus};
use crate::ix::agent::queue::QueueManager;
use crate::ix::agent::rename::RenameHandle;
use crate::ix::agent::types::{ServiceHandle, ServiceId, ShutdownFlag};
use crate::ix::util::path::lower_extension;

/// The bandwidth-aggregator source id for the primary host.
const PRIMARY_SOURCE: &str = "imx";

/// Registered soft-stop requests, keyed by gallery path. Registering a
/// path before the engine reaches it stops the gallery at its first image
/// boundary.
#[derive(Clone, Default)]
pub struct SoftStopRegistry {
    requested: Arc<Mutex<HashSet<String>>>,
}

impl SoftStopRegistry {
    pub fn request(&self, path: &str) {
        self.requested
            .lock()
            .expect("soft-stop lock poisoned")
            .insert(path.to_string());
    }

    pub fn is_requested(&self, path: &str) -> bool {
        self.requested
            .lock()
            .expect("soft-stop lock poisoned")
            .contains(path)
    }

    fn clear(&self, path: &str) -> bool {
        self.requested
            .lock()
            .expect("soft-stop lock poisoned")
            .remove(path)
    }
}

/// Handle used by the UI surface to influence the running engine.
#[derive(Clone)]
pub struct EngineHandle {
    soft_stop: SoftStopRegistry,
}

impl EngineHandle {
    /// Requests a soft-stop: in-flight images finish, no new ones start,
    /// and the gallery transitions to `incomplete`.
    pub fn request_soft_stop(&self, path: &str) {
        self.soft_stop.request(path);
    }
}

pub struct UploadEngine {
    queue: Arc<QueueManager>,
    host: Arc<dyn GalleryHost>,
    aggregator: Arc<BandwidthAggregator>,
    artifacts: Arc<ArtifactWriter>,
    hooks: Arc<HookExecutor>,
    rename: Option<RenameHandle>,
    settings: UploadSettings,
    events: EventBus,
    soft_stop: SoftStopRegistry,
    stats_last_emit: Mutex<Instant>,
}

impl UploadEngine {
    /// Spawns the engine loop.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        queue: Arc<QueueManager>,
        host: Arc<dyn GalleryHost>,
        aggregator: Arc<BandwidthAggregator>,
        artifacts: Arc<ArtifactWriter>,
        hooks: Arc<HookExecutor>,
        rename: Option<RenameHandle>,
        settings: UploadSettings,
        events: EventBus,
    ) -> (EngineHandle, ServiceHandle) {
        let soft_stop = SoftStopRegistry::default();
        let engine = UploadEngine {
            queue,
            host,
            aggregator,
            artifacts,
            hooks,
            rename,
            settings,
            events,
            soft_stop: soft_stop.clone(),
            stats_last_emit: Mutex::new(Instant::now() - Duration::from_secs(60)),
        };

        let shutdown = ShutdownFlag::new();
        let flag = shutdown.clone();
        let thread = thread::Builder::new()
            .name("upload-engine".into())
            .spawn(move || engine.run(flag))
            .expect("couldn't spawn the upload engine thread");

        (
            EngineHandle { soft_stop },
            ServiceHandle::new(ServiceId("Uploader"), shutdown, thread),
        )
    }

    fn run(&self, shutdown: ShutdownFlag) {
        crate::ix::agent::types::register_service_logging();
        info!("upload engine running");
        loop {
            if shutdown.is_triggered() {
                return;
            }
            let item = match self.queue.get_next_item() {
                Some(item) => item,
                None => {
                    self.emit_queue_stats(false);
                    thread::sleep(Duration::from_millis(c::ENGINE_IDLE_SLEEP_MS));
                    continue;
                }
            };
            if item.status != GalleryStatus::Queued {
                debug!(
                    "skipping {} in unexpected status {}",
                    item.path, item.status
                );
                continue;
            }
            self.upload_gallery(item, &shutdown);
        }
    }

    fn upload_gallery(&self, item: GalleryRecord, shutdown: &ShutdownFlag) {
        let path = item.path.clone();
        info!("starting upload: {}", item.name);

        self.queue.update_item_status(&path, GalleryStatus::Uploading);
        self.queue.record_upload_started(&path);
        self.events
            .publish(Event::gallery_started(&path, item.total_images));
        self.emit_queue_stats(true);

        // The "started" hook runs in the background; its JSON output merges
        // into the ext fields whenever it finishes.
        self.fire_hook_in_background(HookEvent::Started, HookContext::from_record(&item));

        // A soft-stop registered before the first image wins immediately.
        if self.soft_stop.clear(&path) {
            self.queue
                .update_item_status(&path, GalleryStatus::Incomplete);
            return;
        }

        match self.run_gallery_upload(&item, shutdown) {
            Ok(outcome) => self.finish_gallery(&path, outcome),
            Err(e) => {
                error!("upload of {} failed: {}", path, e);
                self.queue.mark_upload_failed(&path, &e.to_string(), None);
            }
        }
        self.emit_queue_stats(true);
    }

    fn run_gallery_upload(
        &self,
        item: &GalleryRecord,
        shutdown: &ShutdownFlag,
    ) -> Result<GalleryOutcome> {
        let path = &item.path;

        // Ensure the gallery exists on the host. Resumed galleries keep
        // their identity; fresh ones are created and queued for rename.
        let (gallery_id, gallery_url) = match (&item.gallery_id, &item.gallery_url) {
            (Some(id), url) => (id.clone(), url.clone().unwrap_or_default()),
            (None, _) => {
                let created = self
                    .host
                    .create_gallery(&item.name, &self.settings)
                    .map_err(|e| Error::gallery_create_failed(e.to_string()))?;
                self.queue
                    .set_item_gallery(path, &created.gallery_id, &created.gallery_url);
                if let Some(rename) = &self.rename {
                    rename.queue_rename(&created.gallery_id, &item.name);
                }
                (created.gallery_id, created.gallery_url)
            }
        };

        // Everything on disk that isn't already uploaded.
        let all_images = list_images(Path::new(path))?;
        if all_images.is_empty() {
            return Err(Error::no_images(path.clone()));
        }
        let pending: VecDeque<String> = all_images
            .iter()
            .filter(|name| !item.uploaded_files.contains(*name))
            .cloned()
            .collect();
        let total_known = item.total_images.max(all_images.len() as i64);

        let counters = ByteCounters::new();
        let sampler = self.spawn_bandwidth_sampler(path.clone(), counters.clone());
        let upload_started = Instant::now();

        let shared = Arc::new(WorkerShared {
            queue: self.queue.clone(),
            host: self.host.clone(),
            settings: self.settings.clone(),
            soft_stop: self.soft_stop.clone(),
            shutdown: shutdown.clone(),
            path: path.clone(),
            gallery_id: gallery_id.clone(),
            counters: counters.clone(),
            jobs: Mutex::new(pending),
            results: Mutex::new(GalleryResults {
                gallery_id: gallery_id.clone(),
                gallery_url: gallery_url.clone(),
                images: vec![],
                failed: vec![],
            }),
        });

        let pool_size = self
            .settings
            .parallel_batch_size
            .max(1)
            .min(num_cpus::get().max(1));
        let mut workers = vec![];
        for n in 0..pool_size {
            let shared = shared.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("upload-{}", n))
                    .spawn(move || image_worker(shared))
                    .expect("couldn't spawn an image upload worker"),
            );
        }
        for worker in workers {
            let _ = worker.join();
        }

        sampler.stop.store(true, Ordering::SeqCst);
        let _ = sampler.thread.join();

        let soft_stopped = self.soft_stop.clear(path) || shutdown.is_triggered();
        let results = {
            let shared = Arc::try_unwrap(shared)
                .unwrap_or_else(|_| panic!("image workers still hold the shared state"));
            shared.results.into_inner().expect("results lock poisoned")
        };

        // The gallery-average transfer rate over this run.
        let elapsed = upload_started.elapsed().as_secs_f64();
        let final_kibps = if elapsed > 0.0 {
            (counters.gallery_total() as f64 / 1024.0) / elapsed
        } else {
            0.0
        };
        self.queue.set_item_rates(path, 0.0, Some(final_kibps));

        Ok(GalleryOutcome {
            results,
            soft_stopped,
            total_known,
        })
    }

    fn finish_gallery(&self, path: &str, outcome: GalleryOutcome) {
        let GalleryOutcome {
            results,
            soft_stopped,
            total_known,
        } = outcome;

        let uploaded_now = self
            .queue
            .get_item(path)
            .map(|item| item.uploaded_images)
            .unwrap_or(0);
        let successful = results.images.len() as i64;
        let failed = results.failed.len() as i64;

        if soft_stopped && uploaded_now < total_known {
            info!("soft-stopped {}: {}/{} uploaded", path, uploaded_now, total_known);
            self.queue
                .update_item_status(path, GalleryStatus::Incomplete);
            return;
        }

        if failed > 0 {
            let message = if successful > 0 {
                format!("Partial upload failure: {} images failed", failed)
            } else {
                "Upload failed".to_string()
            };
            self.queue
                .mark_upload_failed(path, &message, Some(results.failed.clone()));
            return;
        }

        if uploaded_now < total_known {
            // Nothing failed but the folder shrank or a worker bailed out;
            // treat it like a resumable stop.
            self.queue
                .update_item_status(path, GalleryStatus::Incomplete);
            return;
        }

        // Full success.
        self.queue.update_item_status(path, GalleryStatus::Completed);
        let record = match self.queue.get_item(path) {
            Some(record) => record,
            None => return,
        };

        let written = self.artifacts.write(&record, &results);
        if let Err(e) = self
            .queue
            .database()
            .record_gallery_completed(successful, record.total_size)
        {
            warn!("couldn't accumulate lifetime stats: {}", e);
        }

        let mut context = HookContext::from_record(&record);
        context.image_count = successful;
        context.json_path = written
            .json_path()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        context.bbcode_path = written
            .bbcode_path()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        self.fire_hook_in_background(HookEvent::Completed, context);

        self.events.publish(Event::GalleryCompleted {
            path: path.to_string(),
            successful,
            failed,
            gallery_id: results.gallery_id.clone(),
            gallery_url: results.gallery_url.clone(),
        });
        info!("completed {}: {} image(s)", path, successful);
    }

    fn fire_hook_in_background(&self, event: HookEvent, context: HookContext) {
        let hooks = self.hooks.clone();
        let queue = self.queue.clone();
        let path = context.gallery_path.clone();
        let _ = thread::Builder::new()
            .name(format!("hook-{}", event.as_str()))
            .spawn(move || {
                let fields = hooks.execute_event(event, &context);
                if !fields.is_empty() {
                    queue.apply_ext_fields(&path, &fields);
                }
            });
    }

    // Polls the global byte counter every 200 ms and feeds the aggregator.
    fn spawn_bandwidth_sampler(&self, path: String, counters: ByteCounters) -> Sampler {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let aggregator = self.aggregator.clone();
        let queue = self.queue.clone();
        let thread = thread::spawn(move || {
            let mut last_bytes = counters.global_total();
            let mut last_time = Instant::now();
            let mut last_rate_store = Instant::now();
            while !stop_flag.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(c::BANDWIDTH_POLL_INTERVAL_MS));
                let now_bytes = counters.global_total();
                let elapsed = last_time.elapsed().as_secs_f64();
                if now_bytes > last_bytes && elapsed > 0.0 {
                    let instant_kbps = ((now_bytes - last_bytes) as f64 / elapsed) / 1024.0;
                    aggregator.record_sample(PRIMARY_SOURCE, instant_kbps);
                    if last_rate_store.elapsed() >= Duration::from_secs(1) {
                        queue.set_item_rates(&path, instant_kbps, None);
                        last_rate_store = Instant::now();
                    }
                    last_bytes = now_bytes;
                    last_time = Instant::now();
                }
            }
        });
        Sampler { stop, thread }
    }

    // Queue statistics are throttled to once per second unless forced.
    fn emit_queue_stats(&self, force: bool) {
        let mut last = self.stats_last_emit.lock().expect("stats clock poisoned");
        if force || last.elapsed() >= Duration::from_secs(c::QUEUE_STATS_MIN_INTERVAL_SECS) {
            self.events.publish(Event::QueueStats {
                stats: self.queue.get_queue_stats(),
            });
            *last = Instant::now();
        }
    }
}

struct Sampler {
    stop: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

struct GalleryOutcome {
    results: GalleryResults,
    soft_stopped: bool,
    total_known: i64,
}

// State shared by the image worker pool for one gallery.
struct WorkerShared {
    queue: Arc<QueueManager>,
    host: Arc<dyn GalleryHost>,
    settings: UploadSettings,
    soft_stop: SoftStopRegistry,
    shutdown: ShutdownFlag,
    path: String,
    gallery_id: String,
    counters: ByteCounters,
    jobs: Mutex<VecDeque<String>>,
    results: Mutex<GalleryResults>,
}

fn image_worker(shared: Arc<WorkerShared>) {
    loop {
        // Soft-stop and shutdown are observed at image boundaries only;
        // the in-flight request always completes.
        if shared.soft_stop.is_requested(&shared.path) || shared.shutdown.is_triggered() {
            return;
        }
        let basename = {
            let mut jobs = shared.jobs.lock().expect("job queue poisoned");
            match jobs.pop_front() {
                Some(basename) => basename,
                None => return,
            }
        };
        upload_one_image(&shared, &basename);
    }
}

fn upload_one_image(shared: &WorkerShared, basename: &str) {
    let file = Path::new(&shared.path).join(basename);
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);

    let mut attempt = 0u32;
    loop {
        match shared
            .host
            .upload_image(&shared.gallery_id, &file, &shared.settings, &shared.counters)
        {
            Ok(uploaded) => {
                let (width, height) = image::image_dimensions(&file)
                    .map(|(w, h)| (i64::from(w), i64::from(h)))
                    .unwrap_or((0, 0));
                shared
                    .queue
                    .record_image_uploaded(&shared.path, basename, size);
                let mut results = shared.results.lock().expect("results lock poisoned");
                results.images.push(ImageResult {
                    filename: basename.to_string(),
                    size_bytes: size,
                    width,
                    height,
                    image_url: uploaded.image_url,
                    thumbnail_url: uploaded.thumbnail_url,
                });
                return;
            }
            Err(e) => {
                let retryable = e.is_transient() && attempt < shared.settings.max_retries;
                if !retryable {
                    warn!("image {} failed permanently: {}", basename, e);
                    shared
                        .results
                        .lock()
                        .expect("results lock poisoned")
                        .failed
                        .push(basename.to_string());
                    return;
                }
                let backoff = Duration::from_secs(1u64 << attempt.min(10));
                debug!(
                    "image {} failed (attempt {}), retrying in {:?}: {}",
                    basename,
                    attempt + 1,
                    backoff,
                    e
                );
                thread::sleep(backoff);
                attempt += 1;
            }
        }
    }
}

/// Root-only enumeration of recognized images, sorted by name.
fn list_images(folder: &Path) -> Result<Vec<String>> {
    let mut names = vec![];
    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let recognized = lower_extension(&entry.path())
            .map(|ext| c::IMAGE_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false);
        if recognized {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ix::agent::api::{CreatedGallery, UploadedImage};
    use crate::ix::agent::database::StoreWriter;
    use crate::ix::agent::queue::ScanOutcome;
    use crate::ix::util;
    use std::collections::HashMap;
    use std::io::Write as _;

    struct MockHost {
        created: Mutex<Vec<String>>,
        // basename -> remaining transient failures before success
        transient_failures: Mutex<HashMap<String, u32>>,
        // basenames that always fail fatally
        always_fail: HashSet<String>,
        delay: Duration,
    }

    impl MockHost {
        fn new() -> Self {
            Self {
                created: Mutex::new(vec![]),
                transient_failures: Mutex::new(HashMap::new()),
                always_fail: HashSet::new(),
                delay: Duration::from_millis(0),
            }
        }

        fn created_count(&self) -> usize {
            self.created.lock().unwrap().len()
        }
    }

    impl GalleryHost for MockHost {
        fn create_gallery(
            &self,
            name: &str,
            _settings: &UploadSettings,
        ) -> crate::ix::agent::api::Result<CreatedGallery> {
            let mut created = self.created.lock().unwrap();
            created.push(name.to_string());
            let id = format!("g{}", created.len());
            Ok(CreatedGallery {
                gallery_url: format!("https://imx.to/g/{}", id),
                gallery_id: id,
            })
        }

        fn upload_image(
            &self,
            _gallery_id: &str,
            file: &Path,
            _settings: &UploadSettings,
            counters: &ByteCounters,
        ) -> crate::ix::agent::api::Result<UploadedImage> {
            if self.delay > Duration::from_millis(0) {
                thread::sleep(self.delay);
            }
            let basename = file.file_name().unwrap().to_str().unwrap().to_string();
            if self.always_fail.contains(&basename) {
                return Err(crate::ix::agent::api::Error::fatal_status(422, "rejected"));
            }
            {
                let mut failures = self.transient_failures.lock().unwrap();
                if let Some(remaining) = failures.get_mut(&basename) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(crate::ix::agent::api::Error::transient("flaky"));
                    }
                }
            }
            counters.add(file.metadata().map(|m| m.len()).unwrap_or(0));
            Ok(UploadedImage {
                image_url: format!("https://imx.to/i/{}", basename),
                thumbnail_url: format!("https://imx.to/t/{}", basename),
            })
        }
    }

    struct Rig {
        queue: Arc<QueueManager>,
        handle: EngineHandle,
        service: ServiceHandle,
        central: tempfile::TempDir,
        _templates: tempfile::TempDir,
        events: EventBus,
    }

    fn rig(host: Arc<MockHost>, settings: UploadSettings) -> Rig {
        let db = util::database::temp().unwrap();
        let (writer, _writer_handle) = StoreWriter::spawn(db.clone());
        let events = EventBus::new();
        let (queue, _scan_rx) = QueueManager::new(db.clone(), writer, events.clone()).unwrap();
        let (aggregator, _agg_handle) = BandwidthAggregator::spawn(db, events.clone());

        let central = tempfile::tempdir().unwrap();
        let templates = tempfile::tempdir().unwrap();
        let artifacts = Arc::new(ArtifactWriter::with_dirs(
            central.path().to_path_buf(),
            templates.path().to_path_buf(),
        ));

        let (handle, service) = UploadEngine::spawn(
            queue.clone(),
            host,
            aggregator,
            artifacts,
            Arc::new(HookExecutor::new()),
            None,
            settings,
            events.clone(),
        );
        Rig {
            queue,
            handle,
            service,
            central,
            _templates: templates,
            events,
        }
    }

    fn gallery_with_images(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            std::fs::File::create(dir.path().join(name))
                .unwrap()
                .write_all(&[9u8; 256])
                .unwrap();
        }
        dir
    }

    fn add_scanned(queue: &QueueManager, dir: &tempfile::TempDir, name: &str, files: &[&str]) {
        let path = dir.path().to_str().unwrap();
        queue.add_item(path, Some(name), None, None).unwrap();
        queue.apply_scan_result(
            path,
            &ScanOutcome {
                total_images: files.len() as i64,
                total_size: 256 * files.len() as i64,
                avg_width: 1,
                avg_height: 1,
                files: files.iter().map(|f| f.to_string()).collect(),
            },
        );
    }

    fn wait_for_status(queue: &QueueManager, path: &str, status: GalleryStatus) -> GalleryRecord {
        for _ in 0..600 {
            if let Some(item) = queue.get_item(path) {
                if item.status == status {
                    return item;
                }
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!(
            "gallery never reached {:?}; currently {:?}",
            status,
            queue.get_item(path).map(|i| i.status)
        );
    }

    fn shut_down(mut rig: Rig) {
        rig.service.stop();
        rig.service.join();
    }

    #[test]
    fn happy_path_uploads_everything_and_writes_artifacts() {
        let files = ["a.jpg", "b.jpg", "c.jpg"];
        let dir = gallery_with_images(&files);
        let path = dir.path().to_str().unwrap().to_string();

        let host = Arc::new(MockHost::new());
        let rig = rig(host.clone(), UploadSettings::default());
        let rx = rig.events.subscribe();
        add_scanned(&rig.queue, &dir, "Alpha", &files);
        assert!(rig.queue.start_item(&path));

        let item = wait_for_status(&rig.queue, &path, GalleryStatus::Completed);
        assert_eq!(item.progress, 100);
        assert_eq!(item.uploaded_images, 3);
        assert!(item.gallery_id.is_some());
        assert!(item.gallery_url.is_some());
        assert!(item.final_kibps >= 0.0);

        // Artifacts landed in both locations.
        let stem = format!("Alpha_{}", item.gallery_id.as_ref().unwrap());
        assert!(rig.central.path().join(format!("{}.json", stem)).exists());
        assert!(rig
            .central
            .path()
            .join(format!("{}_bbcode.txt", stem))
            .exists());
        assert!(dir
            .path()
            .join(".uploaded")
            .join(format!("{}.json", stem))
            .exists());

        // Progress and completion events surfaced.
        let mut progress_events = 0;
        let mut completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::ProgressUpdated { .. } => progress_events += 1,
                Event::GalleryCompleted { successful, .. } => {
                    completed = true;
                    assert_eq!(successful, 3);
                }
                _ => {}
            }
        }
        assert_eq!(progress_events, 3);
        assert!(completed);
        assert_eq!(host.created_count(), 1);

        shut_down(rig);
    }

    #[test]
    fn partial_failure_then_resume_completes() {
        let files = ["01.jpg", "02.jpg", "03.jpg", "04.jpg", "05.jpg"];
        let dir = gallery_with_images(&files);
        let path = dir.path().to_str().unwrap().to_string();

        let mut host = MockHost::new();
        host.always_fail.insert("04.jpg".to_string());
        let mut settings = UploadSettings::default();
        settings.max_retries = 0;
        settings.parallel_batch_size = 2;

        let rig = rig(Arc::new(host), settings);
        add_scanned(&rig.queue, &dir, "Partial", &files);
        assert!(rig.queue.start_item(&path));

        let item = wait_for_status(&rig.queue, &path, GalleryStatus::UploadFailed);
        assert_eq!(item.uploaded_images, 4);
        assert_eq!(item.failed_files, vec!["04.jpg".to_string()]);
        assert!(item.gallery_id.is_some());
        let gallery_id = item.gallery_id.clone();

        // Retry resumes rather than starting over, because progress exists.
        assert!(rig.queue.retry_failed_upload(&path));
        assert_eq!(
            rig.queue.get_item(&path).unwrap().status,
            GalleryStatus::Incomplete
        );

        // The failing image recovers; a restart finishes the remainder
        // without re-creating the gallery or re-uploading the done files.
        {
            let rig_queue = rig.queue.get_item(&path).unwrap();
            assert_eq!(rig_queue.uploaded_images, 4);
        }
        assert!(rig.queue.start_item(&path));
        let item = wait_for_status(&rig.queue, &path, GalleryStatus::Completed);
        assert_eq!(item.uploaded_images, 5);
        assert_eq!(item.gallery_id, gallery_id);

        shut_down(rig);
    }

    #[test]
    fn transient_failures_are_retried_with_backoff() {
        let files = ["a.jpg", "b.jpg"];
        let dir = gallery_with_images(&files);
        let path = dir.path().to_str().unwrap().to_string();

        let host = MockHost::new();
        host.transient_failures
            .lock()
            .unwrap()
            .insert("b.jpg".to_string(), 1);
        let mut settings = UploadSettings::default();
        settings.max_retries = 2;

        let rig = rig(Arc::new(host), settings);
        add_scanned(&rig.queue, &dir, "Flaky", &files);
        assert!(rig.queue.start_item(&path));

        let item = wait_for_status(&rig.queue, &path, GalleryStatus::Completed);
        assert_eq!(item.uploaded_images, 2);

        shut_down(rig);
    }

    #[test]
    fn soft_stop_finishes_in_flight_and_marks_incomplete() {
        let names: Vec<String> = (0..20).map(|i| format!("{:02}.jpg", i)).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let dir = gallery_with_images(&name_refs);
        let path = dir.path().to_str().unwrap().to_string();

        let mut host = MockHost::new();
        host.delay = Duration::from_millis(50);
        let mut settings = UploadSettings::default();
        settings.parallel_batch_size = 2;

        let rig = rig(Arc::new(host), settings);
        add_scanned(&rig.queue, &dir, "Slow", &name_refs);
        assert!(rig.queue.start_item(&path));

        // Let a few finish, then soft-stop.
        for _ in 0..600 {
            let done = rig
                .queue
                .get_item(&path)
                .map(|i| i.uploaded_images)
                .unwrap_or(0);
            if done >= 3 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        rig.handle.request_soft_stop(&path);

        let item = wait_for_status(&rig.queue, &path, GalleryStatus::Incomplete);
        assert!(item.uploaded_images >= 3);
        assert!(item.uploaded_images < 20);

        // Resume and finish.
        assert!(rig.queue.start_item(&path));
        let item = wait_for_status(&rig.queue, &path, GalleryStatus::Completed);
        assert_eq!(item.uploaded_images, 20);

        shut_down(rig);
    }

    #[test]
    fn resumed_gallery_is_not_recreated_on_the_host() {
        let files = ["a.jpg", "b.jpg"];
        let dir = gallery_with_images(&files);
        let path = dir.path().to_str().unwrap().to_string();

        let host = Arc::new(MockHost::new());
        let rig = rig(host.clone(), UploadSettings::default());
        add_scanned(&rig.queue, &dir, "Once", &files);

        // Pretend half the gallery uploaded in an earlier run.
        rig.queue.set_item_gallery(&path, "gX", "https://imx.to/g/gX");
        rig.queue.record_image_uploaded(&path, "a.jpg", 256);

        assert!(rig.queue.start_item(&path));
        let item = wait_for_status(&rig.queue, &path, GalleryStatus::Completed);
        assert_eq!(item.uploaded_images, 2);
        assert_eq!(item.gallery_id.as_deref(), Some("gX"));
        assert_eq!(host.created_count(), 0);

        shut_down(rig);
    }
}
