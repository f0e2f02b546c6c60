//! The file-host worker pool: one worker per enabled host, each uploading
//! whole galleries as store-mode ZIP archives.
//!
//! Workers own isolated HTTP sessions and credentials. Jobs are the
//! `pending` rows of the file_host_uploads table, drained FIFO by
//! `updated_at`; progress bytes feed the bandwidth aggregator under the
//! host's name.

mod error;

pub use self::error::{Error, ErrorKind, Result};

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::*;
use serde_derive::Deserialize;

use crate::ix::agent::api::{ByteCounters, CountingReader};
use crate::ix::agent::archive;
use crate::ix::agent::bandwidth::BandwidthAggregator;
use crate::ix::agent::config::constants as c;
use crate::ix::agent::config::{self, Config, FileHostSettings};
use crate::ix::agent::database::{Database, FileHostStatus, FileHostUpload};
use crate::ix::agent::messages::{Event, EventBus};
use crate::ix::agent::types::{ServiceHandle, ServiceId, ShutdownFlag};

/// Storage quota reported by a host; `-1/-1` means unlimited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageQuota {
    pub total: i64,
    pub left: i64,
}

impl StorageQuota {
    pub fn unlimited() -> Self {
        Self { total: -1, left: -1 }
    }
}

/// The wire operations one file host supports.
pub trait FileHostClient: Send {
    fn host_name(&self) -> &str;

    /// Establishes the session. Called at spin-up and again lazily when a
    /// previous attempt failed.
    fn authenticate(&mut self) -> Result<()>;

    /// Uploads an archive, streaming its bytes through the given counters.
    /// Returns the download URL.
    fn upload_archive(&mut self, archive: &Path, counters: &ByteCounters) -> Result<String>;

    /// Remaining storage on the host.
    fn storage_left(&mut self) -> Result<StorageQuota>;
}

#[derive(Deserialize)]
struct LoginResponse {
    status: String,
    #[serde(default)]
    token: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct ArchiveUploadResponse {
    status: String,
    #[serde(default)]
    download_url: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct AccountResponse {
    #[serde(default = "unlimited")]
    storage_total: i64,
    #[serde(default = "unlimited")]
    storage_left: i64,
}

fn unlimited() -> i64 {
    -1
}

/// Generic token-auth HTTP client, one per configured host.
pub struct HttpFileHostClient {
    name: String,
    api_url: String,
    username: String,
    password: String,
    client: reqwest::Client,
    token: Option<String>,
}

impl HttpFileHostClient {
    pub fn new(settings: &FileHostSettings) -> Result<HttpFileHostClient> {
        let password = config::get_secret(&settings.secret_name())?.unwrap_or_default();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(c::FILEHOST_UPLOAD_TIMEOUT_SECS))
            .build()?;
        Ok(HttpFileHostClient {
            name: settings.name.clone(),
            api_url: settings.api_url.clone(),
            username: settings.username.clone(),
            password,
            client,
            token: None,
        })
    }

    fn token(&self) -> Result<&str> {
        self.token
            .as_ref()
            .map(String::as_str)
            .ok_or_else(|| Error::auth_failed("no session token"))
    }
}

impl FileHostClient for HttpFileHostClient {
    fn host_name(&self) -> &str {
        &self.name
    }

    fn authenticate(&mut self) -> Result<()> {
        if self.username.is_empty() || self.password.is_empty() {
            return Err(Error::auth_failed("no credentials configured"));
        }
        let params = [
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
        ];
        let mut response = self
            .client
            .post(&format!("{}/login", self.api_url))
            .form(&params)
            .send()?;
        if !response.status().is_success() {
            return Err(Error::http_status(response.status().as_u16()));
        }
        let parsed: LoginResponse = response
            .json()
            .map_err(|e| Error::auth_failed(e.to_string()))?;
        if parsed.status != "ok" || parsed.token.is_empty() {
            return Err(Error::auth_failed(parsed.message));
        }
        self.token = Some(parsed.token);
        Ok(())
    }

    fn upload_archive(&mut self, archive: &Path, counters: &ByteCounters) -> Result<String> {
        let size = archive.metadata()?.len();
        let basename = archive
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("gallery.zip")
            .to_string();
        let reader = CountingReader::new(std::fs::File::open(archive)?, counters.clone());
        let part = reqwest::multipart::Part::reader_with_length(reader, size)
            .file_name(basename)
            .mime_str("application/zip")
            .map_err(|e| Error::upload_rejected(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("token", self.token()?.to_string())
            .part("file", part);

        let mut response = self
            .client
            .post(&format!("{}/upload", self.api_url))
            .multipart(form)
            .send()?;
        if !response.status().is_success() {
            return Err(Error::http_status(response.status().as_u16()));
        }
        let parsed: ArchiveUploadResponse = response
            .json()
            .map_err(|e| Error::upload_rejected(e.to_string()))?;
        if parsed.status != "ok" || parsed.download_url.is_empty() {
            return Err(Error::upload_rejected(parsed.message));
        }
        Ok(parsed.download_url)
    }

    fn storage_left(&mut self) -> Result<StorageQuota> {
        let token = self.token()?.to_string();
        let mut response = self
            .client
            .get(&format!("{}/account", self.api_url))
            .query(&[("token", token.as_str())])
            .send()?;
        if !response.status().is_success() {
            return Err(Error::http_status(response.status().as_u16()));
        }
        let parsed: AccountResponse = response
            .json()
            .unwrap_or_else(|_| AccountResponse {
                storage_total: -1,
                storage_left: -1,
            });
        Ok(StorageQuota {
            total: parsed.storage_total,
            left: parsed.storage_left,
        })
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

pub struct FileHostPool;

impl FileHostPool {
    /// Spawns one worker per enabled host from the configuration.
    pub fn spawn(
        db: Database,
        config: &Config,
        aggregator: Arc<BandwidthAggregator>,
        events: EventBus,
    ) -> Vec<ServiceHandle> {
        let mut handles = vec![];
        for settings in config.file_hosts.iter().filter(|h| h.enabled) {
            match HttpFileHostClient::new(settings) {
                Ok(client) => handles.push(spawn_worker(
                    db.clone(),
                    Box::new(client),
                    aggregator.clone(),
                    events.clone(),
                )),
                Err(e) => {
                    error!("couldn't build client for host {}: {}", settings.name, e);
                    events.publish(Event::FileHostSpinUp {
                        host: settings.name.clone(),
                        ok: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        handles
    }
}

/// Spawns a worker around any client implementation.
pub(crate) fn spawn_worker(
    db: Database,
    client: Box<dyn FileHostClient>,
    aggregator: Arc<BandwidthAggregator>,
    events: EventBus,
) -> ServiceHandle {
    let shutdown = ShutdownFlag::new();
    let flag = shutdown.clone();
    let name = format!("filehost-{}", client.host_name());
    let thread = thread::Builder::new()
        .name(name)
        .spawn(move || worker_loop(db, client, aggregator, events, flag))
        .expect("couldn't spawn a file host worker thread");
    ServiceHandle::new(ServiceId("FileHost"), shutdown, thread)
}

fn worker_loop(
    db: Database,
    mut client: Box<dyn FileHostClient>,
    aggregator: Arc<BandwidthAggregator>,
    events: EventBus,
    shutdown: ShutdownFlag,
) {
    crate::ix::agent::types::register_service_logging();
    let host = client.host_name().to_string();

    // Spin-up: authenticate once and report readiness either way.
    let mut authenticated = match client.authenticate() {
        Ok(()) => {
            info!("file host {} ready", host);
            events.publish(Event::FileHostSpinUp {
                host: host.clone(),
                ok: true,
                error: None,
            });
            publish_quota(&mut client, &events, &host);
            true
        }
        Err(e) => {
            warn!("file host {} spin-up failed: {}", host, e);
            events.publish(Event::FileHostSpinUp {
                host: host.clone(),
                ok: false,
                error: Some(e.to_string()),
            });
            false
        }
    };

    loop {
        if shutdown.is_triggered() {
            return;
        }
        let pending = match db.get_pending_file_host_uploads(&host) {
            Ok(pending) => pending,
            Err(e) => {
                warn!("file host {}: couldn't read pending jobs: {}", host, e);
                thread::sleep(Duration::from_secs(1));
                continue;
            }
        };
        if pending.is_empty() {
            thread::sleep(Duration::from_secs(1));
            continue;
        }

        for job in pending {
            if shutdown.is_triggered() {
                return;
            }
            if !authenticated {
                authenticated = client.authenticate().is_ok();
            }
            match process_job(&db, client.as_mut(), &aggregator, &events, &host, job) {
                Ok(()) => publish_quota(&mut client, &events, &host),
                Err(e) => warn!("file host {}: job failed: {}", host, e),
            }
        }
    }
}

fn publish_quota(client: &mut Box<dyn FileHostClient>, events: &EventBus, host: &str) {
    match client.storage_left() {
        Ok(quota) => events.publish(Event::StorageUpdated {
            host: host.to_string(),
            total: quota.total,
            left: quota.left,
        }),
        Err(e) => debug!("file host {}: quota query failed: {}", host, e),
    }
}

fn process_job(
    db: &Database,
    client: &mut dyn FileHostClient,
    aggregator: &Arc<BandwidthAggregator>,
    events: &EventBus,
    host: &str,
    mut job: FileHostUpload,
) -> Result<()> {
    let outcome = run_job(db, client, aggregator, events, host, &mut job);
    match outcome {
        Ok(download_url) => {
            job.status = FileHostStatus::Completed;
            job.download_url = Some(download_url.clone());
            job.error = None;
            job.uploaded_bytes = job.total_bytes;
            job.updated_at = chrono::Utc::now();
            db.upsert_file_host_upload(&job)?;
            events.publish(Event::FileHostUploadCompleted {
                db_id: job.gallery_db_id,
                host: host.to_string(),
                download_url,
            });
            Ok(())
        }
        Err(e) => {
            job.status = FileHostStatus::Failed;
            job.error = Some(e.to_string());
            job.updated_at = chrono::Utc::now();
            let _ = db.upsert_file_host_upload(&job);
            events.publish(Event::FileHostUploadFailed {
                db_id: job.gallery_db_id,
                host: host.to_string(),
                error: e.to_string(),
            });
            Err(e)
        }
    }
}

fn run_job(
    db: &Database,
    client: &mut dyn FileHostClient,
    aggregator: &Arc<BandwidthAggregator>,
    events: &EventBus,
    host: &str,
    job: &mut FileHostUpload,
) -> Result<String> {
    let gallery = db
        .get_item_by_db_id(job.gallery_db_id)?
        .ok_or_else(|| Error::gallery_missing(job.gallery_db_id))?;

    job.status = FileHostStatus::Uploading;
    job.updated_at = chrono::Utc::now();
    db.upsert_file_host_upload(job)?;
    events.publish(Event::FileHostUploadStarted {
        db_id: job.gallery_db_id,
        host: host.to_string(),
    });

    // No prepared archive exists for galleries; pack a temporary one.
    let archive_path = archive::create_temp_zip(Path::new(&gallery.path))?;
    let total_bytes = archive_path.metadata()?.len() as i64;
    job.total_bytes = total_bytes;
    db.upsert_file_host_upload(job)?;

    let counters = ByteCounters::new();
    let progress_stop = Arc::new(AtomicU64::new(0));
    let sampler = spawn_progress_sampler(
        counters.clone(),
        total_bytes,
        job.gallery_db_id,
        host.to_string(),
        aggregator.clone(),
        events.clone(),
        progress_stop.clone(),
    );

    let outcome = client.upload_archive(&archive_path, &counters);

    progress_stop.store(1, Ordering::SeqCst);
    let _ = sampler.join();
    archive::remove_temp_file_with_retry(&archive_path);

    let download_url = outcome?;
    info!(
        "file host {}: gallery {} uploaded ({} bytes)",
        host, job.gallery_db_id, total_bytes
    );
    Ok(download_url)
}

// Polls the upload counter every 200 ms, feeding the aggregator and the
// per-host progress event until told to stop.
fn spawn_progress_sampler(
    counters: ByteCounters,
    total_bytes: i64,
    db_id: i64,
    host: String,
    aggregator: Arc<BandwidthAggregator>,
    events: EventBus,
    stop: Arc<AtomicU64>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut last_bytes = 0u64;
        let mut last_time = Instant::now();
        while stop.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(c::BANDWIDTH_POLL_INTERVAL_MS));
            let now_bytes = counters.global_total();
            let elapsed = last_time.elapsed().as_secs_f64();
            if now_bytes > last_bytes && elapsed > 0.0 {
                let delta = (now_bytes - last_bytes) as f64;
                let instant_kbps = (delta / elapsed) / 1024.0;
                aggregator.record_sample(&host, instant_kbps);
                events.publish(Event::FileHostUploadProgress {
                    db_id,
                    host: host.clone(),
                    uploaded: now_bytes as i64,
                    total: total_bytes,
                    bps: delta / elapsed,
                });
                last_bytes = now_bytes;
                last_time = Instant::now();
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ix::agent::database::GalleryRecord;
    use crate::ix::util;
    use std::io::Write as _;
    use std::sync::Mutex;

    struct MockHost {
        name: String,
        auth_ok: bool,
        upload_outcome: std::result::Result<String, String>,
        uploads: Arc<Mutex<Vec<u64>>>,
    }

    impl FileHostClient for MockHost {
        fn host_name(&self) -> &str {
            &self.name
        }

        fn authenticate(&mut self) -> Result<()> {
            if self.auth_ok {
                Ok(())
            } else {
                Err(Error::auth_failed("bad credentials"))
            }
        }

        fn upload_archive(&mut self, archive: &Path, counters: &ByteCounters) -> Result<String> {
            let size = archive.metadata().unwrap().len();
            counters.add(size);
            self.uploads.lock().unwrap().push(size);
            match &self.upload_outcome {
                Ok(url) => Ok(url.clone()),
                Err(message) => Err(Error::upload_rejected(message.clone())),
            }
        }

        fn storage_left(&mut self) -> Result<StorageQuota> {
            Ok(StorageQuota::unlimited())
        }
    }

    fn seeded_gallery(db: &Database) -> (tempfile::TempDir, i64) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("a.jpg"))
            .unwrap()
            .write_all(&[1u8; 512])
            .unwrap();
        let mut record =
            GalleryRecord::new(dir.path().to_str().unwrap(), "Mock Gallery");
        let db_id = db.insert_item(&mut record).unwrap();
        (dir, db_id)
    }

    fn pending_job(db: &Database, db_id: i64, host: &str) {
        let mut job = FileHostUpload::new(db_id, host);
        job.status = FileHostStatus::Pending;
        db.upsert_file_host_upload(&job).unwrap();
    }

    fn wait_for_status(db: &Database, db_id: i64, status: FileHostStatus) -> FileHostUpload {
        for _ in 0..300 {
            let records = db.get_file_host_uploads(db_id).unwrap();
            if let Some(record) = records.iter().find(|r| r.status == status) {
                return record.clone();
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("record never reached {:?}", status);
    }

    #[test]
    fn pending_job_completes_with_download_url() {
        let db = util::database::temp().unwrap();
        let (aggregator, mut agg_handle) =
            BandwidthAggregator::spawn(db.clone(), EventBus::new());
        let (_dir, db_id) = seeded_gallery(&db);
        pending_job(&db, db_id, "mockhost");

        let uploads = Arc::new(Mutex::new(vec![]));
        let client = MockHost {
            name: "mockhost".into(),
            auth_ok: true,
            upload_outcome: Ok("https://mockhost/dl/1".into()),
            uploads: uploads.clone(),
        };
        let events = EventBus::new();
        let rx = events.subscribe();
        let mut handle = spawn_worker(db.clone(), Box::new(client), aggregator, events);

        let record = wait_for_status(&db, db_id, FileHostStatus::Completed);
        assert_eq!(record.download_url.as_deref(), Some("https://mockhost/dl/1"));
        assert!(record.total_bytes > 0);
        assert_eq!(record.uploaded_bytes, record.total_bytes);
        assert_eq!(uploads.lock().unwrap().len(), 1);

        // Spin-up and completion both surfaced as events.
        let mut saw_spin_up = false;
        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::FileHostSpinUp { ok, .. } => saw_spin_up = ok,
                Event::FileHostUploadCompleted { .. } => saw_completed = true,
                _ => {}
            }
        }
        assert!(saw_spin_up);
        assert!(saw_completed);

        handle.stop();
        handle.join();
        agg_handle.stop();
        agg_handle.join();
    }

    #[test]
    fn failed_upload_records_the_error() {
        let db = util::database::temp().unwrap();
        let (aggregator, mut agg_handle) =
            BandwidthAggregator::spawn(db.clone(), EventBus::new());
        let (_dir, db_id) = seeded_gallery(&db);
        pending_job(&db, db_id, "mockhost");

        let client = MockHost {
            name: "mockhost".into(),
            auth_ok: true,
            upload_outcome: Err("quota exceeded".into()),
            uploads: Arc::new(Mutex::new(vec![])),
        };
        let mut handle = spawn_worker(db.clone(), Box::new(client), aggregator, EventBus::new());

        let record = wait_for_status(&db, db_id, FileHostStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("quota exceeded"));

        handle.stop();
        handle.join();
        agg_handle.stop();
        agg_handle.join();
    }

    #[test]
    fn spin_up_failure_is_reported() {
        let db = util::database::temp().unwrap();
        let (aggregator, mut agg_handle) =
            BandwidthAggregator::spawn(db.clone(), EventBus::new());
        let events = EventBus::new();
        let rx = events.subscribe();

        let client = MockHost {
            name: "mockhost".into(),
            auth_ok: false,
            upload_outcome: Ok("unused".into()),
            uploads: Arc::new(Mutex::new(vec![])),
        };
        let mut handle = spawn_worker(db, Box::new(client), aggregator, events);

        let deadline = Instant::now() + Duration::from_secs(3);
        let mut spin_up = None;
        while Instant::now() < deadline && spin_up.is_none() {
            if let Ok(Event::FileHostSpinUp { ok, error, .. }) = rx.try_recv() {
                spin_up = Some((ok, error));
            }
            thread::sleep(Duration::from_millis(10));
        }
        let (ok, error) = spin_up.expect("no spin-up event");
        assert!(!ok);
        assert!(error.unwrap().contains("bad credentials"));

        handle.stop();
        handle.join();
        agg_handle.stop();
        agg_handle.join();
    }
}
