//! The imxup agent implementation.
//!
//! Everything is composed explicitly here at process entry: the store, the
//! single writer, the queue manager and its scanner, the bandwidth
//! aggregator, the rename worker, the upload engine, and one worker per
//! enabled file host. No service locator; wiring happens once.

pub mod api;
pub mod archive;
pub mod artifacts;
pub mod bandwidth;
pub mod cli;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod filehost;
pub mod hooks;
pub mod messages;
pub mod queue;
pub mod rename;
pub mod types;

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::*;

use crate::ix;

use self::api::{GalleryHost, ImxClient};
use self::artifacts::ArtifactWriter;
use self::bandwidth::BandwidthAggregator;
use self::config::Config;
use self::database::{Database, Source, StoreWriter};
use self::engine::{EngineHandle, UploadEngine};
use self::filehost::FileHostPool;
use self::hooks::{HookContext, HookEvent, HookExecutor};
use self::messages::{Event, EventBus};
use self::queue::{QueueManager, Scanner};
use self::rename::{RenameHandle, RenameWorker};

pub use self::error::{Error, ErrorKind, Result};
pub use self::types::{ServiceHandle, ServiceId, ShutdownFlag};

/// Handle to the running agent and its services.
pub struct AgentHandle {
    pub queue: Arc<QueueManager>,
    pub engine: EngineHandle,
    pub rename: RenameHandle,
    pub bandwidth: Arc<BandwidthAggregator>,
    pub events: EventBus,
    pub db: Database,
    writer: StoreWriter,
    services: Vec<ServiceHandle>,
}

impl AgentHandle {
    /// Cooperative shutdown: every service observes its flag at the next
    /// loop boundary, queued writes are flushed, and threads are joined.
    pub fn shutdown(mut self) {
        info!("agent shutting down");
        for service in &self.services {
            service.stop();
        }
        self.writer.flush();
        self.writer.shutdown();
        for service in self.services.iter_mut() {
            service.join();
        }
        info!("agent stopped");
    }
}

#[derive(Default)]
pub struct Agent;

impl Agent {
    pub fn new() -> Self {
        Default::default()
    }

    /// Starts every service defined by the configuration and returns the
    /// composed handle.
    pub fn start(self, config: &Config) -> Result<AgentHandle> {
        ix::ensure_home_layout()?;

        let db = Database::new(&Source::File(ix::database_file()?.to_path_buf()))?;
        let (writer, writer_thread) = StoreWriter::spawn(db.clone());
        let events = EventBus::new();
        let mut services = vec![];
        services.push(ServiceHandle::new(
            ServiceId("StoreWriter"),
            ShutdownFlag::new(),
            writer_thread,
        ));

        let (queue, scan_rx) = QueueManager::new(db.clone(), writer.clone(), events.clone())?;
        services.push(Scanner::spawn(
            queue.clone(),
            scan_rx,
            config.scanning.clone(),
        ));

        let (bandwidth, bandwidth_service) =
            BandwidthAggregator::spawn(db.clone(), events.clone());
        services.push(bandwidth_service);

        let (rename, rename_services) = RenameWorker::spawn(db.clone(), config, events.clone())?;
        services.extend(rename_services);

        let artifacts = Arc::new(ArtifactWriter::new()?);
        let hooks = Arc::new(HookExecutor::new());
        let host: Arc<dyn GalleryHost> = Arc::new(ImxClient::from_secret_store(&config.upload)?);

        let (engine, engine_service) = UploadEngine::spawn(
            queue.clone(),
            host,
            bandwidth.clone(),
            artifacts,
            hooks.clone(),
            Some(rename.clone()),
            config.upload.clone(),
            events.clone(),
        );
        services.push(engine_service);

        services.extend(FileHostPool::spawn(
            db.clone(),
            config,
            bandwidth.clone(),
            events.clone(),
        ));

        services.push(spawn_event_pump(
            queue.clone(),
            hooks,
            events.subscribe(),
        ));

        if config.auto_archive.enabled {
            services.push(spawn_auto_archive(queue.clone(), config.auto_archive.clone()));
        }

        info!("agent started with {} service(s)", services.len());
        Ok(AgentHandle {
            queue,
            engine,
            rename,
            bandwidth,
            events,
            db,
            writer,
            services,
        })
    }
}

// Subscribes the agent itself to the event stream: "added" hooks fire when
// galleries enter the queue, and status-check results flow back into the
// gallery records.
fn spawn_event_pump(
    queue: Arc<QueueManager>,
    hooks: Arc<HookExecutor>,
    rx: Receiver<Event>,
) -> ServiceHandle {
    let shutdown = ShutdownFlag::new();
    let flag = shutdown.clone();
    let thread = thread::Builder::new()
        .name("event-pump".into())
        .spawn(move || {
            types::register_service_logging();
            loop {
                if flag.is_triggered() {
                    return;
                }
                let event = match rx.recv_timeout(Duration::from_millis(500)) {
                    Ok(event) => event,
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return,
                };
                match event {
                    Event::GalleryAdded { path } => {
                        let queue = queue.clone();
                        let hooks = hooks.clone();
                        let _ = thread::Builder::new().name("hook-added".into()).spawn(
                            move || {
                                let record = match queue.get_item(&path) {
                                    Some(record) => record,
                                    None => return,
                                };
                                let fields = hooks.execute_event(
                                    HookEvent::Added,
                                    &HookContext::from_record(&record),
                                );
                                if !fields.is_empty() {
                                    queue.apply_ext_fields(&path, &fields);
                                }
                            },
                        );
                    }
                    Event::StatusCheckCompleted { results } => {
                        for (path, result) in results {
                            queue.update_imx_status(&path, result.online, result.total);
                        }
                    }
                    _ => {}
                }
            }
        })
        .expect("couldn't spawn the event pump thread");
    ServiceHandle::new(ServiceId("EventPump"), shutdown, thread)
}

// Periodically delegates to the queue manager's canonical auto-archive
// pass.
fn spawn_auto_archive(
    queue: Arc<QueueManager>,
    settings: config::AutoArchiveSettings,
) -> ServiceHandle {
    let shutdown = ShutdownFlag::new();
    let flag = shutdown.clone();
    let thread = thread::Builder::new()
        .name("auto-archive".into())
        .spawn(move || {
            let interval = Duration::from_secs(settings.check_minutes * 60);
            let mut last_run = Instant::now();
            loop {
                if flag.is_triggered() {
                    return;
                }
                thread::sleep(Duration::from_millis(500));
                if last_run.elapsed() >= interval {
                    queue.execute_auto_archive(settings.archive_after_minutes);
                    last_run = Instant::now();
                }
            }
        })
        .expect("couldn't spawn the auto-archive thread");
    ServiceHandle::new(ServiceId("AutoArchive"), shutdown, thread)
}
