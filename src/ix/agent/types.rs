//! Agent-wide types.

use std::string::ToString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

pub use crate::ix::agent::error::{Error, ErrorKind, Result};

/// Tags this thread's log lines with its thread id. Called at the top of
/// every background service loop.
pub fn register_service_logging() {
    log_mdc::insert("tid", format!("{:?}", thread::current().id()));
}

/// A type that identifies a background service implementation.
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq)]
pub struct ServiceId(pub &'static str);

impl From<ServiceId> for String {
    fn from(id: ServiceId) -> Self {
        id.0.into()
    }
}

impl<'a> From<ServiceId> for &'a str {
    fn from(id: ServiceId) -> Self {
        id.0
    }
}

impl ToString for ServiceId {
    fn to_string(&self) -> String {
        self.0.to_string()
    }
}

/// Cooperative shutdown flag shared between a service thread and its handle.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A handle representing a running background service. Each long-lived
/// worker (engine loop, scanner, store writer, per-host workers, rename
/// worker) runs on its own OS thread; the handle carries the thread join
/// handle and the cooperative shutdown flag.
pub struct ServiceHandle {
    id: ServiceId,
    shutdown: ShutdownFlag,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServiceHandle {
    pub fn new(id: ServiceId, shutdown: ShutdownFlag, thread: thread::JoinHandle<()>) -> Self {
        Self {
            id,
            shutdown,
            thread: Some(thread),
        }
    }

    /// Get the ID of the service.
    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    /// Requests a cooperative stop; the thread observes the flag at its next
    /// loop boundary.
    pub fn stop(&self) {
        self.shutdown.trigger();
    }

    /// Waits for the service thread to finish.
    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("service {:?} panicked", self.id);
            }
        }
    }
}
