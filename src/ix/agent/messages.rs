//! Event types published by the agent's services, and the fan-out bus that
//! delivers them to subscribers.

use std::collections::HashMap;
use std::string::ToString;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use serde_derive::{Deserialize, Serialize};

/// Per-status aggregate reported with `Event::QueueStats`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusAggregate {
    pub count: i64,
    pub images: i64,
    pub bytes: i64,
}

/// Per-gallery result of an image online-status check.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusCheckResult {
    pub db_id: i64,
    pub name: String,
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub online_urls: Vec<String>,
    pub offline_urls: Vec<String>,
}

/// An enum encoding the observable events of the agent. Subscribers receive
/// events in publication order; payloads are plain data so the enum stays
/// serializable for external consumers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "message")]
pub enum Event {
    /// A generic error occurred.
    Error { context: String },
    /// A gallery changed status.
    StatusChanged {
        path: String,
        old: String,
        new: String,
    },
    /// Per-image upload progress within a gallery.
    ProgressUpdated {
        path: String,
        completed: i64,
        total: i64,
        percent: i32,
        current_image: String,
    },
    /// A gallery entered the queue manager.
    GalleryAdded { path: String },
    /// A gallery was removed from the queue manager.
    GalleryRemoved { path: String },
    /// The engine began uploading a gallery.
    GalleryStarted { path: String, total_images: i64 },
    /// The engine finished a gallery.
    GalleryCompleted {
        path: String,
        successful: i64,
        failed: i64,
        gallery_id: String,
        gallery_url: String,
    },
    /// A gallery upload failed outright.
    GalleryFailed { path: String, error: String },
    /// A hook wrote extension fields on a gallery.
    ExtFieldsUpdated {
        path: String,
        fields: HashMap<String, String>,
    },
    /// Aggregate queue statistics, keyed by status token.
    QueueStats {
        stats: HashMap<String, StatusAggregate>,
    },
    /// Smoothed transfer rates from the bandwidth aggregator.
    BandwidthUpdated {
        aggregate_kbps: f64,
        per_source: HashMap<String, f64>,
    },
    /// A new all-time peak transfer rate was recorded.
    PeakUpdated { kbps: f64, timestamp: String },
    /// A file-host worker finished (or failed) its spin-up authentication.
    FileHostSpinUp {
        host: String,
        ok: bool,
        error: Option<String>,
    },
    FileHostUploadStarted { db_id: i64, host: String },
    FileHostUploadProgress {
        db_id: i64,
        host: String,
        uploaded: i64,
        total: i64,
        bps: f64,
    },
    FileHostUploadCompleted {
        db_id: i64,
        host: String,
        download_url: String,
    },
    FileHostUploadFailed {
        db_id: i64,
        host: String,
        error: String,
    },
    /// Remaining storage reported by a file host; -1/-1 means unlimited.
    StorageUpdated { host: String, total: i64, left: i64 },
    /// A gallery rename went through on the host.
    GalleryRenamed { gallery_id: String },
    StatusCheckProgress { done: usize, total: usize },
    StatusCheckCompleted {
        results: HashMap<String, StatusCheckResult>,
    },
    StatusCheckError { error: String },
}

impl Event {
    pub fn error<T: ToString>(context: T) -> Self {
        Event::Error {
            context: context.to_string(),
        }
    }

    pub fn status_changed<P, O, N>(path: P, old: O, new: N) -> Self
    where
        P: Into<String>,
        O: AsRef<str>,
        N: AsRef<str>,
    {
        Event::StatusChanged {
            path: path.into(),
            old: old.as_ref().to_string(),
            new: new.as_ref().to_string(),
        }
    }

    pub fn progress_updated<P: Into<String>, I: Into<String>>(
        path: P,
        completed: i64,
        total: i64,
        current_image: I,
    ) -> Self {
        let percent = if total > 0 {
            ((completed as f64 / total as f64) * 100.0) as i32
        } else {
            0
        };
        Event::ProgressUpdated {
            path: path.into(),
            completed,
            total,
            percent,
            current_image: current_image.into(),
        }
    }

    pub fn gallery_added<P: Into<String>>(path: P) -> Self {
        Event::GalleryAdded { path: path.into() }
    }

    pub fn gallery_removed<P: Into<String>>(path: P) -> Self {
        Event::GalleryRemoved { path: path.into() }
    }

    pub fn gallery_started<P: Into<String>>(path: P, total_images: i64) -> Self {
        Event::GalleryStarted {
            path: path.into(),
            total_images,
        }
    }

    pub fn gallery_failed<P: Into<String>, E: ToString>(path: P, error: E) -> Self {
        Event::GalleryFailed {
            path: path.into(),
            error: error.to_string(),
        }
    }
}

/// Fan-out delivery of events. Every observable is published here; each
/// subscriber owns a channel receiver. Subscribers that go away are dropped
/// on the next publish.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers a new subscriber. Register order defines delivery order
    /// among subscribers.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .expect("event bus lock poisoned")
            .push(tx);
        rx
    }

    /// Publishes an event to every live subscriber, in register order.
    pub fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().expect("event bus lock poisoned");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn publish_reaches_every_subscriber_in_order() {
        let bus = EventBus::new();
        let first = bus.subscribe();
        let second = bus.subscribe();

        bus.publish(Event::gallery_added("/g/a"));
        bus.publish(Event::gallery_removed("/g/a"));

        for rx in [&first, &second].iter() {
            match rx.try_recv().unwrap() {
                Event::GalleryAdded { path } => assert_eq!(path, "/g/a"),
                other => panic!("unexpected event: {:?}", other),
            }
            match rx.try_recv().unwrap() {
                Event::GalleryRemoved { path } => assert_eq!(path, "/g/a"),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn dead_subscribers_are_dropped() {
        let bus = EventBus::new();
        drop(bus.subscribe());
        bus.publish(Event::error("nobody listening"));
        // A second publish still succeeds with no live subscribers.
        bus.publish(Event::error("still fine"));
    }

    #[test]
    fn progress_percent_is_derived() {
        match Event::progress_updated("/g/a", 3, 10, "c.jpg") {
            Event::ProgressUpdated { percent, .. } => assert_eq!(percent, 30),
            other => panic!("unexpected event: {:?}", other),
        }
        match Event::progress_updated("/g/a", 0, 0, "") {
            Event::ProgressUpdated { percent, .. } => assert_eq!(percent, 0),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn events_serialize_with_message_tags() {
        let json = serde_json::to_string(&Event::gallery_started("/g/a", 3)).unwrap();
        assert!(json.contains("\"message\":\"gallery_started\""));
    }
}
