//! The bandwidth aggregator.
//!
//! Every upload source (the primary-host engine, each file-host worker)
//! reports instantaneous kB/s readings here. Per source, readings pass
//! through a short rolling-window average and then an asymmetric EMA: fast
//! attack so a starting transfer registers quickly, slow release so the
//! spikes at the end of each image don't whip the displayed rate around.
//! The published rate is the sum of the per-source smoothed values.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::*;

use crate::ix::agent::config::constants as c;
use crate::ix::agent::database::Database;
use crate::ix::agent::messages::{Event, EventBus};
use crate::ix::agent::types::{ServiceHandle, ServiceId, ShutdownFlag};
use crate::ix::util::temporal;

/// Durable stat keys for the all-time peak.
pub const PEAK_KEY: &str = "fastest_kbps";
pub const PEAK_TIMESTAMP_KEY: &str = "fastest_kbps_timestamp";

enum Message {
    Sample { source: String, kbps: f64 },
    ResetPeak,
}

/// Per-source smoothing state: a bounded sample window feeding the EMA.
struct SourceState {
    window: VecDeque<f64>,
    smoothed: f64,
}

impl SourceState {
    fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(c::BANDWIDTH_WINDOW_SAMPLES),
            smoothed: 0.0,
        }
    }

    /// Feeds one instantaneous reading, returning the new smoothed value.
    fn observe(&mut self, kbps: f64) -> f64 {
        if self.window.len() == c::BANDWIDTH_WINDOW_SAMPLES {
            self.window.pop_front();
        }
        self.window.push_back(kbps);
        let window_avg: f64 = self.window.iter().sum::<f64>() / self.window.len() as f64;

        let alpha = if window_avg > self.smoothed {
            c::BANDWIDTH_ATTACK_ALPHA
        } else {
            c::BANDWIDTH_RELEASE_ALPHA
        };
        self.smoothed = alpha * window_avg + (1.0 - alpha) * self.smoothed;
        self.smoothed
    }
}

#[derive(Default)]
struct Shared {
    aggregate: f64,
    per_source: HashMap<String, f64>,
    peak: f64,
    peak_timestamp: String,
}

/// Handle shared with every sampler. `record_sample` is safe from any
/// thread; smoothing and subscriber dispatch happen on the aggregator's own
/// worker thread.
pub struct BandwidthAggregator {
    tx: Sender<Message>,
    shared: Arc<Mutex<Shared>>,
}

impl BandwidthAggregator {
    /// Spawns the aggregator worker, restoring the persisted peak.
    pub fn spawn(db: Database, events: EventBus) -> (Arc<BandwidthAggregator>, ServiceHandle) {
        let peak = db.get_stat_f64(PEAK_KEY).unwrap_or(0.0);
        let peak_timestamp = db
            .get_stat(PEAK_TIMESTAMP_KEY)
            .ok()
            .and_then(|v| v)
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Mutex::new(Shared {
            peak,
            peak_timestamp,
            ..Default::default()
        }));

        let shutdown = ShutdownFlag::new();
        let flag = shutdown.clone();
        let worker_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("bandwidth".into())
            .spawn(move || run(db, events, rx, worker_shared, flag))
            .expect("couldn't spawn the bandwidth aggregator thread");

        (
            Arc::new(BandwidthAggregator { tx, shared }),
            ServiceHandle::new(ServiceId("Bandwidth"), shutdown, thread),
        )
    }

    /// Reports one instantaneous reading for a source. Never blocks.
    pub fn record_sample(&self, source: &str, kbps: f64) {
        if !kbps.is_finite() || kbps < 0.0 {
            return;
        }
        let _ = self.tx.send(Message::Sample {
            source: source.to_string(),
            kbps,
        });
    }

    /// The current smoothed aggregate in kB/s.
    pub fn get_current(&self) -> f64 {
        self.shared.lock().expect("bandwidth lock poisoned").aggregate
    }

    /// Current smoothed rate per source.
    pub fn get_per_source(&self) -> HashMap<String, f64> {
        self.shared
            .lock()
            .expect("bandwidth lock poisoned")
            .per_source
            .clone()
    }

    /// The persisted all-time peak and when it was set.
    pub fn get_peak(&self) -> (f64, String) {
        let shared = self.shared.lock().expect("bandwidth lock poisoned");
        (shared.peak, shared.peak_timestamp.clone())
    }

    /// Clears the persisted peak.
    pub fn reset_peak(&self) {
        let _ = self.tx.send(Message::ResetPeak);
    }
}

fn run(
    db: Database,
    events: EventBus,
    rx: Receiver<Message>,
    shared: Arc<Mutex<Shared>>,
    shutdown: ShutdownFlag,
) {
    crate::ix::agent::types::register_service_logging();
    let mut sources: HashMap<String, SourceState> = HashMap::new();
    let mut last_publish = Instant::now() - Duration::from_secs(1);

    loop {
        if shutdown.is_triggered() {
            return;
        }
        let message = match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };

        match message {
            Message::ResetPeak => {
                {
                    let mut shared = shared.lock().expect("bandwidth lock poisoned");
                    shared.peak = 0.0;
                    shared.peak_timestamp.clear();
                }
                if let Err(e) = db.set_stat(PEAK_KEY, "0") {
                    warn!("bandwidth: couldn't reset peak stat: {}", e);
                }
                let _ = db.set_stat(PEAK_TIMESTAMP_KEY, "");
            }
            Message::Sample { source, kbps } => {
                let smoothed = sources
                    .entry(source.clone())
                    .or_insert_with(SourceState::new)
                    .observe(kbps);

                let (aggregate, per_source, new_peak) = {
                    let mut shared = shared.lock().expect("bandwidth lock poisoned");
                    shared.per_source.insert(source, smoothed);
                    let aggregate: f64 = shared.per_source.values().sum();
                    shared.aggregate = aggregate;

                    let new_peak = if aggregate > shared.peak
                        && aggregate < c::BANDWIDTH_PEAK_CEILING_KBPS
                    {
                        let timestamp = temporal::iso_now();
                        shared.peak = aggregate;
                        shared.peak_timestamp = timestamp.clone();
                        Some((aggregate, timestamp))
                    } else {
                        None
                    };
                    (aggregate, shared.per_source.clone(), new_peak)
                };

                if let Some((kbps, timestamp)) = new_peak {
                    if let Err(e) = db.set_stat(PEAK_KEY, &kbps.to_string()) {
                        warn!("bandwidth: couldn't persist peak: {}", e);
                    } else {
                        let _ = db.set_stat(PEAK_TIMESTAMP_KEY, &timestamp);
                    }
                    events.publish(Event::PeakUpdated { kbps, timestamp });
                }

                if last_publish.elapsed()
                    >= Duration::from_millis(c::BANDWIDTH_PUBLISH_MIN_INTERVAL_MS)
                {
                    events.publish(Event::BandwidthUpdated {
                        aggregate_kbps: aggregate,
                        per_source,
                    });
                    last_publish = Instant::now();
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ix::util;

    #[test]
    fn attack_is_faster_than_release() {
        let mut state = SourceState::new();
        let rising = state.observe(1000.0);
        assert!((rising - 300.0).abs() < 1e-9);

        // A falling reading releases slowly.
        let mut state = SourceState::new();
        state.smoothed = 1000.0;
        let falling = state.observe(0.0);
        assert!((falling - 950.0).abs() < 1e-9);
    }

    #[test]
    fn window_is_bounded() {
        let mut state = SourceState::new();
        for _ in 0..100 {
            state.observe(100.0);
        }
        assert_eq!(state.window.len(), c::BANDWIDTH_WINDOW_SAMPLES);
    }

    #[test]
    fn smoothed_converges_to_steady_input() {
        let mut state = SourceState::new();
        let mut last = 0.0;
        for _ in 0..200 {
            last = state.observe(500.0);
        }
        assert!((last - 500.0).abs() < 1.0);
    }

    fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition never became true");
    }

    #[test]
    fn peak_is_persisted_with_timestamp() {
        let db = util::database::temp().unwrap();
        let events = EventBus::new();
        let (aggregator, mut handle) = BandwidthAggregator::spawn(db.clone(), events);

        for kbps in [500.0, 600.0, 800.0, 700.0, 900.0].iter() {
            aggregator.record_sample("imx", *kbps);
        }
        wait_for(|| aggregator.get_current() > 100.0);

        let (peak, timestamp) = aggregator.get_peak();
        assert!(peak > 100.0);
        assert!(peak < c::BANDWIDTH_PEAK_CEILING_KBPS);
        assert!(!timestamp.is_empty());
        wait_for(|| db.get_stat_f64(PEAK_KEY).unwrap() > 100.0);
        assert!(!db
            .get_stat(PEAK_TIMESTAMP_KEY)
            .unwrap()
            .unwrap()
            .is_empty());

        handle.stop();
        handle.join();
    }

    #[test]
    fn absurd_readings_never_become_the_peak() {
        let db = util::database::temp().unwrap();
        let (aggregator, mut handle) = BandwidthAggregator::spawn(db, EventBus::new());

        aggregator.record_sample("imx", 500.0);
        wait_for(|| aggregator.get_current() > 0.0);
        let (peak_before, _) = aggregator.get_peak();

        // A reading far past the sanity ceiling moves the current rate but
        // never the record.
        for _ in 0..100 {
            aggregator.record_sample("imx", 100.0 * c::BANDWIDTH_PEAK_CEILING_KBPS);
        }
        wait_for(|| aggregator.get_current() > c::BANDWIDTH_PEAK_CEILING_KBPS);
        let (peak_after, _) = aggregator.get_peak();
        assert_eq!(peak_before, peak_after);
        assert!(peak_after < c::BANDWIDTH_PEAK_CEILING_KBPS);

        handle.stop();
        handle.join();
    }

    #[test]
    fn aggregate_sums_sources() {
        let db = util::database::temp().unwrap();
        let (aggregator, mut handle) = BandwidthAggregator::spawn(db, EventBus::new());

        for _ in 0..50 {
            aggregator.record_sample("imx", 300.0);
            aggregator.record_sample("rapidgator", 200.0);
        }
        wait_for(|| aggregator.get_current() > 450.0);
        let per_source = aggregator.get_per_source();
        assert_eq!(per_source.len(), 2);
        assert!(per_source["imx"] > per_source["rapidgator"]);

        handle.stop();
        handle.join();
    }
}
