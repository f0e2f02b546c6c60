//! The scan worker: enumerates gallery folders, estimates average image
//! dimensions from a sampled subset, and reports results back to the queue
//! manager. Runs on its own thread and never blocks callers of `add_item`.

use std::path::Path;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};
use log::*;
use walkdir::WalkDir;

use crate::ix::agent::config::constants as c;
use crate::ix::agent::config::{AverageMethod, SamplingMethod, ScanSettings};
use crate::ix::agent::queue::{Error, QueueManager, Result, ScanRequest};
use crate::ix::agent::types::{ServiceHandle, ServiceId, ShutdownFlag};
use crate::ix::util::path::lower_extension;

/// What a finished scan reports to the queue manager.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanOutcome {
    pub total_images: i64,
    pub total_size: i64,
    pub avg_width: i64,
    pub avg_height: i64,
    /// Basenames of every recognized image, sorted.
    pub files: Vec<String>,
}

pub struct Scanner;

impl Scanner {
    /// Spawns the scan worker draining the given request channel.
    pub fn spawn(
        queue: Arc<QueueManager>,
        rx: Receiver<ScanRequest>,
        settings: ScanSettings,
    ) -> ServiceHandle {
        let shutdown = ShutdownFlag::new();
        let flag = shutdown.clone();
        let thread = thread::Builder::new()
            .name("scanner".into())
            .spawn(move || run(queue, rx, settings, flag))
            .expect("couldn't spawn the scanner thread");
        ServiceHandle::new(ServiceId("Scanner"), shutdown, thread)
    }
}

fn run(
    queue: Arc<QueueManager>,
    rx: Receiver<ScanRequest>,
    settings: ScanSettings,
    shutdown: ShutdownFlag,
) {
    crate::ix::agent::types::register_service_logging();
    let exclude = match build_exclude_set(&settings.exclude_patterns) {
        Ok(set) => set,
        Err(e) => {
            warn!("scanner: bad exclude patterns, ignoring them: {}", e);
            None
        }
    };

    loop {
        if shutdown.is_triggered() {
            return;
        }
        let request = match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(request) => request,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };

        // Duplicate requests for the same path may be queued; scanning is
        // idempotent, so each is simply processed in turn.
        if !queue.mark_scanning(&request.path) {
            continue;
        }
        debug!(
            "scanner: scanning {} (additive: {})",
            request.path, request.additive
        );
        match scan_folder(Path::new(&request.path), &settings, exclude.as_ref()) {
            Ok(outcome) => queue.apply_scan_result(&request.path, &outcome),
            Err(e) => queue.mark_scan_failed(&request.path, &e.to_string()),
        }
    }
}

fn build_exclude_set(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(Some(builder.build()?))
}

/// Scans one gallery folder: root-only enumeration of recognized image
/// files, total size, and an average-dimension estimate from a bounded
/// sample of image headers.
pub fn scan_folder(
    folder: &Path,
    settings: &ScanSettings,
    exclude: Option<&GlobSet>,
) -> Result<ScanOutcome> {
    let mut files: Vec<(String, u64)> = vec![];
    for entry in WalkDir::new(folder).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| Error::scan_invalid(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let recognized = lower_extension(entry.path())
            .map(|ext| c::IMAGE_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false);
        if !recognized {
            continue;
        }
        let name = match entry.file_name().to_str() {
            Some(name) => name.to_string(),
            None => continue,
        };
        let size = entry
            .metadata()
            .map_err(|e| Error::scan_invalid(e.to_string()))?
            .len();
        files.push((name, size));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));

    if files.is_empty() {
        return Err(Error::scan_invalid("no image files found in folder"));
    }

    let total_images = files.len() as i64;
    let total_size: i64 = files.iter().map(|(_, size)| *size as i64).sum();

    let sample_indices = select_samples(&files, settings, exclude);
    let mut dimensions: Vec<(u64, u64)> = vec![];
    for index in sample_indices {
        let path = folder.join(&files[index].0);
        match image::image_dimensions(&path) {
            Ok((w, h)) => dimensions.push((u64::from(w), u64::from(h))),
            Err(e) => debug!("scanner: unreadable image header {:?}: {}", path, e),
        }
    }
    if dimensions.is_empty() {
        return Err(Error::scan_invalid("no readable image headers in folder"));
    }

    if settings.exclude_outliers && dimensions.len() >= 3 {
        dimensions = drop_outliers(dimensions);
    }

    let (avg_width, avg_height) = match settings.average_method {
        AverageMethod::Mean => {
            let n = dimensions.len() as u64;
            (
                (dimensions.iter().map(|(w, _)| w).sum::<u64>() / n) as i64,
                (dimensions.iter().map(|(_, h)| h).sum::<u64>() / n) as i64,
            )
        }
        AverageMethod::Median => (
            median(dimensions.iter().map(|(w, _)| *w).collect()) as i64,
            median(dimensions.iter().map(|(_, h)| *h).collect()) as i64,
        ),
    };

    Ok(ScanOutcome {
        total_images,
        total_size,
        avg_width,
        avg_height,
        files: files.into_iter().map(|(name, _)| name).collect(),
    })
}

/// Picks the indices of the files whose headers will be decoded. The
/// exclusion rules trim the candidate list; if they trim everything, the
/// full list is used instead.
fn select_samples(
    files: &[(String, u64)],
    settings: &ScanSettings,
    exclude: Option<&GlobSet>,
) -> Vec<usize> {
    let mut candidates: Vec<usize> = (0..files.len()).collect();

    if settings.exclude_first && candidates.len() > 1 {
        candidates.remove(0);
    }
    if settings.exclude_last && candidates.len() > 1 {
        candidates.pop();
    }
    if settings.exclude_small_images {
        let threshold = settings.exclude_small_threshold;
        let kept: Vec<usize> = candidates
            .iter()
            .cloned()
            .filter(|&i| files[i].1 >= threshold)
            .collect();
        if !kept.is_empty() {
            candidates = kept;
        }
    }
    if let Some(exclude) = exclude {
        let kept: Vec<usize> = candidates
            .iter()
            .cloned()
            .filter(|&i| !exclude.is_match(&files[i].0))
            .collect();
        if !kept.is_empty() {
            candidates = kept;
        }
    }
    if candidates.is_empty() {
        candidates = (0..files.len()).collect();
    }

    if !settings.fast_scanning {
        return candidates;
    }

    let wanted = match settings.sampling_method {
        SamplingMethod::FixedCount => settings.sampling_fixed_count,
        SamplingMethod::Percentage => {
            (candidates.len() * settings.sampling_percentage as usize) / 100
        }
    };
    let wanted = wanted.max(1).min(c::MAX_DIMENSION_SAMPLES).min(candidates.len());

    // Evenly spaced picks across the candidate list.
    (0..wanted)
        .map(|k| candidates[k * candidates.len() / wanted])
        .collect()
}

// Keeps samples whose area is within a factor of four of the median area.
fn drop_outliers(dimensions: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    let median_area = median(dimensions.iter().map(|(w, h)| w * h).collect());
    if median_area == 0 {
        return dimensions;
    }
    let kept: Vec<(u64, u64)> = dimensions
        .iter()
        .cloned()
        .filter(|(w, h)| {
            let area = w * h;
            area * 4 >= median_area && area <= median_area * 4
        })
        .collect();
    if kept.is_empty() {
        dimensions
    } else {
        kept
    }
}

fn median(mut values: Vec<u64>) -> u64 {
    values.sort();
    values[values.len() / 2]
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs::File;
    use std::io::Write as _;

    // A valid 1x1 RGBA PNG.
    const TINY_PNG: [u8; 67] = [
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
        0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
        0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x62, 0x00,
        0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
        0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
    ];

    fn settings() -> ScanSettings {
        let mut settings = ScanSettings::default();
        settings.exclude_small_images = false;
        settings
    }

    #[test]
    fn empty_folder_is_a_scan_failure() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_folder(dir.path(), &settings(), None).is_err());
    }

    #[test]
    fn folder_with_only_non_images_is_a_scan_failure() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("notes.txt"))
            .unwrap()
            .write_all(b"hello")
            .unwrap();
        File::create(dir.path().join("movie.mp4"))
            .unwrap()
            .write_all(b"xx")
            .unwrap();
        assert!(scan_folder(dir.path(), &settings(), None).is_err());
    }

    #[test]
    fn unreadable_headers_fail_the_scan() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("fake.jpg"))
            .unwrap()
            .write_all(b"not a jpeg at all")
            .unwrap();
        assert!(scan_folder(dir.path(), &settings(), None).is_err());
    }

    #[test]
    fn scan_counts_and_measures_images() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.png", "b.PNG", "c.png"].iter() {
            File::create(dir.path().join(name))
                .unwrap()
                .write_all(&TINY_PNG)
                .unwrap();
        }
        // Subfolders are not recursed into.
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        File::create(dir.path().join("nested").join("d.png"))
            .unwrap()
            .write_all(&TINY_PNG)
            .unwrap();
        // Non-images are ignored.
        File::create(dir.path().join("readme.txt"))
            .unwrap()
            .write_all(b"hi")
            .unwrap();

        let outcome = scan_folder(dir.path(), &settings(), None).unwrap();
        assert_eq!(outcome.total_images, 3);
        assert_eq!(outcome.total_size, 3 * TINY_PNG.len() as i64);
        assert_eq!(outcome.avg_width, 1);
        assert_eq!(outcome.avg_height, 1);
        assert_eq!(outcome.files, vec!["a.png", "b.PNG", "c.png"]);
    }

    #[test]
    fn select_samples_fixed_count_is_evenly_spaced() {
        let files: Vec<(String, u64)> = (0..10)
            .map(|i| (format!("{:02}.jpg", i), 100_000))
            .collect();
        let mut s = settings();
        s.sampling_method = SamplingMethod::FixedCount;
        s.sampling_fixed_count = 5;
        let picks = select_samples(&files, &s, None);
        assert_eq!(picks, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn select_samples_honors_exclusions() {
        let mut files: Vec<(String, u64)> = (0..6)
            .map(|i| (format!("{:02}.jpg", i), 100_000))
            .collect();
        files[2].1 = 10; // tiny thumbnail-sized file

        let mut s = settings();
        s.exclude_first = true;
        s.exclude_last = true;
        s.exclude_small_images = true;
        s.exclude_small_threshold = 1000;
        s.sampling_fixed_count = 10;
        let picks = select_samples(&files, &s, None);
        assert_eq!(picks, vec![1, 3, 4]);
    }

    #[test]
    fn select_samples_pattern_exclusion() {
        let files: Vec<(String, u64)> = vec![
            ("cover.jpg".to_string(), 100_000),
            ("p1.jpg".to_string(), 100_000),
            ("p2.jpg".to_string(), 100_000),
        ];
        let set = build_exclude_set(&["cover.*".to_string()]).unwrap().unwrap();
        let mut s = settings();
        s.sampling_fixed_count = 10;
        let picks = select_samples(&files, &s, Some(&set));
        assert_eq!(picks, vec![1, 2]);
    }

    #[test]
    fn select_samples_never_returns_empty() {
        let files: Vec<(String, u64)> = vec![("a.jpg".to_string(), 1)];
        let mut s = settings();
        s.exclude_small_images = true;
        s.exclude_small_threshold = 1000;
        let picks = select_samples(&files, &s, None);
        assert_eq!(picks, vec![0]);
    }

    #[test]
    fn outliers_are_dropped_around_the_median() {
        let dims = vec![(800, 600), (810, 610), (8000, 6000), (790, 590)];
        let kept = drop_outliers(dims);
        assert_eq!(kept.len(), 3);
        assert!(!kept.contains(&(8000, 6000)));
    }
}
