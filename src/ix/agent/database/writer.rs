//! The single background writer that serializes all durable writes.
//!
//! Workers hand full record snapshots to `save_async` and continue; the
//! writer dedups queued snapshots by path (latest wins) and commits one
//! transaction per batch. Failed batches stay queued and are retried on the
//! next tick, so a transient I/O error never corrupts in-memory state.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use log::*;

use super::{Database, GalleryRecord};

const WRITER_TICK: Duration = Duration::from_millis(500);

enum Command {
    Save(Vec<GalleryRecord>),
    Delete(Vec<String>),
    Flush(Sender<()>),
    Shutdown,
}

/// Handle to the store-writer thread. Cloning shares the same writer.
#[derive(Clone)]
pub struct StoreWriter {
    tx: Sender<Command>,
}

impl StoreWriter {
    /// Spawns the writer thread, returning the shared handle and the join
    /// handle for shutdown.
    pub fn spawn(db: Database) -> (StoreWriter, thread::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("store-writer".into())
            .spawn(move || run(db, rx))
            .expect("couldn't spawn the store writer thread");
        (StoreWriter { tx }, handle)
    }

    /// Queues record snapshots for persistence and returns immediately.
    pub fn save_async(&self, records: Vec<GalleryRecord>) {
        if records.is_empty() {
            return;
        }
        let _ = self.tx.send(Command::Save(records));
    }

    /// Queues path deletions and returns immediately.
    pub fn delete_async(&self, paths: Vec<String>) {
        if paths.is_empty() {
            return;
        }
        let _ = self.tx.send(Command::Delete(paths));
    }

    /// Blocks until everything queued so far has been attempted once.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.tx.send(Command::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Flushes and stops the writer thread.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

fn run(db: Database, rx: Receiver<Command>) {
    crate::ix::agent::types::register_service_logging();
    let mut pending: HashMap<String, GalleryRecord> = HashMap::new();
    let mut deletes: Vec<String> = vec![];

    loop {
        let command = match rx.recv_timeout(WRITER_TICK) {
            Ok(command) => Some(command),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                attempt_flush(&db, &mut pending, &mut deletes);
                return;
            }
        };

        let mut ack: Option<Sender<()>> = None;
        let mut shutdown = false;
        let mut absorb = |command: Command,
                          pending: &mut HashMap<String, GalleryRecord>,
                          deletes: &mut Vec<String>| match command {
            Command::Save(records) => {
                for record in records {
                    pending.insert(record.path.clone(), record);
                }
            }
            Command::Delete(paths) => {
                for path in paths {
                    pending.remove(&path);
                    deletes.push(path);
                }
            }
            Command::Flush(tx) => ack = Some(tx),
            Command::Shutdown => shutdown = true,
        };

        if let Some(command) = command {
            absorb(command, &mut pending, &mut deletes);
        }
        // Drain whatever else is already queued so one transaction covers it.
        while let Ok(command) = rx.try_recv() {
            absorb(command, &mut pending, &mut deletes);
        }
        drop(absorb);

        attempt_flush(&db, &mut pending, &mut deletes);

        if let Some(ack) = ack {
            let _ = ack.send(());
        }
        if shutdown {
            return;
        }
    }
}

fn attempt_flush(
    db: &Database,
    pending: &mut HashMap<String, GalleryRecord>,
    deletes: &mut Vec<String>,
) {
    if !deletes.is_empty() {
        match db.delete_by_paths(deletes) {
            Ok(_) => deletes.clear(),
            Err(e) => warn!("store-writer: delete failed, will retry: {}", e),
        }
    }
    if !pending.is_empty() {
        let batch: Vec<GalleryRecord> = pending.values().cloned().collect();
        match db.bulk_upsert(&batch) {
            Ok(written) => {
                debug!("store-writer: persisted {} record(s)", written);
                pending.clear();
            }
            Err(e) => warn!("store-writer: batch write failed, will retry: {}", e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ix::agent::database::GalleryStatus;
    use crate::ix::util;

    #[test]
    fn async_saves_are_deduplicated_by_path() {
        let db = util::database::temp().unwrap();
        let (writer, handle) = StoreWriter::spawn(db.clone());

        let mut record = GalleryRecord::new("/g/a", "a");
        record.name = "first".into();
        writer.save_async(vec![record.clone()]);
        record.name = "second".into();
        writer.save_async(vec![record.clone()]);
        writer.flush();

        let loaded = db.load_all_items().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "second");

        writer.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn delete_supersedes_queued_save() {
        let db = util::database::temp().unwrap();
        let mut seeded = GalleryRecord::new("/g/a", "a");
        db.insert_item(&mut seeded).unwrap();

        let (writer, handle) = StoreWriter::spawn(db.clone());
        writer.save_async(vec![seeded.clone()]);
        writer.delete_async(vec!["/g/a".to_string()]);
        writer.flush();

        assert!(db.load_all_items().unwrap().is_empty());
        writer.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn flush_makes_writes_visible() {
        let db = util::database::temp().unwrap();
        let (writer, handle) = StoreWriter::spawn(db.clone());

        let mut record = GalleryRecord::new("/g/alpha", "alpha");
        record.status = GalleryStatus::Ready;
        writer.save_async(vec![record]);
        writer.flush();

        assert_eq!(db.load_all_items().unwrap().len(), 1);
        writer.shutdown();
        handle.join().unwrap();
    }
}
