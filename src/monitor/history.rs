//! History log: queued, batched writes of device status records.

use crate::db::{ActivityReport, DbError, HistoryQuery, HistoryRecord, Store};

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const QUEUE_CAPACITY: usize = 1000;
const FLUSH_BATCH: usize = 500;
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

enum WriterMsg {
    Record(HistoryRecord),
    /// Drop uncommitted records for an address.
    Purge(String),
    Flush(oneshot::Sender<()>),
}

/// Append-only history of device statuses.
///
/// `append` never waits on the database: records go through a bounded queue
/// to a writer task that commits them in batches. While logging is disabled
/// `append` does nothing.
pub struct HistoryLog {
    store: Arc<Store>,
    enabled: AtomicBool,
    tx: mpsc::Sender<WriterMsg>,
}

impl HistoryLog {
    /// Create the log and spawn its writer task. Must be called within a runtime.
    pub fn new(store: Arc<Store>, enabled: bool) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(run_batch_writer(rx, store.clone()));

        Self {
            store,
            enabled: AtomicBool::new(enabled),
            tx,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            tracing::info!("History logging {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    /// Queue a record. Returns whether it was accepted.
    pub fn append(&self, record: HistoryRecord) -> bool {
        if !self.is_enabled() {
            return false;
        }

        match self.tx.try_send(WriterMsg::Record(record)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(WriterMsg::Record(r))) => {
                tracing::error!("History queue full, dropping record for {} ({})", r.label, r.address);
                false
            }
            Err(_) => {
                tracing::error!("History writer is gone, dropping record");
                false
            }
        }
    }

    /// Discard records for `address` that are queued but not yet committed.
    pub fn purge(&self, address: &str) {
        if self.tx.try_send(WriterMsg::Purge(address.to_string())).is_err() {
            tracing::error!("Failed to purge pending history for {}", address);
        }
    }

    /// Wait until everything queued so far has been written.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriterMsg::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn query(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>, DbError> {
        self.store.query_history(query)
    }

    pub fn report(&self, query: &HistoryQuery) -> Result<ActivityReport, DbError> {
        self.store.activity_report(query)
    }
}

/// Accumulate records and flush them on size, on a timer, or on request.
///
/// Queued messages are drained before a timed flush so a purge sent right
/// after a record still catches it.
async fn run_batch_writer(mut rx: mpsc::Receiver<WriterMsg>, store: Arc<Store>) {
    let mut buffer: Vec<HistoryRecord> = Vec::with_capacity(64);
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => {
                match msg {
                    Some(WriterMsg::Record(r)) => {
                        buffer.push(r);
                        if buffer.len() >= FLUSH_BATCH {
                            flush_buffer(&store, &mut buffer);
                        }
                    }
                    Some(WriterMsg::Purge(address)) => {
                        let before = buffer.len();
                        buffer.retain(|r| r.address != address);
                        if buffer.len() != before {
                            tracing::debug!("Dropped {} pending history records for {}", before - buffer.len(), address);
                        }
                    }
                    Some(WriterMsg::Flush(done)) => {
                        flush_buffer(&store, &mut buffer);
                        let _ = done.send(());
                    }
                    None => {
                        flush_buffer(&store, &mut buffer);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&store, &mut buffer);
            }
        }
    }
}

fn flush_buffer(store: &Store, buffer: &mut Vec<HistoryRecord>) {
    if buffer.is_empty() {
        return;
    }

    if let Err(e) = store.append_history(buffer) {
        tracing::error!("Failed to write {} history records: {}", buffer.len(), e);
    }

    buffer.clear();
}

/// Read the logging flag file. Missing or unrecognised content means off.
pub fn load_logging_flag<P: AsRef<Path>>(path: P) -> bool {
    match fs::read_to_string(path.as_ref()) {
        Ok(content) => match content.trim().to_ascii_lowercase().as_str() {
            "on" => true,
            "off" => false,
            other => {
                tracing::warn!("Unrecognised logging flag {:?} in {}, assuming off", other, path.as_ref().display());
                false
            }
        },
        Err(_) => false,
    }
}

pub fn save_logging_flag<P: AsRef<Path>>(path: P, enabled: bool) -> io::Result<()> {
    fs::write(path, if enabled { "on\n" } else { "off\n" })
}
