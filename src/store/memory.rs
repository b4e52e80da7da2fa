//! In-memory backend.
//!
//! Keeps every record in a `Vec` and tracks how many operations are in flight
//! at once, which makes it the backend of choice for exercising the admission
//! gate. Optional artificial latency and injected failures simulate a slow or
//! flaky database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{Record, Session, Store, StoreError};

/// An owned copy of a persisted [`Record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub file_path: String,
    pub data: Vec<u8>,
    pub published: bool,
    pub time_received: DateTime<Utc>,
    pub serial_number: String,
}

#[derive(Default)]
struct Inner {
    records: Mutex<Vec<StoredRecord>>,
    latest: Mutex<HashMap<String, DateTime<Utc>>>,
    latency: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    pending_failures: AtomicUsize,
    refreshes: AtomicUsize,
}

/// Cloneable handle; all clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every operation sleeps for `latency` first.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                latency,
                ..Inner::default()
            }),
        }
    }

    /// Make the next `n` operations (insert or upsert) fail.
    pub fn fail_next(&self, n: usize) {
        self.inner.pending_failures.store(n, Ordering::SeqCst);
    }

    /// Snapshot of all persisted records, in insertion order.
    pub fn records(&self) -> Vec<StoredRecord> {
        self.inner
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn latest_contact(&self, serial_number: &str) -> Option<DateTime<Utc>> {
        self.inner
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(serial_number)
            .copied()
    }

    /// Highest number of operations that were ever running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Number of session refreshes performed so far.
    pub fn refreshes(&self) -> usize {
        self.inner.refreshes.load(Ordering::SeqCst)
    }
}

impl Store for MemoryStore {
    type Session = MemorySession;

    fn open_session(&self) -> Result<MemorySession, StoreError> {
        Ok(MemorySession {
            inner: Arc::clone(&self.inner),
        })
    }
}

pub struct MemorySession {
    inner: Arc<Inner>,
}

/// Counts an operation as in flight until dropped.
struct InFlight<'a>(&'a Inner);

impl<'a> InFlight<'a> {
    fn enter(inner: &'a Inner) -> Self {
        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Inner {
    async fn simulate(&self) -> Result<(), StoreError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

impl Session for MemorySession {
    async fn insert(&mut self, record: &Record<'_>) -> Result<(), StoreError> {
        let _op = InFlight::enter(&self.inner);
        self.inner.simulate().await?;
        self.inner
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(StoredRecord {
                file_path: record.file_path.to_string(),
                data: record.data.to_vec(),
                published: record.published,
                time_received: record.time_received,
                serial_number: record.serial_number.to_string(),
            });
        Ok(())
    }

    async fn upsert_latest_contact(
        &mut self,
        serial_number: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let _op = InFlight::enter(&self.inner);
        self.inner.simulate().await?;
        self.inner
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(serial_number.to_string(), at);
        Ok(())
    }

    fn refresh(&mut self) {
        self.inner.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}
