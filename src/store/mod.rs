//! Persistence backends for received frames.
//!
//! A [`Store`] hands out [`Session`]s; the admission gate owns a fixed number
//! of them and lends each to one connection at a time. A session persists a
//! [`Record`] and then bumps the device's latest-contact time. After a failed
//! operation the session is [`refresh`](Session::refresh)ed before anyone else
//! gets to use it.
//!
//! Backends:
//! - [`disk::DiskStore`] — payload files plus an append-only JSON-lines index
//! - [`memory::MemoryStore`] — in-process, for dry runs and tests

pub mod disk;
pub mod memory;

use std::future::Future;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A received file, as handed to the backend.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    pub file_path: &'a str,
    pub data: &'a [u8],
    /// Always `false` here; a downstream publisher flips it.
    pub published: bool,
    pub time_received: DateTime<Utc>,
    pub serial_number: &'a str,
}

impl<'a> Record<'a> {
    /// A fresh, unpublished record stamped with the current UTC time.
    pub fn received_now(file_path: &'a str, serial_number: &'a str, data: &'a [u8]) -> Self {
        Self {
            file_path,
            data,
            published: false,
            time_received: Utc::now(),
            serial_number,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("bad JSON: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Adapter for `map_err` on io results.
    pub(crate) fn io(op: &'static str) -> impl FnOnce(std::io::Error) -> Self {
        move |source| Self::Io { op, source }
    }
}

/// One handle to a persistence backend. Never used by two tasks at once.
pub trait Session: Send + 'static {
    /// Store a received file.
    fn insert(&mut self, record: &Record<'_>)
        -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Create or overwrite the latest-contact time for `serial_number`.
    fn upsert_latest_contact(
        &mut self,
        serial_number: &str,
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Drop and re-establish whatever the session holds open.
    fn refresh(&mut self);
}

/// A backend that can open sessions.
pub trait Store {
    type Session: Session;

    fn open_session(&self) -> Result<Self::Session, StoreError>;
}
