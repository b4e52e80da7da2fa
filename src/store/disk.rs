//! Filesystem backend.
//!
//! Layout under the data directory:
//!
//! ```text
//! received_files/<uuid>.dat   raw payload of each frame
//! received_files.jsonl        one metadata line per record (append-only)
//! latest_times.json           serial number -> most recent time_received
//! ```
//!
//! Each session keeps its own append handle on the index; a refresh closes it
//! and the next insert reopens it. `latest_times.json` is shared by all
//! sessions and always replaced atomically (temp file, then rename). The whole
//! map is rewritten under a store-wide lock, so latest-contact upserts run one
//! at a time whatever the pool size; only inserts proceed in parallel.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Record, Session, Store, StoreError};

const PAYLOAD_DIR: &str = "received_files";
const INDEX_FILE: &str = "received_files.jsonl";
const LATEST_FILE: &str = "latest_times.json";

/// One line of `received_files.jsonl`.
#[derive(Debug, Serialize)]
struct IndexEntry<'a> {
    id: String,
    name: &'a str,
    serial_number: &'a str,
    published: bool,
    time_received: DateTime<Utc>,
    len: usize,
}

struct Shared {
    root: PathBuf,
    fsync: bool,
    latest: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Shared {
    fn payload_path(&self, id: &Uuid) -> PathBuf {
        self.root.join(PAYLOAD_DIR).join(format!("{id}.dat"))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn latest_path(&self) -> PathBuf {
        self.root.join(LATEST_FILE)
    }
}

/// Disk-backed store rooted at a data directory.
#[derive(Clone)]
pub struct DiskStore {
    shared: Arc<Shared>,
}

impl DiskStore {
    /// Prepare the directory layout and load existing latest-contact times.
    ///
    /// With `fsync` set, payloads and index lines are synced to disk before
    /// an insert reports success.
    pub async fn open(root: &Path, fsync: bool) -> Result<Self, StoreError> {
        fs::create_dir_all(root.join(PAYLOAD_DIR))
            .await
            .map_err(StoreError::io("create data directory"))?;

        let latest_path = root.join(LATEST_FILE);
        let latest = match fs::read(&latest_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(StoreError::io("read latest_times")(e)),
        };
        info!(
            "Disk store ready at {} ({} known devices)",
            root.display(),
            latest.len()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                root: root.to_path_buf(),
                fsync,
                latest: Mutex::new(latest),
            }),
        })
    }

    pub async fn latest_contact(&self, serial_number: &str) -> Option<DateTime<Utc>> {
        self.shared.latest.lock().await.get(serial_number).copied()
    }
}

impl Store for DiskStore {
    type Session = DiskSession;

    fn open_session(&self) -> Result<DiskSession, StoreError> {
        Ok(DiskSession {
            shared: Arc::clone(&self.shared),
            index: None,
        })
    }
}

pub struct DiskSession {
    shared: Arc<Shared>,
    index: Option<fs::File>,
}

impl DiskSession {
    async fn index_file(&mut self) -> Result<&mut fs::File, StoreError> {
        let file = match self.index.take() {
            Some(file) => file,
            None => fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.shared.index_path())
                .await
                .map_err(StoreError::io("open received_files index"))?,
        };
        Ok(self.index.insert(file))
    }

    async fn append_index(&mut self, line: &[u8]) -> Result<(), StoreError> {
        let fsync = self.shared.fsync;
        let index = self.index_file().await?;
        index
            .write_all(line)
            .await
            .map_err(StoreError::io("append received_files index"))?;
        index
            .flush()
            .await
            .map_err(StoreError::io("flush received_files index"))?;
        if fsync {
            index
                .sync_data()
                .await
                .map_err(StoreError::io("sync received_files index"))?;
        }
        Ok(())
    }
}

async fn write_payload(path: &Path, data: &[u8], fsync: bool) -> Result<(), StoreError> {
    let mut file = fs::File::create(path)
        .await
        .map_err(StoreError::io("create payload file"))?;
    file.write_all(data)
        .await
        .map_err(StoreError::io("write payload file"))?;
    file.flush()
        .await
        .map_err(StoreError::io("flush payload file"))?;
    if fsync {
        file.sync_all()
            .await
            .map_err(StoreError::io("sync payload file"))?;
    }
    Ok(())
}

impl Session for DiskSession {
    async fn insert(&mut self, record: &Record<'_>) -> Result<(), StoreError> {
        let id = Uuid::new_v4();
        let payload_path = self.shared.payload_path(&id);
        write_payload(&payload_path, record.data, self.shared.fsync).await?;

        let entry = IndexEntry {
            id: id.to_string(),
            name: record.file_path,
            serial_number: record.serial_number,
            published: record.published,
            time_received: record.time_received,
            len: record.data.len(),
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        if let Err(e) = self.append_index(&line).await {
            // Without an index line the payload is unreachable.
            if let Err(rm) = fs::remove_file(&payload_path).await {
                warn!("Could not remove orphaned payload {}: {rm}", payload_path.display());
            }
            return Err(e);
        }
        Ok(())
    }

    async fn upsert_latest_contact(
        &mut self,
        serial_number: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut latest = self.shared.latest.lock().await;
        latest.insert(serial_number.to_string(), at);
        let json = serde_json::to_vec_pretty(&*latest)?;

        // Written under the lock, so a fixed temp name is safe.
        let path = self.shared.latest_path();
        let temp_path = self.shared.root.join(format!(".{LATEST_FILE}.tmp"));
        let mut temp = fs::File::create(&temp_path)
            .await
            .map_err(StoreError::io("create latest_times"))?;
        temp.write_all(&json)
            .await
            .map_err(StoreError::io("write latest_times"))?;
        temp.flush()
            .await
            .map_err(StoreError::io("flush latest_times"))?;
        if self.shared.fsync {
            temp.sync_all()
                .await
                .map_err(StoreError::io("sync latest_times"))?;
        }
        drop(temp);
        fs::rename(&temp_path, &path)
            .await
            .map_err(StoreError::io("replace latest_times"))?;
        Ok(())
    }

    fn refresh(&mut self) {
        self.index = None;
    }
}
