#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

//! pmu-ingest library: the receiving side of the PMU file-transfer protocol.
//!
//! - `protocol` — wire constants, header validation, frame encoder
//! - `decoder` — incremental frame reassembly from arbitrary TCP chunks
//! - `gate` — bounded pool of persistence sessions (backpressure)
//! - `store` — persistence backends (`disk`, `memory`)
//! - `alias` — serial number to device label lookup
//! - `connection` — per-connection read/persist/ack loop
//! - `server` — TCP listener
//! - `simulator` — virtual PMUs for load testing
//! - `config` — configuration loading

pub mod alias;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod gate;
pub mod protocol;
pub mod server;
pub mod simulator;
pub mod store;

pub use alias::AliasTable;
pub use config::Config;
pub use decoder::{Frame, FrameDecoder};
pub use gate::AdmissionGate;
pub use server::ServerContext;
pub use store::{Record, Session, Store, StoreError};
