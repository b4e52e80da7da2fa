//! Virtual PMUs for load testing a receiver.
//!
//! Each virtual PMU holds one connection open and sends a 120-second data
//! file every `interval`, waiting for the acknowledgment before sending the
//! next. On a lost connection it reconnects and carries on with the same
//! `send_id`. An ack that does not echo the `send_id` (including the failure
//! sentinel) makes it resend the same file.
//!
//! ## Payload layout
//!
//! A file is 120 consecutive one-second blocks of [`BLOCK_LEN`] bytes,
//! little-endian:
//!
//! ```text
//! offset  size  field
//!      0     4  f32 sample interval (ms)
//!      4    24  i32[6] timestamp: year, month, day, hour, minute, second
//!     28   480  i32[120] lock state
//!    508  5760  6 channels x 120 x (f32 angle, f32 magnitude)
//!   6268    16  PLL stats
//!   6284    28  GPS stats
//! ```
//!
//! Only the timestamp, sample interval and the first channel's magnitude
//! (one sine period per second) are filled in.

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use chrono::{Datelike, TimeZone, Timelike, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::protocol::{ack_send_id, encode_frame, ACK_LEN};

/// Bytes in one second of PMU output.
pub const BLOCK_LEN: usize = 6312;
const SAMPLES_PER_SECOND: usize = 120;
const SECONDS_PER_FILE: i64 = 120;

const TIMESTAMP_OFFSET: usize = 4;
const CHANNEL_OFFSET: usize = 508;
const SAMPLE_LEN: usize = 8;

const STATS_INTERVAL: Duration = Duration::from_secs(10);
const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Receiver address, `host:port`.
    pub target: String,
    /// Number of virtual PMUs.
    pub devices: u32,
    /// Serial of the first PMU; the rest count up from it (`P<n>`).
    pub first_serial: u32,
    /// Pause between files of one PMU.
    pub interval: Duration,
    /// Payload size; the generated file is truncated or zero-padded to fit.
    pub payload_len: usize,
    /// Stop each PMU after this many acknowledged files. `None` runs forever.
    pub max_files: Option<u32>,
}

/// Run every virtual PMU until each has sent `max_files` files.
pub async fn run(config: SimulatorConfig) {
    let config = Arc::new(config);
    let sent = Arc::new(AtomicU64::new(0));
    let stats = tokio::spawn(report_stats(Arc::clone(&sent)));

    let pmus: Vec<_> = (0..config.devices)
        .map(|i| {
            let serial = format!("P{}", config.first_serial.wrapping_add(i));
            tokio::spawn(simulate_pmu(Arc::clone(&config), serial, Arc::clone(&sent)))
        })
        .collect();
    for pmu in pmus {
        if let Err(e) = pmu.await {
            warn!("Virtual PMU task failed: {e}");
        }
    }

    stats.abort();
    info!(
        "Simulation finished: {} files acknowledged",
        sent.load(Ordering::Relaxed)
    );
}

async fn report_stats(sent: Arc<AtomicU64>) {
    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;
    let mut last = 0;
    loop {
        ticker.tick().await;
        let total = sent.load(Ordering::Relaxed);
        info!(
            "Sent {total} files ({} in the last {}s)",
            total - last,
            STATS_INTERVAL.as_secs()
        );
        last = total;
    }
}

struct VirtualPmu {
    serial: String,
    send_id: u32,
    /// Start of the next file, whole seconds since the epoch.
    start_secs: i64,
}

async fn simulate_pmu(config: Arc<SimulatorConfig>, serial: String, sent: Arc<AtomicU64>) {
    // Spread the PMUs out over one interval.
    let jitter = config.interval.mul_f64(rand::random::<f64>());
    tokio::time::sleep(jitter).await;

    let mut pmu = VirtualPmu {
        serial,
        send_id: 0,
        start_secs: Utc::now().timestamp(),
    };
    let reconnect_delay = config.interval.max(MIN_RECONNECT_DELAY);

    while !pmu.finished(&config) {
        info!("Connecting virtual PMU {} to {}", pmu.serial, config.target);
        let mut stream = match TcpStream::connect(&config.target).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Could not connect to receiver: {e}");
                tokio::time::sleep(reconnect_delay).await;
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Could not set TCP_NODELAY: {e}");
        }
        if let Err(e) = pmu.send_files(&mut stream, &config, &sent).await {
            warn!("Virtual PMU {} lost its connection: {e}", pmu.serial);
            tokio::time::sleep(reconnect_delay).await;
        }
    }
}

impl VirtualPmu {
    fn finished(&self, config: &SimulatorConfig) -> bool {
        config.max_files.is_some_and(|max| self.send_id >= max)
    }

    async fn send_files(
        &mut self,
        stream: &mut TcpStream,
        config: &SimulatorConfig,
        sent: &AtomicU64,
    ) -> std::io::Result<()> {
        while !self.finished(config) {
            let data = generate_payload(self.start_secs, config.payload_len);
            let path = format!("/simulation/file{}.dat", self.send_id);
            stream
                .write_all(&encode_frame(self.send_id, &path, &self.serial, &data))
                .await?;

            let mut ack = [0u8; ACK_LEN];
            stream.read_exact(&mut ack).await?;
            let got = ack_send_id(&ack);
            if got == self.send_id {
                self.send_id = self.send_id.wrapping_add(1);
                self.start_secs += SECONDS_PER_FILE;
                sent.fetch_add(1, Ordering::Relaxed);
            } else {
                warn!(
                    "Received improper confirmation of receipt: got {got}, expected {}",
                    self.send_id
                );
            }

            if !config.interval.is_zero() {
                tokio::time::sleep(config.interval).await;
            }
        }
        Ok(())
    }
}

/// Build a data file covering `start_secs .. start_secs + 120`, sized to `len`.
pub fn generate_payload(start_secs: i64, len: usize) -> Vec<u8> {
    let mut payload = vec![0u8; BLOCK_LEN * SAMPLES_PER_SECOND];
    for (second, block) in (0..SECONDS_PER_FILE).zip(payload.chunks_exact_mut(BLOCK_LEN)) {
        fill_second(block, start_secs + second);
    }
    payload.resize(len, 0);
    payload
}

#[allow(clippy::cast_possible_wrap, clippy::cast_precision_loss)]
fn fill_second(block: &mut [u8], secs: i64) {
    LittleEndian::write_f32(&mut block[..4], 1000.0 / SAMPLES_PER_SECOND as f32);

    if let Some(t) = Utc.timestamp_opt(secs, 0).single() {
        let fields = [
            t.year(),
            t.month() as i32,
            t.day() as i32,
            t.hour() as i32,
            t.minute() as i32,
            t.second() as i32,
        ];
        LittleEndian::write_i32_into(&fields, &mut block[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 24]);
    }

    for i in 0..SAMPLES_PER_SECOND {
        let magnitude = (i as f32 * TAU / SAMPLES_PER_SECOND as f32).sin();
        let at = CHANNEL_OFFSET + i * SAMPLE_LEN + 4;
        LittleEndian::write_f32(&mut block[at..at + 4], magnitude);
    }
}
