//! Per-connection read/decode/persist/acknowledge loop.
//!
//! A connection is strictly sequential: bytes are read, fed to the
//! [`FrameDecoder`], and each completed frame is persisted and acknowledged
//! before the decoder sees any byte that follows it. Bytes of the next frame
//! that arrived in the same read are kept and decoded after the ack is sent.
//!
//! | Outcome                     | Reply                | Connection |
//! |-----------------------------|----------------------|------------|
//! | Frame persisted             | echoed `send_id`     | stays open |
//! | Persistence failed          | [`FAILURE_ACK`]      | stays open |
//! | Field length out of bounds  | none                 | closed     |
//! | Read/write error, EOF       | none                 | closed     |

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::decoder::{Frame, FrameDecoder};
use crate::gate::GateClosed;
use crate::protocol::{ack_send_id, DecodeError, ACK_LEN, FAILURE_ACK};
use crate::server::ServerContext;
use crate::store::{Record, Session, StoreError};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("connection closed in the middle of a frame")]
    TruncatedFrame,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("server is shutting down")]
    ShuttingDown(#[from] GateClosed),
}

/// Drive one connection until the peer disconnects or an error ends it.
///
/// Returns the number of frames acknowledged when the peer closes the
/// connection on a frame boundary.
pub async fn handle_connection<T, S>(
    mut stream: T,
    ctx: &ServerContext<S>,
) -> Result<u64, ConnectionError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: Session,
{
    let mut decoder = FrameDecoder::new(ctx.limits);
    let mut buf = vec![0u8; ctx.read_buffer_len];
    let mut acknowledged = 0u64;

    loop {
        let n = stream.read(&mut buf).await.map_err(ConnectionError::Read)?;
        if n == 0 {
            return if decoder.is_idle() {
                Ok(acknowledged)
            } else {
                Err(ConnectionError::TruncatedFrame)
            };
        }

        let mut offset = 0;
        while offset < n {
            let step = decoder.advance(&buf[offset..n])?;
            offset += step.consumed;
            let Some(frame) = step.frame else {
                continue;
            };
            if offset < n {
                warn!("Got {} extra bytes", n - offset);
            }

            let ack = process_frame(&frame, ctx).await?;
            stream
                .write_all(&ack)
                .await
                .map_err(ConnectionError::Write)?;
            acknowledged += 1;
        }
    }
}

/// Persist one frame and return the acknowledgment to send.
async fn process_frame<S: Session>(
    frame: &Frame<'_>,
    ctx: &ServerContext<S>,
) -> Result<[u8; ACK_LEN], GateClosed> {
    info!(
        "Received {}: serial number is {} ({}), length is {}",
        frame.file_path,
        frame.serial_number,
        ctx.aliases.label(frame.serial_number),
        frame.data.len()
    );
    if frame.send_id == FAILURE_ACK {
        debug!("send_id 0 cannot be told apart from a failure acknowledgment");
    }
    if frame.dedicated_buffer {
        debug!("Frame larger than the shared buffer, read into a dedicated one");
    }

    let record = Record::received_now(frame.file_path, frame.serial_number, frame.data);
    let mut lease = ctx.gate.acquire().await?;
    match persist(&mut *lease, &record).await {
        Ok(()) => Ok(frame.send_id),
        Err(_) => {
            warn!(
                "Replying with failure acknowledgment to send_id {}",
                ack_send_id(&frame.send_id)
            );
            lease.mark_failed();
            Ok(FAILURE_ACK)
        }
    }
}

async fn persist<S: Session>(session: &mut S, record: &Record<'_>) -> Result<(), StoreError> {
    if let Err(e) = session.insert(record).await {
        warn!("Could not insert file into received_files: {e}");
        return Err(e);
    }
    if let Err(e) = session
        .upsert_latest_contact(record.serial_number, record.time_received)
        .await
    {
        warn!("Could not update latest_times: {e}");
        return Err(e);
    }
    Ok(())
}

/// Run a connection to completion, logging how it ended.
pub async fn serve_connection<T, S>(stream: T, peer: SocketAddr, ctx: Arc<ServerContext<S>>)
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: Session,
{
    info!("Connected: {peer}");
    match handle_connection(stream, &ctx).await {
        Ok(frames) => info!("Connection closed: {peer} ({frames} frames)"),
        Err(ConnectionError::Decode(e)) => warn!("Dropping {peer}: {e}"),
        Err(e) => info!("Connection lost: {peer} (reason: {e})"),
    }
}
