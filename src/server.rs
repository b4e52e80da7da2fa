//! TCP listener: one task per accepted connection.
//!
//! Connections never wait on each other except through the admission gate.
//! When the shutdown future resolves the listener stops accepting and closes
//! the gate; connections that are mid-frame finish persisting what they hold
//! and stop at their next acquire.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info, info_span, warn, Instrument};

use crate::alias::AliasTable;
use crate::connection::serve_connection;
use crate::gate::AdmissionGate;
use crate::protocol::FrameLimits;
use crate::store::Session;

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Everything a connection handler needs, shared by all connections.
pub struct ServerContext<S> {
    pub aliases: AliasTable,
    pub gate: AdmissionGate<S>,
    pub limits: FrameLimits,
    /// Bytes requested from the socket per read.
    pub read_buffer_len: usize,
}

/// Accept connections until `shutdown` resolves.
pub async fn serve<S, F>(listener: TcpListener, ctx: Arc<ServerContext<S>>, shutdown: F)
where
    S: Session,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Could not set TCP_NODELAY for {peer}: {e}");
                    }
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(
                        serve_connection(stream, peer, ctx).instrument(info_span!("pmu", %peer)),
                    );
                }
                Err(e) => {
                    error!("Accept failed: {e}");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
        }
    }
    info!("Listener stopped");
    ctx.gate.close();
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::protocol::encode_frame;
    use crate::store::memory::{MemorySession, MemoryStore};

    async fn start(
        store: &MemoryStore,
        pool: usize,
    ) -> (
        SocketAddr,
        Arc<ServerContext<MemorySession>>,
        oneshot::Sender<()>,
        JoinHandle<()>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = Arc::new(ServerContext {
            aliases: AliasTable::parse("P7 = substation-7"),
            gate: AdmissionGate::open(store, pool).unwrap(),
            limits: FrameLimits::default(),
            read_buffer_len: 1024,
        });
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(serve(listener, Arc::clone(&ctx), async {
            rx.await.ok();
        }));
        (addr, ctx, tx, task)
    }

    async fn send(stream: &mut TcpStream, frame: &[u8]) -> [u8; 4] {
        stream.write_all(frame).await.unwrap();
        let mut ack = [0u8; 4];
        stream.read_exact(&mut ack).await.unwrap();
        ack
    }

    #[tokio::test]
    async fn test_loopback_frame() {
        let store = MemoryStore::new();
        let (addr, _ctx, tx, task) = start(&store, 2).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let data = vec![0xAB; 5000];
        let ack = send(&mut stream, &encode_frame(7, "/sim/file7.dat", "P7", &data)).await;
        assert_eq!(ack, [7, 0, 0, 0]);

        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, data);

        tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_many_connections_small_pool() {
        let store = MemoryStore::with_latency(Duration::from_millis(10));
        let (addr, ctx, tx, task) = start(&store, 2).await;

        let mut clients = Vec::new();
        for i in 0..8u32 {
            clients.push(tokio::spawn(async move {
                let mut stream = TcpStream::connect(addr).await.unwrap();
                for n in 0..3u32 {
                    let id = i * 100 + n;
                    let frame = encode_frame(id, &format!("file{id}"), &format!("P{i}"), &[1; 64]);
                    assert_eq!(send(&mut stream, &frame).await, id.to_le_bytes());
                }
            }));
        }
        for c in clients {
            c.await.unwrap();
        }

        assert_eq!(store.records().len(), 24);
        assert!(store.peak_in_flight() <= 2);
        assert_eq!(ctx.gate.available(), 2);

        tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting_and_closes_gate() {
        let store = MemoryStore::new();
        let (addr, ctx, tx, task) = start(&store, 1).await;

        tx.send(()).unwrap();
        task.await.unwrap();
        assert!(ctx.gate.acquire().await.is_err());
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
