//! One tunnel session: a local TCP connection bound to one relay
//! connection, with a pump per direction.
//!
//! The relay pump owns the `RelayConnection` and is the only task touching
//! it; the local pumps talk to it through bounded channels, which is what
//! buffers local reads while the relay connection resumes after a drop.
//! Either side closing tears the whole session down.

use crate::error::TunnelError;
use burrow_core::error::CoreError;
use burrow_core::frame::{MAX_DATA_CHUNK, RelayFrame};
use burrow_relay::connection::{Progress, RelayConnection};
use burrow_relay::target::RelayTarget;
use bytes::Bytes;
use log::debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Chunks buffered per direction while the other end is slow or the relay
/// connection is resuming.
pub const DATA_CHANNEL_CAPACITY: usize = 64;

/// Byte counters shared between the sessions of one tunnel and its handle.
/// Sent/received are from the local application's point of view.
#[derive(Debug, Default)]
pub struct TunnelStatistics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl TunnelStatistics {
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    fn add_sent(&self, amount: u64) {
        self.bytes_sent.fetch_add(amount, Ordering::Relaxed);
    }

    fn add_received(&self, amount: u64) {
        self.bytes_received.fetch_add(amount, Ordering::Relaxed);
    }
}

/// How a session came to an end, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    LocalClosed,
    RemoteClosed,
    Cancelled,
}

pub struct TunnelSession {
    id: Uuid,
    peer: SocketAddr,
    stats: Arc<TunnelStatistics>,
}

impl TunnelSession {
    pub fn new(peer: SocketAddr, stats: Arc<TunnelStatistics>) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            stats,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Pumps bytes between the local socket and the relay connection until
    /// either side closes, the relay fails unrecoverably, or the session is
    /// cancelled.
    pub async fn run<T: RelayTarget>(
        self,
        local: TcpStream,
        connection: RelayConnection<T>,
        cancel: CancellationToken,
    ) -> Result<SessionEnd, TunnelError> {
        let (local_read, local_write) = local.into_split();
        let (up_tx, up_rx) = mpsc::channel::<Bytes>(DATA_CHANNEL_CAPACITY);
        let (down_tx, down_rx) = mpsc::channel::<Bytes>(DATA_CHANNEL_CAPACITY);

        let reader = tokio::spawn(read_local(
            local_read,
            up_tx,
            self.stats.clone(),
            cancel.clone(),
        ));
        let writer = tokio::spawn(write_local(local_write, down_rx, self.stats.clone()));
        let relay = tokio::spawn(relay_pump(connection, up_rx, down_tx, cancel.clone()));

        // The relay pump is the terminal join point: a closing reader or a
        // failing writer reaches it through the channels.
        let outcome = match relay.await {
            Ok(result) => result,
            Err(e) => Err(TunnelError::from(e)),
        };

        cancel.cancel();
        let _ = reader.await;
        match &outcome {
            // Let the writer drain what the relay already delivered.
            Ok(SessionEnd::LocalClosed) | Ok(SessionEnd::RemoteClosed) => {
                let _ = writer.await;
            }
            _ => {
                writer.abort();
                let _ = writer.await;
            }
        }

        match &outcome {
            Ok(end) => debug!(
                "Session {} from {} ended ({end:?}): {} bytes up, {} bytes down",
                self.id,
                self.peer,
                self.stats.bytes_sent(),
                self.stats.bytes_received()
            ),
            Err(e) => debug!("Session {} from {} failed: {e}", self.id, self.peer),
        }
        outcome
    }
}

async fn read_local(
    mut half: OwnedReadHalf,
    up_tx: mpsc::Sender<Bytes>,
    stats: Arc<TunnelStatistics>,
    cancel: CancellationToken,
) {
    // Reads are capped at the protocol chunk size so the codec never sees
    // an oversized payload.
    let mut buf = vec![0u8; MAX_DATA_CHUNK];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            read = half.read(&mut buf) => match read {
                // Dropping up_tx tells the relay pump the local side is done.
                Ok(0) => return,
                Ok(n) => {
                    stats.add_sent(n as u64);
                    if up_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!("Local read ended: {e}");
                    return;
                }
            },
        }
    }
}

async fn write_local(
    mut half: OwnedWriteHalf,
    mut down_rx: mpsc::Receiver<Bytes>,
    stats: Arc<TunnelStatistics>,
) {
    while let Some(chunk) = down_rx.recv().await {
        if let Err(e) = half.write_all(&chunk).await {
            debug!("Local write ended: {e}");
            return;
        }
        stats.add_received(chunk.len() as u64);
    }
    let _ = half.shutdown().await;
}

enum PumpEvent {
    Cancelled,
    Up(Option<Bytes>),
    Frame(Option<Result<RelayFrame, CoreError>>),
}

async fn relay_pump<T: RelayTarget>(
    mut connection: RelayConnection<T>,
    mut up_rx: mpsc::Receiver<Bytes>,
    down_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) -> Result<SessionEnd, TunnelError> {
    loop {
        // Only cancel-safe futures race here; the resulting event is then
        // handled to completion, including any resume of the relay
        // connection.
        let event = tokio::select! {
            _ = cancel.cancelled() => PumpEvent::Cancelled,
            chunk = up_rx.recv() => PumpEvent::Up(chunk),
            item = connection.next_frame() => PumpEvent::Frame(item),
        };

        match event {
            PumpEvent::Cancelled => {
                connection.close().await;
                return Ok(SessionEnd::Cancelled);
            }
            PumpEvent::Up(Some(chunk)) => {
                if let Err(e) = connection.send_data(chunk).await {
                    connection.close().await;
                    return Err(TunnelError::from(e));
                }
            }
            PumpEvent::Up(None) => {
                connection.close().await;
                return Ok(SessionEnd::LocalClosed);
            }
            PumpEvent::Frame(item) => match connection.process(item).await {
                Ok(Progress::Payload(chunk)) => {
                    if down_tx.send(chunk).await.is_err() {
                        connection.close().await;
                        return Ok(SessionEnd::LocalClosed);
                    }
                }
                Ok(Progress::Continue) => {}
                Ok(Progress::Finished) => {
                    connection.close().await;
                    return Ok(SessionEnd::RemoteClosed);
                }
                Err(e) => {
                    connection.close().await;
                    return Err(TunnelError::from(e));
                }
            },
        }
    }
}
