use crate::wire::{self, InsertResponse};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("transport write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("envelope encoding failed: {0}")]
    Encode(#[from] prost::EncodeError),
}

/// `None` once the reader task has exited; registrations made after that
/// resolve immediately as missing acks.
type PendingMap = Option<HashMap<u64, oneshot::Sender<InsertResponse>>>;

/// One persistent connection to the destination store, shared by every
/// in-flight insert. Writes are serialized by a mutex so envelopes are never
/// interleaved on the wire. A single reader task owns the read half and
/// dispatches each response to its waiting sender by echo tag, so acks are
/// matched by correlation rather than arrival order.
pub struct StoreConnection {
    writer: Mutex<OwnedWriteHalf>,
    pending: Arc<StdMutex<PendingMap>>,
    next_tag: AtomicU64,
    reader: JoinHandle<()>,
}

impl StoreConnection {
    pub async fn connect(addr: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let pending: Arc<StdMutex<PendingMap>> = Arc::new(StdMutex::new(Some(HashMap::new())));
        let reader = tokio::spawn(dispatch_acks(read_half, pending.clone()));
        Self {
            writer: Mutex::new(write_half),
            pending,
            next_tag: AtomicU64::new(1),
            reader,
        }
    }

    /// Allocates an echo tag and registers a waiter for its ack.
    pub fn register(&self) -> (u64, oneshot::Receiver<InsertResponse>) {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut guard) = self.pending.lock() {
            if let Some(map) = guard.as_mut() {
                map.insert(tag, tx);
            }
        }
        (tag, rx)
    }

    /// Drops the waiter for a tag whose envelope never made it onto the wire.
    pub fn forget(&self, tag: u64) {
        if let Ok(mut guard) = self.pending.lock() {
            if let Some(map) = guard.as_mut() {
                map.remove(&tag);
            }
        }
    }

    pub async fn transmit(&self, frame: &[u8]) -> Result<(), ConnError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> std::io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

impl Drop for StoreConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn dispatch_acks(read_half: OwnedReadHalf, pending: Arc<StdMutex<PendingMap>>) {
    let mut reader = BufReader::new(read_half);
    loop {
        match wire::read_message::<InsertResponse, _>(&mut reader).await {
            Ok(Some(response)) => {
                let waiter = pending
                    .lock()
                    .ok()
                    .and_then(|mut guard| guard.as_mut().and_then(|map| map.remove(&response.echo_tag)));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        tracing::warn!(tag = response.echo_tag, "ack with no pending request");
                    }
                }
            }
            Ok(None) => {
                tracing::info!("destination closed the connection");
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to read ack; abandoning pending requests");
                break;
            }
        }
    }
    // Waiters see a closed channel and report a missing ack.
    if let Ok(mut guard) = pending.lock() {
        guard.take();
    }
}
