/*
    transport.rs - duplex frame channel between two sync peers

    The engine never opens sockets. An embedder hands it something that can
    send and receive whole JSON frames (a WebSocket, a durable-object RPC
    stub, ...) by implementing `SyncTransport`. Framing is the transport's
    job: one `send` is one `SyncMessage`.

    `ChannelTransport::pair` wires two in-process endpoints together over
    tokio mpsc channels.

        ┌────────────┐  tx ──────────► rx  ┌────────────┐
        │ endpoint A │                     │ endpoint B │
        └────────────┘  rx ◄────────── tx  └────────────┘
*/

use crate::errors::{SyncError, SyncResult};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Send one encoded message
    async fn send(&self, frame: String) -> SyncResult<()>;

    /// Next encoded message; `None` once the peer has hung up
    async fn recv(&self) -> SyncResult<Option<String>>;
}

pub struct ChannelTransport {
    tx: mpsc::Sender<String>,
    rx: Mutex<mpsc::Receiver<String>>,
}

impl ChannelTransport {
    /// Two connected endpoints, each buffering up to `buffer` frames
    pub fn pair(buffer: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(buffer.max(1));
        let (b_tx, a_rx) = mpsc::channel(buffer.max(1));
        (
            Self { tx: a_tx, rx: Mutex::new(a_rx) },
            Self { tx: b_tx, rx: Mutex::new(b_rx) },
        )
    }
}

#[async_trait]
impl SyncTransport for ChannelTransport {
    async fn send(&self, frame: String) -> SyncResult<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| SyncError::RetryableSync("transport closed".into()))
    }

    async fn recv(&self) -> SyncResult<Option<String>> {
        Ok(self.rx.lock().await.recv().await)
    }
}
