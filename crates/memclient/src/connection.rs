//! One TCP connection to a cache server.
//!
//! Each connection owns an in-flight FIFO and a reader task that drives the
//! response parser over incoming bytes. Requests are enqueued before their
//! bytes reach the wire so the parser always finds the matching descriptor
//! at the head of the queue. When the connection dies, every pending waiter
//! is failed exactly once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::codec::{encode_batch, ResponseParser};
use crate::error::{Error, Result};
use crate::inflight::{InflightQueue, InflightRequest, ResponsePayload};
use crate::server_list::ServerAddress;

static CONNECTION_SEQ: AtomicU64 = AtomicU64::new(1);

const READ_BUFFER_CAPACITY: usize = 16 * 1024;

pub(crate) struct Connection {
    id: u64,
    address: ServerAddress,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    inflight: Arc<InflightQueue>,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Open a connection within `timeout` and start its reader task.
    pub(crate) async fn connect(
        address: &ServerAddress,
        timeout: Option<Duration>,
    ) -> Result<Arc<Self>> {
        let connecting = TcpStream::connect((address.host(), address.port()));
        let stream = match timeout {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| Error::Timeout { what: "connect", timeout: Some(limit) })??,
            None => connecting.await?,
        };
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let inflight = Arc::new(InflightQueue::default());
        let closed = Arc::new(AtomicBool::new(false));
        let id = CONNECTION_SEQ.fetch_add(1, Ordering::Relaxed);
        let reader = tokio::spawn(read_loop(
            read_half,
            inflight.clone(),
            closed.clone(),
            address.clone(),
            id,
        ));

        Ok(Arc::new(Self {
            id,
            address: address.clone(),
            writer: tokio::sync::Mutex::new(write_half),
            inflight,
            closed,
            reader: Mutex::new(Some(reader)),
        }))
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Enqueue the batch and write its frames within `timeout`.
    ///
    /// The descriptors are pushed onto the in-flight FIFO before any byte
    /// can be observed by the parser, which is what makes positional
    /// correlation sound.
    pub(crate) async fn write_batch(
        &self,
        batch: &[Arc<InflightRequest>],
        timeout: Option<Duration>,
    ) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection closed",
            )));
        }
        for item in batch {
            self.inflight.push(item.clone());
        }
        let chunks = encode_batch(batch);

        let mut writer = self.writer.lock().await;
        let write_all = async {
            for chunk in &chunks {
                writer.write_all(chunk).await?;
            }
            writer.flush().await
        };
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, write_all).await {
                Ok(result) => result.map_err(Error::Transport),
                Err(_) => Err(Error::Timeout { what: "write", timeout: Some(limit) }),
            },
            None => write_all.await.map_err(Error::Transport),
        };
        if let Err(err) = outcome {
            self.closed.store(true, Ordering::Release);
            tracing::debug!(server = %self.address, connection = self.id, error = %err, "write failed");
            return Err(err);
        }
        Ok(())
    }

    /// Close the connection and fail whatever is still pending.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
        let pending = self.inflight.len();
        if pending > 0 {
            tracing::debug!(
                server = %self.address,
                connection = self.id,
                pending,
                "closing connection with requests in flight"
            );
        }
        fail_pending(&self.inflight);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().unwrap().take() {
            handle.abort();
        }
        fail_pending(&self.inflight);
    }
}

fn fail_pending(inflight: &InflightQueue) {
    for pending in inflight.drain() {
        pending.complete(ResponsePayload::Empty, true);
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    inflight: Arc<InflightQueue>,
    closed: Arc<AtomicBool>,
    address: ServerAddress,
    id: u64,
) {
    let mut parser = ResponseParser::new();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    loop {
        if let Err(err) = parser.feed(&mut buf, &inflight) {
            tracing::warn!(server = %address, connection = id, error = %err, "response parsing failed, closing connection");
            break;
        }
        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                tracing::debug!(server = %address, connection = id, "server closed the connection");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(server = %address, connection = id, error = %err, "read failed");
                break;
            }
        }
    }
    closed.store(true, Ordering::Release);
    fail_pending(&inflight);
}

/// Pool-facing handle. Cloneable and hashable by connection id so the pool
/// can track disposables without owning connection internals.
#[derive(Clone)]
pub(crate) struct PooledConnection(pub(crate) Arc<Connection>);

impl PartialEq for PooledConnection {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for PooledConnection {}

impl std::hash::Hash for PooledConnection {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.0.id)
            .field("address", &self.0.address)
            .field("open", &self.0.is_open())
            .finish()
    }
}
