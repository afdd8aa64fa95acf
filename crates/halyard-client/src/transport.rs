//! Transport seam
//!
//! The failover machinery never touches sockets directly. It asks a
//! [`TransportConnector`] for a connection to a [`Connector`] and hands it a
//! [`FaultReporter`]; the transport reports read/write failures through it.
//!
//! [`TcpTransport`] is the plain TCP implementation.

use crate::monitor::{FaultCause, FaultReporter};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use halyard_topology::{ConnectionId, Connector};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Opens transport connections to broker endpoints
#[async_trait]
pub trait TransportConnector: Send + Sync + 'static {
    type Connection: TransportConnection;

    /// Connect to `target`. Faults on the returned connection must be
    /// reported through `faults`.
    async fn connect(&self, target: &Connector, faults: FaultReporter) -> Result<Self::Connection>;
}

/// An established transport connection
pub trait TransportConnection: Send + Sync + 'static {
    fn id(&self) -> ConnectionId;

    fn remote(&self) -> &Connector;

    /// Release the connection. Must not report a fault.
    fn close(&self);
}

const DEFAULT_INBOUND_CAPACITY: usize = 256;
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Plain TCP transport
#[derive(Debug, Clone)]
pub struct TcpTransport {
    inbound_capacity: usize,
    nodelay: bool,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self {
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            nodelay: true,
        }
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffered inbound chunks before the reader applies backpressure
    pub fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity.max(1);
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

#[async_trait]
impl TransportConnector for TcpTransport {
    type Connection = TcpConnection;

    async fn connect(&self, target: &Connector, faults: FaultReporter) -> Result<TcpConnection> {
        let addr = target.address();
        debug!("Connecting to {}", addr);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::ConnectionError(format!("{}: {}", addr, e)))?;
        stream.set_nodelay(self.nodelay)?;

        let conn = TcpConnection::start(stream, target.clone(), faults, self.inbound_capacity);
        info!(connection = %conn.id, generation = conn.faults.generation(), "Connected to {}", addr);
        Ok(conn)
    }
}

/// TCP connection with a background reader
///
/// Inbound bytes are delivered as raw chunks on the channel returned by
/// [`take_inbound`](Self::take_inbound). Framing belongs to the protocol
/// layer above.
pub struct TcpConnection {
    id: ConnectionId,
    remote: Connector,
    /// Taken on close; dropping it sends FIN to the peer
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    inbound: Mutex<Option<mpsc::Receiver<Bytes>>>,
    reader: JoinHandle<()>,
    closed: Arc<AtomicBool>,
    faults: FaultReporter,
}

impl TcpConnection {
    fn start(stream: TcpStream, remote: Connector, faults: FaultReporter, capacity: usize) -> Self {
        let id = ConnectionId::next();
        let (mut read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(capacity);
        let closed = Arc::new(AtomicBool::new(false));

        let reader = {
            let closed = closed.clone();
            let faults = faults.clone();
            tokio::spawn(async move {
                let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
                let cause = loop {
                    buf.reserve(READ_BUFFER_SIZE);
                    match read_half.read_buf(&mut buf).await {
                        Ok(0) => break FaultCause::Disconnected,
                        Ok(_) => {
                            // Nobody listening is fine; keep draining the socket
                            let _ = tx.send(buf.split().freeze()).await;
                        }
                        Err(e) => break FaultCause::Transport(e.to_string()),
                    }
                };

                if !closed.load(Ordering::Acquire) {
                    debug!(connection = %id, %cause, "Reader stopped");
                    faults.report(cause);
                }
            })
        };

        Self {
            id,
            remote,
            writer: tokio::sync::Mutex::new(Some(write_half)),
            inbound: Mutex::new(Some(rx)),
            reader,
            closed,
            faults,
        }
    }

    /// Write a buffer. A failed write is reported as a fault.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(Error::Closed);
        };
        let result: std::io::Result<()> = async {
            writer.write_all(data).await?;
            writer.flush().await
        }
        .await;

        // close() raced with this write and could not take the writer
        if self.is_closed() {
            guard.take();
        }

        if let Err(e) = result {
            if !self.is_closed() {
                self.faults.report(FaultCause::Transport(e.to_string()));
            }
            return Err(Error::IoError(e));
        }
        Ok(())
    }

    /// Take the inbound chunk stream. Only the first call gets it.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.inbound.lock().take()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl TransportConnection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote(&self) -> &Connector {
        &self.remote
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(connection = %self.id, "Closing connection to {}", self.remote);
            self.reader.abort();
            // A send in flight holds the lock and drops the writer itself
            if let Ok(mut writer) = self.writer.try_lock() {
                writer.take();
            }
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.reader.abort();
    }
}
