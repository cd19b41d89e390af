use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time;
use uuid::Uuid;

use crate::backup::{BackupJournal, BackupRecorder, BackupState};
use crate::command::CubeCommand;
use crate::config::GatewayConfig;
use crate::dispatch::Dispatcher;
use crate::error::{CubeError, Result};
use crate::framer::LineFramer;
use crate::protocol::MessageCodec;
use crate::registry::DeviceRegistry;

/// Prefix of the line that ends the dump the gateway sends on connect.
pub const HANDSHAKE_TERMINATOR: &str = "L:";

/// Byte stream to a gateway.
pub trait GatewayStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> GatewayStream for T {}

pub type BoxStream = Box<dyn GatewayStream>;

/// Opens connections to the gateway.
///
/// The session never retries on its own; a failed `connect` is reported to
/// the caller of the exchange that needed it.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<BoxStream>;

    /// Printable address for logs and listeners.
    fn address(&self) -> String;
}

/// Plain TCP connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self { addr: addr.into(), timeout }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.address(), config.io_timeout())
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxStream> {
        let stream = match time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(CubeError::Connect { addr: self.addr.clone(), source });
            }
            Err(_) => {
                return Err(CubeError::Connect {
                    addr: self.addr.clone(),
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                });
            }
        };
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn address(&self) -> String {
        self.addr.clone()
    }
}

/// Outcome of one exchange. `seq` increases with every exchange on the
/// session, in the order they took the session lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exchange {
    pub ok: bool,
    pub seq: u64,
}

/// Connection lifecycle of a [`GatewaySession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; the next exchange connects first
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// Connected; `request_count` exchanges served so far
    Connected,
}

struct Connection {
    id: Uuid,
    framer: LineFramer<BoxStream>,
}

struct Inner {
    connection: Option<Connection>,
    request_count: u32,
    codec: Box<dyn MessageCodec>,
    dispatcher: Dispatcher,
    backup: BackupRecorder,
    journal: Option<BackupJournal>,
    exchanges: u64,
}

/// Owns the gateway connection and runs one exchange at a time.
///
/// Every exchange holds the session lock from connect through write and
/// read, so two callers never interleave on the wire. Messages received
/// during an exchange are dispatched before the exchange returns.
pub struct GatewaySession {
    hub_id: String,
    exclusive: bool,
    max_requests_per_connection: u32,
    io_timeout: Duration,
    backup_directory: Option<PathBuf>,
    connector: Arc<dyn Connector>,
    registry: Arc<DeviceRegistry>,
    state: StdMutex<ConnectionState>,
    request_count: AtomicU32,
    inner: Mutex<Inner>,
}

impl GatewaySession {
    pub fn new(
        config: &GatewayConfig,
        connector: Arc<dyn Connector>,
        codec: Box<dyn MessageCodec>,
        dispatcher: Dispatcher,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        Self {
            hub_id: config.hub_id.clone(),
            exclusive: config.exclusive,
            max_requests_per_connection: config.max_requests_per_connection,
            io_timeout: config.io_timeout(),
            backup_directory: config.backup_directory.clone(),
            connector,
            registry,
            state: StdMutex::new(ConnectionState::Disconnected),
            request_count: AtomicU32::new(0),
            inner: Mutex::new(Inner {
                connection: None,
                request_count: 0,
                codec,
                dispatcher,
                backup: BackupRecorder::new(config.hub_id.clone()),
                journal: None,
                exchanges: 0,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exchanges completed on the current connection.
    pub fn request_count(&self) -> u32 {
        self.request_count.load(Ordering::Acquire)
    }

    pub fn address(&self) -> String {
        self.connector.address()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Sends `command` and reads until its answer, bounded by the I/O timeout.
    pub async fn send_and_await(&self, command: &CubeCommand) -> bool {
        self.send_and_await_with_timeout(command, self.io_timeout).await
    }

    /// Like [`send_and_await`](Self::send_and_await) with a custom read
    /// timeout for exchanges the gateway answers slowly.
    ///
    /// Returns false on any connect or I/O failure; the connection is closed
    /// and the next exchange reconnects.
    pub async fn send_and_await_with_timeout(&self, command: &CubeCommand, timeout: Duration) -> bool {
        self.exchange(command, timeout).await.ok
    }

    /// Runs one exchange and reports where it falls in the session's order,
    /// so callers acting on outcomes after the lock is released can drop
    /// stale ones.
    pub async fn exchange(&self, command: &CubeCommand, timeout: Duration) -> Exchange {
        let mut inner = self.inner.lock().await;
        inner.exchanges += 1;
        let seq = inner.exchanges;
        let ok = match self.exchange_locked(&mut inner, command, timeout).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(
                    hub = %self.hub_id,
                    command = command.class_name(),
                    error = %e,
                    "Exchange with gateway failed"
                );
                self.close_locked(&mut inner).await;
                false
            }
        };
        if !self.exclusive {
            self.close_locked(&mut inner).await;
        }
        Exchange { ok, seq }
    }

    async fn exchange_locked(&self, inner: &mut Inner, command: &CubeCommand, timeout: Duration) -> Result<()> {
        let max = self.max_requests_per_connection;
        if max > 0 && inner.request_count >= max && inner.connection.is_some() {
            tracing::debug!(hub = %self.hub_id, requests = inner.request_count, "Request limit reached, reconnecting");
            self.close_locked(inner).await;
        }
        if inner.connection.is_none() {
            self.connect_locked(inner).await?;
        }

        let first = inner.request_count == 0;
        if first {
            self.read_until(inner, HANDSHAKE_TERMINATOR, timeout).await?;
        }

        if first && command.is_answered_by_handshake() {
            tracing::trace!(hub = %self.hub_id, "Handshake answered the request");
        } else {
            let bytes = inner.codec.encode(command);
            let connection = inner
                .connection
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))?;
            tracing::trace!(
                connection = %connection.id,
                line = %String::from_utf8_lossy(&bytes).trim_end(),
                "Sending command"
            );
            let stream = connection.framer.get_mut();
            time::timeout(timeout, async {
                stream.write_all(&bytes).await?;
                stream.flush().await
            })
            .await
            .map_err(|_| CubeError::Timeout)??;

            match command.terminator() {
                Some(terminator) => self.read_until(inner, terminator, timeout).await?,
                None => self.close_locked(inner).await,
            }
        }

        inner.request_count += 1;
        self.request_count.store(inner.request_count, Ordering::Release);
        Ok(())
    }

    async fn connect_locked(&self, inner: &mut Inner) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        match self.connector.connect().await {
            Ok(stream) => {
                let id = Uuid::new_v4();
                tracing::debug!(hub = %self.hub_id, connection = %id, address = %self.connector.address(), "Connected to gateway");
                inner.connection = Some(Connection { id, framer: LineFramer::new(stream) });
                inner.request_count = 0;
                inner.codec.reset();
                self.request_count.store(0, Ordering::Release);
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Reads and dispatches lines until one starts with `terminator`.
    async fn read_until(&self, inner: &mut Inner, terminator: &str, timeout: Duration) -> Result<()> {
        loop {
            let connection = inner
                .connection
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))?;
            let raw = match time::timeout(timeout, connection.framer.read_next()).await {
                Err(_) => return Err(CubeError::Timeout),
                Ok(line) => line?.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::UnexpectedEof, "gateway closed the connection")
                })?,
            };
            tracing::trace!(connection = %connection.id, line = %raw, "Message block");

            if let Some(records) = inner.backup.observe(&raw) {
                self.submit_backup(inner, records).await;
            }

            match inner.codec.decode(&raw) {
                Ok(Some(message)) => inner.dispatcher.dispatch(&message),
                Ok(None) => {}
                Err(e) => {
                    tracing::info!(hub = %self.hub_id, line = %raw, error = %e, "Message could not be processed");
                    inner.codec.reset();
                }
            }

            if raw.starts_with(terminator) {
                return Ok(());
            }
        }
    }

    async fn submit_backup(&self, inner: &mut Inner, records: Vec<crate::backup::BackupRecord>) {
        let Some(dir) = self.backup_directory.as_ref() else {
            return;
        };
        let journal = inner.journal.get_or_insert_with(|| BackupJournal::spawn(dir.clone()));
        let serial = self.registry.cube().serial;
        let subject = if serial.is_empty() { self.hub_id.as_str() } else { serial.as_str() };
        if let Err(e) = journal.submit(subject, inner.backup.stamp(), records).await {
            tracing::error!(error = %e, "Failed to queue backup");
        }
    }

    async fn close_locked(&self, inner: &mut Inner) {
        if let Some(connection) = inner.connection.take() {
            let mut stream = connection.framer.into_inner();
            if let Err(e) = stream.shutdown().await {
                tracing::trace!(connection = %connection.id, error = %e, "Error while closing connection");
            }
            tracing::debug!(hub = %self.hub_id, connection = %connection.id, "Connection closed");
        }
        inner.codec.reset();
        inner.backup.abandon();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Closes the connection if one is open. Waits for a running exchange.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        self.close_locked(&mut inner).await;
    }

    /// Captures the raw lines of the next state dump (`H:` through `L:`).
    pub async fn request_backup(&self) -> Result<()> {
        if self.backup_directory.is_none() {
            return Err(CubeError::InvalidConfig("backup_directory not configured".into()));
        }
        self.inner.lock().await.backup.request();
        Ok(())
    }

    pub async fn backup_state(&self) -> BackupState {
        self.inner.lock().await.backup.state()
    }

    /// Waits until every captured backup has been written.
    pub async fn flush_backups(&self) -> Result<()> {
        let journal = self.inner.lock().await.journal.clone();
        match journal {
            Some(journal) => journal.flush().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for GatewaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewaySession")
            .field("hub_id", &self.hub_id)
            .field("address", &self.connector.address())
            .field("state", &self.state())
            .field("request_count", &self.request_count())
            .finish()
    }
}
