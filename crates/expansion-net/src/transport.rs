//! TCP transport for a single peer-to-peer game connection.
//!
//! The host binds a [`Listener`] and accepts exactly one peer at a time; the
//! joiner dials with [`connect`] or [`connect_with_retry`]. Either way the
//! result is a [`Connection`]: the write half stays with the owner, and a
//! background reader task decodes incoming lines and forwards them over an
//! unbounded channel as [`TransportEvent`]s. The game loop drains that channel
//! without ever blocking on the socket.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::{CodecConfig, CodecError, LineDecoder, write_message};
use crate::error::DisconnectReason;
use crate::messages::{ErrorReport, NetworkMessage};
use crate::platform::{SocketConfig, configure_stream, create_listener};

/// Timing and socket settings for the transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How often a blocked accept re-checks its deadline. Default: 500 ms.
    pub accept_poll_interval: Duration,
    /// Maximum time one send may block. Default: 5 s.
    pub write_timeout: Duration,
    /// Maximum time one connect attempt may take. Default: 15 s.
    pub connect_timeout: Duration,
    /// Connect attempts made by [`connect_with_retry`]. Default: 3.
    pub connect_attempts: u32,
    /// Fixed pause between connect attempts. Default: 2 s.
    pub connect_retry_delay: Duration,
    /// Line codec limits.
    pub codec: CodecConfig,
    /// Socket options.
    pub socket: SocketConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            accept_poll_interval: Duration::from_millis(500),
            write_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(15),
            connect_attempts: 3,
            connect_retry_delay: Duration::from_secs(2),
            codec: CodecConfig::default(),
            socket: SocketConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Binding the host's listening socket failed.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    /// Another process already listens on the port.
    #[error("port {} is already in use", .addr.port())]
    AddrInUse {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The address does not belong to this machine.
    #[error("cannot listen on {addr}: address not available on this machine")]
    AddrNotAvailable {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Any other bind failure.
    #[error("cannot listen on {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

impl BindError {
    /// Classify an OS bind error.
    pub fn from_io(addr: SocketAddr, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::AddrInUse => BindError::AddrInUse { addr, source },
            std::io::ErrorKind::AddrNotAvailable => BindError::AddrNotAvailable { addr, source },
            _ => BindError::Io { addr, source },
        }
    }

    /// What the user can do about it.
    pub fn hint(&self) -> String {
        match self {
            BindError::AddrInUse { addr, .. } => format!(
                "Close the other program using port {} or pick a different port.",
                addr.port()
            ),
            BindError::AddrNotAvailable { .. } => {
                "Try 127.0.0.1 or one of this machine's own addresses.".to_string()
            }
            BindError::Io { .. } => "Check the address and port settings.".to_string(),
        }
    }
}

/// Waiting for a peer failed.
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// The stop signal fired.
    #[error("accept stopped")]
    Stopped,

    /// No peer arrived within the accept window.
    #[error("no peer connected within {0:?}")]
    TimedOut(Duration),

    /// The listener failed.
    #[error("accept failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Dialing the host failed.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// Nothing is listening at the address.
    #[error("connection to {addr} refused")]
    Refused { addr: SocketAddr },

    /// The attempt did not complete in time.
    #[error("connection to {addr} timed out after {after:?}")]
    TimedOut { addr: SocketAddr, after: Duration },

    /// No route to the address.
    #[error("{addr} is unreachable: {source}")]
    Unreachable {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Any other failure.
    #[error("connecting to {addr} failed: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Every retry failed.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<ConnectError>,
    },

    /// The stop signal fired between attempts.
    #[error("connect cancelled")]
    Cancelled,
}

impl ConnectError {
    /// Classify an OS connect error.
    pub fn from_io(addr: SocketAddr, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::ConnectionRefused => ConnectError::Refused { addr },
            std::io::ErrorKind::TimedOut => ConnectError::TimedOut {
                addr,
                after: Duration::ZERO,
            },
            std::io::ErrorKind::HostUnreachable | std::io::ErrorKind::NetworkUnreachable => {
                ConnectError::Unreachable { addr, source }
            }
            _ => ConnectError::Io { addr, source },
        }
    }

    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ConnectError::Exhausted { .. } | ConnectError::Cancelled
        )
    }

    /// What the user can do about it.
    pub fn hint(&self) -> String {
        match self {
            ConnectError::Refused { addr } => format!(
                "No game is listening on {addr}. Make sure the host has started network mode."
            ),
            ConnectError::TimedOut { .. } => {
                "The host did not answer. Check the address and any firewall in between."
                    .to_string()
            }
            ConnectError::Unreachable { .. } => {
                "The host's network cannot be reached. Check the address.".to_string()
            }
            ConnectError::Io { .. } | ConnectError::Cancelled => {
                "Check the network settings and try again.".to_string()
            }
            ConnectError::Exhausted { last, .. } => last.hint(),
        }
    }
}

/// Sending one message failed.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The write did not finish within the write timeout.
    #[error("send timed out after {0:?}")]
    TimedOut(Duration),

    /// The message could not be encoded.
    #[error("encode failed: {0}")]
    Encode(CodecError),

    /// The socket failed.
    #[error("send failed: {0}")]
    Io(std::io::Error),

    /// The connection was already closed.
    #[error("connection closed")]
    Closed,
}

impl From<CodecError> for SendError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => SendError::Io(e),
            other => SendError::Encode(other),
        }
    }
}

impl SendError {
    /// The disconnect this failure implies, if the connection is now unusable.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match self {
            SendError::TimedOut(_) => Some(DisconnectReason::TimedOut),
            SendError::Io(e) => Some(DisconnectReason::classify(e)),
            SendError::Closed => Some(DisconnectReason::Local),
            SendError::Encode(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Something the reader task observed.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete, well-formed message.
    Received(NetworkMessage),
    /// A line that failed to decode, as the `ERROR` report to surface. The
    /// connection stays up.
    Malformed(ErrorReport),
    /// The stream ended. Always the last event of a connection.
    Closed(DisconnectReason),
}

/// Resolve once `stop` holds `true` or its sender is gone.
pub(crate) async fn wait_stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Bound listening socket on the host.
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    config: TransportConfig,
}

/// Bind a listener on `addr`.
pub fn listen(addr: SocketAddr, config: &TransportConfig) -> Result<Listener, BindError> {
    let inner = create_listener(addr, &config.socket).map_err(|e| BindError::from_io(addr, e))?;
    let local_addr = inner.local_addr().map_err(|e| BindError::from_io(addr, e))?;
    tracing::info!("Listening for a peer on {local_addr}");
    Ok(Listener {
        inner,
        local_addr,
        config: config.clone(),
    })
}

impl Listener {
    /// Address actually bound, with the real port when `0` was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for one peer.
    ///
    /// Returns [`AcceptError::Stopped`] as soon as `stop` fires and
    /// [`AcceptError::TimedOut`] once `window` (if any) has elapsed.
    pub async fn accept(
        &self,
        stop: &mut watch::Receiver<bool>,
        window: Option<Duration>,
    ) -> Result<Connection, AcceptError> {
        let deadline = window.map(|w| Instant::now() + w);

        loop {
            if *stop.borrow() {
                return Err(AcceptError::Stopped);
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return Err(AcceptError::TimedOut(window.unwrap_or_default()));
            }

            tokio::select! {
                result = self.inner.accept() => {
                    match result {
                        Ok((stream, peer)) => match Connection::establish(stream, &self.config) {
                            Ok(conn) => {
                                tracing::info!("Accepted connection from {peer}");
                                return Ok(conn);
                            }
                            // Peer went away between the kernel accept and ours.
                            Err(e) => {
                                tracing::debug!("Dropping connection from {peer} that died before setup: {e}");
                            }
                        },
                        Err(e) if e.kind() == std::io::ErrorKind::ConnectionAborted => {
                            tracing::debug!("Pending connection aborted before accept: {e}");
                        }
                        Err(e) => return Err(AcceptError::Io(e)),
                    }
                }
                _ = wait_stopped(stop) => return Err(AcceptError::Stopped),
                _ = tokio::time::sleep(self.config.accept_poll_interval) => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connect
// ---------------------------------------------------------------------------

/// Make one connection attempt to `addr`.
pub async fn connect(addr: SocketAddr, config: &TransportConfig) -> Result<Connection, ConnectError> {
    let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ConnectError::from_io(addr, e)),
        Err(_) => {
            return Err(ConnectError::TimedOut {
                addr,
                after: config.connect_timeout,
            });
        }
    };
    Connection::establish(stream, config).map_err(|source| ConnectError::Io { addr, source })
}

/// Connect to `addr`, retrying with a fixed delay.
///
/// The first attempt is immediate. Non-retryable failures are returned at
/// once; otherwise the last failure is wrapped in [`ConnectError::Exhausted`].
pub async fn connect_with_retry(
    addr: SocketAddr,
    config: &TransportConfig,
    stop: &mut watch::Receiver<bool>,
) -> Result<Connection, ConnectError> {
    let attempts = config.connect_attempts.max(1);
    let mut last = None;

    for attempt in 1..=attempts {
        if *stop.borrow() {
            return Err(ConnectError::Cancelled);
        }

        tracing::info!("Connecting to {addr} (attempt {attempt}/{attempts})");
        let result = tokio::select! {
            result = connect(addr, config) => result,
            _ = wait_stopped(stop) => return Err(ConnectError::Cancelled),
        };

        match result {
            Ok(conn) => return Ok(conn),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                tracing::warn!("Connect attempt {attempt}/{attempts} failed: {e}");
                last = Some(e);
            }
        }

        if attempt < attempts {
            tokio::select! {
                _ = tokio::time::sleep(config.connect_retry_delay) => {}
                _ = wait_stopped(stop) => return Err(ConnectError::Cancelled),
            }
        }
    }

    Err(ConnectError::Exhausted {
        attempts,
        last: Box::new(last.unwrap_or(ConnectError::Cancelled)),
    })
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One live TCP connection to the peer.
///
/// Dropping a connection aborts its reader task; prefer [`Connection::close`]
/// to also shut the write side down cleanly.
pub struct Connection {
    writer: OwnedWriteHalf,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    shutdown_tx: watch::Sender<bool>,
    reader: Option<JoinHandle<()>>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    write_timeout: Duration,
    codec: CodecConfig,
    closed: bool,
}

impl Connection {
    /// Configure `stream`, split it and start the reader task.
    pub fn establish(stream: TcpStream, config: &TransportConfig) -> std::io::Result<Self> {
        configure_stream(&stream, &config.socket)?;
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;

        let (reader, writer) = stream.into_split();
        let (event_tx, events) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let decoder = LineDecoder::new(&config.codec);

        let reader = tokio::spawn(receive_loop(reader, decoder, event_tx, shutdown_rx));

        Ok(Self {
            writer,
            events,
            shutdown_tx,
            reader: Some(reader),
            peer_addr,
            local_addr,
            write_timeout: config.write_timeout,
            codec: config.codec.clone(),
            closed: false,
        })
    }

    /// Remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Local address of this end.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Encode and write one message, giving up after the write timeout.
    pub async fn send(&mut self, msg: &NetworkMessage) -> Result<(), SendError> {
        if self.closed {
            return Err(SendError::Closed);
        }
        tracing::trace!("-> {} to {}", msg.kind(), self.peer_addr);
        match tokio::time::timeout(
            self.write_timeout,
            write_message(&mut self.writer, msg, &self.codec),
        )
        .await
        {
            Ok(result) => result.map_err(SendError::from),
            Err(_) => Err(SendError::TimedOut(self.write_timeout)),
        }
    }

    /// Next buffered event, without waiting.
    pub fn try_next_event(&mut self) -> Option<TransportEvent> {
        self.events.try_recv().ok()
    }

    /// Wait for the next event. `None` once the reader is gone and the queue
    /// is empty.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    /// Stop the reader, shut the write side down and wait for the reader task
    /// to finish. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!("Write shutdown to {} failed: {e}", self.peer_addr);
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
        tracing::debug!("Connection to {} closed", self.peer_addr);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Read until the stream ends or shutdown is signalled, forwarding every
/// decoded line in arrival order.
async fn receive_loop(
    mut reader: OwnedReadHalf,
    mut decoder: LineDecoder,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            result = reader.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        let _ = events.send(TransportEvent::Closed(DisconnectReason::RemoteClosed));
                        break;
                    }
                    Ok(n) => {
                        decoder.push(&buf[..n]);
                        while let Some(decoded) = decoder.next_message() {
                            let event = match decoded {
                                Ok(msg) => TransportEvent::Received(msg),
                                Err(e) => {
                                    tracing::warn!("Dropping malformed line: {e}");
                                    TransportEvent::Malformed(e.report())
                                }
                            };
                            if events.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let reason = DisconnectReason::classify(&e);
                        tracing::debug!("Read failed ({reason}): {e}");
                        let _ = events.send(TransportEvent::Closed(reason));
                        break;
                    }
                }
            }
            _ = wait_stopped(&mut shutdown_rx) => break,
        }
    }
}
