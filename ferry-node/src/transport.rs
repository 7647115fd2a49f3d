//! TCP transport: accepts and dials peer connections, decodes their frames into one
//! inbound queue, and sends messages by address (dialing first when needed).

use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferry_core::Message;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::codec::{self, CodecError};
use crate::registry::{Connection, ConnectionId, ConnectionRegistry, SharedWriter};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Messages buffered before readers stall.
    pub inbound_capacity: usize,
    /// Wait window for an outbound connection.
    pub dial_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: 1024,
            dial_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("failed to connect to {addr}: {source}")]
    Dial {
        addr: String,
        source: std::io::Error,
    },
    #[error("timed out connecting to {addr} after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },
    #[error("failed to send to {addr}: {source}")]
    Send { addr: String, source: CodecError },
    #[error("transport is shut down")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

struct Shared {
    config: TransportConfig,
    registry: Arc<ConnectionRegistry>,
    inbound_tx: Mutex<Option<mpsc::Sender<Message>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    listener: Mutex<Option<(SocketAddr, AbortHandle)>>,
}

/// Cheap to clone; clones share listener, registry, and inbound queue.
#[derive(Clone)]
pub struct TcpTransport {
    shared: Arc<Shared>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.inbound_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                registry: Arc::new(ConnectionRegistry::new()),
                inbound_tx: Mutex::new(Some(tx)),
                inbound_rx: Mutex::new(Some(rx)),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Bind `addr` and spawn the accept loop. Returns the bound address (useful with port 0).
    pub async fn start_listening(&self, addr: &str) -> Result<SocketAddr, TransportError> {
        if self.shared.registry.is_closed() {
            return Err(TransportError::Closed);
        }
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local = listener.local_addr()?;
        info!(%local, "listening for peers");

        let transport = self.clone();
        let task = tokio::spawn(async move { transport.accept_loop(listener).await });
        let previous = lock(&self.shared.listener).replace((local, task.abort_handle()));
        if let Some((old, handle)) = previous {
            debug!(%old, "replacing previous listener");
            handle.abort();
        }
        Ok(local)
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    debug!(%remote, "accepted connection");
                    match self.attach(stream, &remote.to_string(), remote) {
                        Ok(_) => {}
                        Err(TransportError::Closed) => break,
                        Err(e) => warn!(%remote, error = %e, "failed to register connection"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Open a connection to `addr`, register it under `addr`, and start its reader.
    pub async fn connect_to_peer(&self, addr: &str) -> Result<Connection, TransportError> {
        if self.shared.registry.is_closed() {
            return Err(TransportError::Closed);
        }
        let timeout = self.shared.config.dial_timeout;
        debug!(addr, "connecting to peer");
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TransportError::Dial {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(TransportError::DialTimeout {
                    addr: addr.to_string(),
                    timeout,
                })
            }
        };
        let remote = stream.peer_addr()?;
        let conn = self.attach(stream, addr, remote)?;
        info!(addr, %remote, "connected to peer");
        Ok(conn)
    }

    /// Send `msg` on the connection registered for `addr`, dialing first if there is none.
    /// A failed write evicts the connection so the next send dials again.
    pub async fn send(&self, addr: &str, msg: &Message) -> Result<(), TransportError> {
        let conn = match self.shared.registry.get(addr) {
            Some(conn) => conn,
            None => self.connect_to_peer(addr).await?,
        };
        if let Err(source) = conn.send(msg).await {
            if self.shared.registry.remove_if(addr, conn.id()) {
                debug!(addr, remote = conn.remote(), "evicting connection after failed write");
                conn.close();
            }
            return Err(TransportError::Send {
                addr: addr.to_string(),
                source,
            });
        }
        Ok(())
    }

    /// The inbound queue. There is a single consumer, so this returns `Some` once.
    pub fn messages(&self) -> Option<mpsc::Receiver<Message>> {
        lock(&self.shared.inbound_rx).take()
    }

    /// Close the listener and every registered connection, then close the inbound queue.
    pub fn shutdown(&self) {
        if let Some((local, handle)) = lock(&self.shared.listener).take() {
            handle.abort();
            info!(%local, "listener closed");
        }
        lock(&self.shared.inbound_tx).take();
        let conns = self.shared.registry.close_all();
        let n = conns.len();
        for conn in conns {
            conn.close();
        }
        debug!(connections = n, "transport shut down");
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.shared.listener).as_ref().map(|(addr, _)| *addr)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.count()
    }

    fn inbound_sender(&self) -> Option<mpsc::Sender<Message>> {
        lock(&self.shared.inbound_tx).clone()
    }

    /// Register `stream` under `key` and spawn its reader. Never awaits, so the accept loop
    /// is never held up by a connection.
    fn attach(
        &self,
        stream: TcpStream,
        key: &str,
        remote: SocketAddr,
    ) -> Result<Connection, TransportError> {
        let _ = stream.set_nodelay(true);
        let std_stream = stream.into_std()?;
        let socket = Arc::new(std_stream.try_clone()?);
        let (read_half, write_half) = TcpStream::from_std(std_stream)?.into_split();
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(write_half));
        let inbound = self.inbound_sender().ok_or(TransportError::Closed)?;
        let registry = self.shared.registry.clone();
        let key_owned = key.to_string();
        self.shared.registry.register_with(key, move |id| {
            let reader = Reader {
                read_half,
                remote: remote.to_string(),
                key: key_owned,
                id,
                registry,
                socket: socket.clone(),
                inbound,
                _writer: writer.clone(),
            };
            let task = tokio::spawn(reader.run());
            Connection::new(id, remote.to_string(), writer, socket, task.abort_handle())
        })
    }
}

/// Per-connection read loop state.
struct Reader {
    read_half: OwnedReadHalf,
    remote: String,
    key: String,
    id: ConnectionId,
    registry: Arc<ConnectionRegistry>,
    socket: Arc<std::net::TcpStream>,
    inbound: mpsc::Sender<Message>,
    /// Held until the loop exits: a connection replaced in the registry must not half-close
    /// while replies may still arrive on it.
    _writer: SharedWriter,
}

impl Reader {
    async fn run(mut self) {
        loop {
            match codec::read_message(&mut self.read_half).await {
                Ok(mut msg) => {
                    // The observed address is authoritative.
                    msg.from_addr = self.remote.clone();
                    debug!(remote = %self.remote, kind = ?msg.message_type(), "message received");
                    if self.inbound.send(msg).await.is_err() {
                        debug!(remote = %self.remote, "inbound queue closed");
                        break;
                    }
                }
                Err(CodecError::EndOfStream) => {
                    debug!(remote = %self.remote, "peer closed connection");
                    break;
                }
                Err(e) => {
                    warn!(remote = %self.remote, error = %e, "dropping connection");
                    break;
                }
            }
        }
        self.registry.remove_if(&self.key, self.id);
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}
