//! Connection registry: live peer connections keyed by remote address.
//!
//! Every insert, lookup, and removal goes through [`ConnectionRegistry`], which holds a single
//! lock for the whole table. Once closed the registry refuses new entries, so a dial that
//! races shutdown cannot leave a connection behind.

use std::collections::HashMap;
use std::net::Shutdown;
use std::sync::{Arc, Mutex};

use ferry_core::Message;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::AbortHandle;

use crate::codec::{self, CodecError};
use crate::transport::TransportError;

/// Distinguishes successive connections registered under the same address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

/// Write half shared by a connection's handles and its reader task. The socket's write side
/// stays open while any holder remains.
pub type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// A live connection. Clones share the same socket.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    remote: String,
    writer: SharedWriter,
    /// Duplicate of the socket; shutting it down fails blocked reads and writes.
    socket: Arc<std::net::TcpStream>,
    reader: AbortHandle,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        remote: String,
        writer: SharedWriter,
        socket: Arc<std::net::TcpStream>,
        reader: AbortHandle,
    ) -> Self {
        Self {
            id,
            remote,
            writer,
            socket,
            reader,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Address observed on the socket.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Write one message. Frames from concurrent senders never interleave.
    pub async fn send(&self, msg: &Message) -> Result<(), CodecError> {
        let mut writer = self.writer.lock().await;
        codec::write_message(&mut *writer, msg).await
    }

    /// Close the socket and stop its reader.
    pub fn close(&self) {
        let _ = self.socket.shutdown(Shutdown::Both);
        self.reader.abort();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .finish()
    }
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<String, Connection>,
    next_id: u64,
    closed: bool,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate an id, build the connection with it and insert it under `addr`, all under the
    /// lock. `build` is not called once the registry is closed. A previous entry for the same
    /// address is replaced (last writer wins); it stays open until its own reader exits.
    pub fn register_with<F>(&self, addr: &str, build: F) -> Result<Connection, TransportError>
    where
        F: FnOnce(ConnectionId) -> Connection,
    {
        let mut state = self.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        let id = ConnectionId(state.next_id);
        state.next_id += 1;
        let conn = build(id);
        if let Some(prev) = state.connections.insert(addr.to_string(), conn.clone()) {
            tracing::debug!(addr, replaced = prev.id.0, "connection replaced in registry");
        }
        Ok(conn)
    }

    pub fn get(&self, addr: &str) -> Option<Connection> {
        self.lock().connections.get(addr).cloned()
    }

    /// Remove `addr` only if it still maps to connection `id`.
    pub fn remove_if(&self, addr: &str, id: ConnectionId) -> bool {
        let mut state = self.lock();
        match state.connections.get(addr) {
            Some(conn) if conn.id == id => {
                state.connections.remove(addr);
                true
            }
            _ => false,
        }
    }

    /// Mark closed and hand back every registered connection.
    pub fn close_all(&self) -> Vec<Connection> {
        let mut state = self.lock();
        state.closed = true;
        state.connections.drain().map(|(_, c)| c).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn count(&self) -> usize {
        self.lock().connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    /// Loopback connection wrapped the way the transport wraps it, with an idle reader task.
    async fn loopback(id: ConnectionId) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();
        let (server, _) = accepted.unwrap();
        let std_stream = client.into_std().unwrap();
        let socket = Arc::new(std_stream.try_clone().unwrap());
        let client = TcpStream::from_std(std_stream).unwrap();
        let (_read, write) = client.into_split();
        let reader = tokio::spawn(std::future::pending::<()>());
        let writer = Arc::new(tokio::sync::Mutex::new(write));
        let conn = Connection::new(id, addr.to_string(), writer, socket, reader.abort_handle());
        (conn, server)
    }

    #[tokio::test]
    async fn register_and_get() {
        let registry = ConnectionRegistry::new();
        let (conn, _server) = loopback(ConnectionId(0)).await;
        let registered = registry
            .register_with("127.0.0.1:3000", |_| conn.clone())
            .unwrap();
        assert_eq!(registry.count(), 1);
        assert_eq!(
            registry.get("127.0.0.1:3000").map(|c| c.id()),
            Some(registered.id())
        );
        assert!(registry.get("127.0.0.1:3001").is_none());
    }

    #[tokio::test]
    async fn stale_reader_does_not_evict_newer_entry() {
        let registry = ConnectionRegistry::new();
        let (first, _s1) = loopback(ConnectionId(0)).await;
        let (second, _s2) = loopback(ConnectionId(1)).await;
        let a = registry
            .register_with("peer", |id| Connection { id, ..first.clone() })
            .unwrap();
        let b = registry
            .register_with("peer", |id| Connection { id, ..second.clone() })
            .unwrap();
        assert_ne!(a.id(), b.id());
        assert!(!registry.remove_if("peer", a.id()));
        assert_eq!(registry.count(), 1);
        assert!(registry.remove_if("peer", b.id()));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn closed_registry_refuses_entries() {
        let registry = ConnectionRegistry::new();
        let (conn, _server) = loopback(ConnectionId(0)).await;
        registry.register_with("a", |_| conn.clone()).unwrap();
        let drained = registry.close_all();
        assert_eq!(drained.len(), 1);
        assert!(registry.is_closed());
        let mut built = false;
        let res = registry.register_with("b", |_| {
            built = true;
            conn.clone()
        });
        assert!(matches!(res, Err(TransportError::Closed)));
        assert!(!built);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn close_shuts_the_socket() {
        use tokio::io::AsyncReadExt;
        let (conn, mut server) = loopback(ConnectionId(0)).await;
        conn.close();
        let mut buf = [0u8; 1];
        let n = server.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert!(conn.send(&Message::file_request("", "x")).await.is_err());
    }
}
