//! Peer orchestrator: serves file requests from the shared directory, writes file
//! responses into the received directory, and issues outbound requests with retry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ferry_core::{FileRequest, FileResponse, Message, Payload, RequestId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{FileStore, StoreError};
use crate::transport::{TcpTransport, TransportError};

/// Bounded retry for outbound requests: `attempts` sends, `interval` between failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Logical id, sent as `from` on every message.
    pub id: String,
    pub listen_addr: String,
    pub shared_dir: PathBuf,
    pub received_dir: PathBuf,
    pub retry: RetryPolicy,
    /// How long an unanswered request is remembered.
    pub request_ttl: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("file {0} is not in the shared directory")]
    FileNotShared(String),
    #[error("failed to reach {addr} after {attempts} attempts: {source}")]
    RetriesExhausted {
        addr: String,
        attempts: u32,
        source: TransportError,
    },
    #[error("peer already started")]
    AlreadyStarted,
}

struct Inner {
    id: String,
    listen_addr: String,
    store: FileStore,
    transport: TcpTransport,
    retry: RetryPolicy,
    request_ttl: Duration,
    /// Requests whose response has not arrived yet, with the time they were issued.
    outstanding: Mutex<HashMap<RequestId, (String, Instant)>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

/// A node in the network. Cheap to clone.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<Inner>,
}

impl Peer {
    /// Create the shared and received directories and bind the peer to `transport`.
    pub async fn new(config: PeerConfig, transport: TcpTransport) -> Result<Self, PeerError> {
        let store = FileStore::open(config.shared_dir, config.received_dir).await?;
        Ok(Self {
            inner: Arc::new(Inner {
                id: config.id,
                listen_addr: config.listen_addr,
                store,
                transport,
                retry: config.retry,
                request_ttl: config.request_ttl,
                outstanding: Mutex::new(HashMap::new()),
                dispatch: Mutex::new(None),
            }),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.local_addr()
    }

    /// Start listening and spawn the inbound dispatch loop. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, PeerError> {
        let rx = self
            .inner
            .transport
            .messages()
            .ok_or(PeerError::AlreadyStarted)?;
        let local = self
            .inner
            .transport
            .start_listening(&self.inner.listen_addr)
            .await?;
        let inner = self.inner.clone();
        let handle = tokio::spawn(dispatch_loop(inner, rx));
        *lock(&self.inner.dispatch) = Some(handle);
        info!(id = %self.inner.id, %local, "peer started");
        Ok(local)
    }

    /// Ask `peer_addr` for `file_name`. Succeeds once the request is handed to the transport;
    /// the file itself arrives later through the dispatch loop.
    pub async fn request_file(&self, peer_addr: &str, file_name: &str) -> Result<(), PeerError> {
        let request_id = RequestId::new();
        let msg = Message {
            from: self.inner.id.clone(),
            from_addr: self.inner.listen_addr.clone(),
            payload: Payload::FileRequest(FileRequest {
                file_name: file_name.to_string(),
                request_id,
            }),
        };
        // Tracked before the first send: the response may be dispatched before send returns.
        self.inner.track(request_id, file_name);
        let policy = self.inner.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.transport.send(peer_addr, &msg).await {
                Ok(()) => {
                    info!(peer = peer_addr, file = file_name, %request_id, "file requested");
                    return Ok(());
                }
                Err(e) if attempt >= policy.attempts => {
                    lock(&self.inner.outstanding).remove(&request_id);
                    warn!(peer = peer_addr, file = file_name, attempts = attempt, error = %e, "giving up on request");
                    return Err(PeerError::RetriesExhausted {
                        addr: peer_addr.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    warn!(
                        peer = peer_addr,
                        attempt,
                        error = %e,
                        "request attempt failed, retrying in {:?}",
                        policy.interval
                    );
                    tokio::time::sleep(policy.interval).await;
                }
            }
        }
    }

    /// Check that `file_name` is available to requesting peers. Pushes nothing.
    pub async fn send_file(&self, file_name: &str) -> Result<(), PeerError> {
        if !self.inner.store.shared_exists(file_name).await? {
            return Err(PeerError::FileNotShared(file_name.to_string()));
        }
        info!(
            file = file_name,
            dir = %self.inner.store.shared_dir().display(),
            "ready to send file to any requesting peer"
        );
        Ok(())
    }

    /// Requests sent whose response has not been received.
    pub fn outstanding_requests(&self) -> usize {
        lock(&self.inner.outstanding).len()
    }

    /// Shut the transport down; the dispatch loop ends once the inbound queue drains.
    pub async fn shutdown(&self) {
        debug!(
            connections = self.inner.transport.connection_count(),
            "shutting down transport"
        );
        self.inner.transport.shutdown();
        let handle = lock(&self.inner.dispatch).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!(
            id = %self.inner.id,
            unanswered = self.outstanding_requests(),
            "peer stopped"
        );
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    /// Remember a request, forgetting those older than the request ttl.
    fn track(&self, request_id: RequestId, file_name: &str) {
        let ttl = self.request_ttl;
        let mut outstanding = lock(&self.outstanding);
        let before = outstanding.len();
        outstanding.retain(|_, (_, issued)| issued.elapsed() < ttl);
        let expired = before - outstanding.len();
        if expired > 0 {
            debug!(expired, "forgot unanswered requests");
        }
        outstanding.insert(request_id, (file_name.to_string(), Instant::now()));
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let Message {
            from,
            from_addr,
            payload,
        } = msg;
        match payload {
            Payload::FileRequest(req) => handle_file_request(&inner, &from, &from_addr, req).await,
            Payload::FileResponse(resp) => handle_file_response(&inner, &from, resp).await,
        }
    }
    debug!("inbound queue closed, dispatch loop exiting");
}

/// Missing or unreadable files are dropped without a reply.
async fn handle_file_request(inner: &Inner, from: &str, from_addr: &str, req: FileRequest) {
    info!(from, addr = from_addr, file = %req.file_name, "file request received");
    let data = match inner.store.read_shared(&req.file_name).await {
        Ok(data) => data,
        Err(e) => {
            warn!(file = %req.file_name, error = %e, "cannot serve file request");
            return;
        }
    };
    debug!(file = %req.file_name, size = data.len(), "read shared file");
    let name = req.file_name;
    let response = Message::file_response(
        inner.id.clone(),
        inner.listen_addr.clone(),
        FileResponse::new(name.clone(), data, req.request_id),
    );
    match inner.transport.send(from_addr, &response).await {
        Ok(()) => info!(file = %name, to = from_addr, "file sent"),
        Err(e) => warn!(file = %name, to = from_addr, error = %e, "failed to send file response"),
    }
}

async fn handle_file_response(inner: &Inner, from: &str, resp: FileResponse) {
    match lock(&inner.outstanding).remove(&resp.request_id) {
        Some((requested, _)) if requested != resp.name => {
            debug!(from, %requested, file = %resp.name, "response names a different file")
        }
        Some(_) => {}
        None => debug!(from, file = %resp.name, "response does not match an outstanding request"),
    }
    if resp.size != resp.data.len() as u64 {
        debug!(file = %resp.name, announced = resp.size, actual = resp.data.len(), "size field disagrees with data");
    }
    match inner.store.write_received(&resp.name, &resp.data).await {
        Ok(path) => info!(from, path = %path.display(), size = resp.data.len(), "file received and saved"),
        Err(e) => warn!(file = %resp.name, error = %e, "failed to save received file"),
    }
}
