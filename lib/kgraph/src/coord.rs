//! Thin client over an external hierarchical key-value tree with watches.
//! The engine talks to the store exclusively through [`CoordinationClient`],
//! which layers session tracking, bounded retry, and idempotent create/delete
//! on top of whatever backend implements [`CoordinationStore`].

use crate::error::{coordination_error, job_aborted, PregelError};
use crossbeam_channel::Receiver;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Deleted when the creating session closes.
    Ephemeral,
    /// Ephemeral, with a monotonically increasing suffix appended to the name.
    EphemeralSequential,
}

#[derive(Debug)]
pub enum CoordError {
    NotFound(String),
    AlreadyExists(String),
    NotEmpty(String),
    Transient(String),
    SessionExpired(String),
    Io(String),
}

impl fmt::Display for CoordError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CoordError::NotFound(p) => write!(f, "no node at {}", p),
            CoordError::AlreadyExists(p) => write!(f, "node already exists at {}", p),
            CoordError::NotEmpty(p) => write!(f, "node at {} has children", p),
            CoordError::Transient(m) => write!(f, "transient coordination error: {}", m),
            CoordError::SessionExpired(m) => write!(f, "coordination session expired: {}", m),
            CoordError::Io(m) => write!(f, "coordination io error: {}", m),
        }
    }
}

impl std::error::Error for CoordError {}

impl From<CoordError> for PregelError {
    fn from(err: CoordError) -> Self {
        match err {
            CoordError::SessionExpired(_) => job_aborted(err.to_string()),
            other => coordination_error(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeEventKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct TreeEvent {
    pub kind: TreeEventKind,
    pub path: String,
    pub data: Vec<u8>,
}

pub type SessionId = u64;

/// Backend contract. Paths are absolute, `/`-separated, without a trailing
/// slash. `create` materializes missing parent containers; `delete` of a
/// deleted subtree root is reported to watchers as a single event for the
/// root of the deletion.
pub trait CoordinationStore: Send + Sync {
    /// Returns the actual path (differs from the requested one for
    /// sequential nodes).
    fn create(
        &self,
        session: SessionId,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, CoordError>;
    fn exists(&self, path: &str) -> Result<bool, CoordError>;
    fn get_data(&self, path: &str) -> Result<Vec<u8>, CoordError>;
    fn set_data(&self, path: &str, data: &[u8]) -> Result<(), CoordError>;
    fn delete(&self, path: &str) -> Result<(), CoordError>;
    fn delete_recursive(&self, path: &str) -> Result<(), CoordError>;
    /// `None` when the node itself does not exist, mirroring the server's
    /// null contract for children queries.
    fn children(&self, path: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>, CoordError>;
    /// Every node at or below `path`, with data.
    fn snapshot(&self, path: &str) -> Result<Vec<(String, Vec<u8>)>, CoordError>;
    /// Events for `path` and its subtree, from subscription time onward.
    fn subscribe(&self, path: &str) -> Receiver<TreeEvent>;
    fn open_session(&self) -> SessionId;
    /// Drops the session's ephemeral nodes.
    fn close_session(&self, session: SessionId) -> Result<(), CoordError>;
}

/// Bounded exponential backoff for transient errors, base 1s, 3 attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { base: Duration::from_secs(1), max_attempts: 3 }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.base * 2u32.saturating_pow(attempt)
    }
}

pub struct CoordinationClient {
    store: Arc<dyn CoordinationStore>,
    session: SessionId,
    retry: RetryPolicy,
}

impl CoordinationClient {
    pub fn connect(store: Arc<dyn CoordinationStore>) -> Self {
        Self::with_retry(store, RetryPolicy::default())
    }

    pub fn with_retry(store: Arc<dyn CoordinationStore>, retry: RetryPolicy) -> Self {
        let session = store.open_session();
        CoordinationClient { store, session, retry }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn store(&self) -> Arc<dyn CoordinationStore> {
        Arc::clone(&self.store)
    }

    fn run<T>(&self, op: impl Fn() -> Result<T, CoordError>) -> Result<T, CoordError> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(CoordError::Transient(m)) if attempt + 1 < self.retry.max_attempts => {
                    attempt += 1;
                    let delay = self.retry.backoff(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying: {}", m);
                    thread::sleep(delay);
                }
                other => return other,
            }
        }
    }

    /// Create, swallowing `AlreadyExists`.
    pub fn ensure(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<(), CoordError> {
        match self.run(|| self.store.create(self.session, path, data, mode)) {
            Ok(_) => Ok(()),
            Err(CoordError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String, CoordError> {
        self.run(|| self.store.create(self.session, path, data, mode))
    }

    pub fn exists(&self, path: &str) -> Result<bool, CoordError> {
        self.run(|| self.store.exists(path))
    }

    pub fn get_data(&self, path: &str) -> Result<Vec<u8>, CoordError> {
        self.run(|| self.store.get_data(path))
    }

    pub fn set_data(&self, path: &str, data: &[u8]) -> Result<(), CoordError> {
        self.run(|| self.store.set_data(path, data))
    }

    /// Delete, swallowing `NotFound`.
    pub fn remove(&self, path: &str) -> Result<(), CoordError> {
        match self.run(|| self.store.delete(path)) {
            Ok(()) | Err(CoordError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Recursive delete, swallowing `NotFound`.
    pub fn remove_recursive(&self, path: &str) -> Result<(), CoordError> {
        match self.run(|| self.store.delete_recursive(path)) {
            Ok(()) | Err(CoordError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn children(&self, path: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>, CoordError> {
        self.run(|| self.store.children(path))
    }

    pub fn snapshot(&self, path: &str) -> Result<Vec<(String, Vec<u8>)>, CoordError> {
        self.run(|| self.store.snapshot(path))
    }

    pub fn subscribe(&self, path: &str) -> Receiver<TreeEvent> {
        self.store.subscribe(path)
    }
}

impl Drop for CoordinationClient {
    fn drop(&mut self) {
        if let Err(e) = self.store.close_session(self.session) {
            warn!("closing coordination session: {}", e);
        }
    }
}

/// Locally cached view of a subtree, seeded from a snapshot and kept current
/// by watch events. Queries never touch the server.
pub struct TreeCache {
    nodes: BTreeMap<String, Vec<u8>>,
    rx: Receiver<TreeEvent>,
}

impl TreeCache {
    pub fn new(client: &CoordinationClient, root: &str) -> Result<Self, CoordError> {
        // Subscribe first so no event between snapshot and subscription is lost;
        // replayed events are idempotent upserts.
        let rx = client.subscribe(root);
        let mut nodes = BTreeMap::new();
        for (path, data) in client.snapshot(root)? {
            nodes.insert(path, data);
        }
        Ok(TreeCache { nodes, rx })
    }

    fn apply(&mut self, event: TreeEvent) {
        match event.kind {
            TreeEventKind::Created | TreeEventKind::Updated => {
                self.nodes.insert(event.path, event.data);
            }
            TreeEventKind::Deleted => {
                self.nodes.remove(&event.path);
                let prefix = format!("{}/", event.path);
                let stale: Vec<String> = self
                    .nodes
                    .range(prefix.clone()..)
                    .take_while(|(k, _)| k.starts_with(&prefix))
                    .map(|(k, _)| k.clone())
                    .collect();
                for k in stale {
                    self.nodes.remove(&k);
                }
            }
        }
    }

    /// Drain all pending events into the mirror.
    pub fn refresh(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.apply(event);
        }
    }

    /// Block until at least one event arrives (then drain the rest), or the
    /// timeout elapses. Returns whether anything changed.
    pub fn await_change(&mut self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => {
                self.apply(event);
                self.refresh();
                true
            }
            Err(_) => false,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn data(&self, path: &str) -> Option<&[u8]> {
        self.nodes.get(path).map(Vec::as_slice)
    }

    /// Direct children with data; `None` when the node itself is absent.
    pub fn children_of(&self, path: &str) -> Option<BTreeMap<String, Vec<u8>>> {
        if !self.nodes.contains_key(path) {
            return None;
        }
        let prefix = format!("{}/", path);
        let mut out = BTreeMap::new();
        for (k, v) in self.nodes.range(prefix.clone()..) {
            if !k.starts_with(&prefix) {
                break;
            }
            let rest = &k[prefix.len()..];
            if !rest.contains('/') {
                out.insert(rest.to_string(), v.clone());
            }
        }
        Some(out)
    }
}
