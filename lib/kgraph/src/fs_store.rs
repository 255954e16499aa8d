//! File-backed in-process implementation of [`CoordinationStore`]. A node is
//! a directory under the store root, node data lives in a `.data` file, and
//! children are subdirectories. Sequential suffixes come from a per-parent
//! `.seq` counter file. Watches are dispatched in-process: all workers of a
//! local job share one store instance.

use crate::coord::{
    CoordError, CoordinationStore, CreateMode, SessionId, TreeEvent, TreeEventKind,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;
use walkdir::WalkDir;

const DATA_FILE: &str = ".data";
const SEQ_FILE: &str = ".seq";

struct Watcher {
    prefix: String,
    tx: Sender<TreeEvent>,
}

#[derive(Default)]
struct StoreState {
    next_session: SessionId,
    ephemerals: HashMap<SessionId, Vec<String>>,
    watchers: Vec<Watcher>,
}

pub struct FsCoordinationStore {
    root: PathBuf,
    state: Mutex<StoreState>,
}

impl FsCoordinationStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CoordError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| CoordError::Io(format!("{}: {}", root.display(), e)))?;
        Ok(FsCoordinationStore { root, state: Mutex::new(StoreState::default()) })
    }

    /// Open the store rooted at the configured `coordination.connect`
    /// directory.
    pub fn from_config(config: &crate::config::PregelConfig) -> Result<Self, CoordError> {
        match config.coordination_connect() {
            Some(dir) => Self::open(dir),
            None => Err(CoordError::Io(format!(
                "'{}' is not set",
                crate::config::COORDINATION_CONNECT
            ))),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().expect("store mutex poisoned")
    }

    fn fs_path(&self, path: &str) -> Result<PathBuf, CoordError> {
        validate(path)?;
        Ok(self.root.join(&path[1..]))
    }

    fn logical_path(&self, fs_path: &Path) -> Option<String> {
        let rel = fs_path.strip_prefix(&self.root).ok()?;
        let mut out = String::new();
        for part in rel.components() {
            out.push('/');
            out.push_str(&part.as_os_str().to_string_lossy());
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    fn notify(&self, state: &mut StoreState, kind: TreeEventKind, path: &str, data: &[u8]) {
        let event = TreeEvent { kind, path: path.to_string(), data: data.to_vec() };
        state.watchers.retain(|w| {
            let matches = path == w.prefix || path.starts_with(&format!("{}/", w.prefix));
            if matches {
                w.tx.send(event.clone()).is_ok()
            } else {
                true
            }
        });
    }

    fn read_data(&self, dir: &Path) -> Vec<u8> {
        fs::read(dir.join(DATA_FILE)).unwrap_or_default()
    }

    fn next_sequence(&self, parent: &Path) -> Result<u64, CoordError> {
        let seq_path = parent.join(SEQ_FILE);
        let current = fs::read_to_string(&seq_path)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);
        fs::write(&seq_path, format!("{}", current + 1))
            .map_err(|e| CoordError::Io(format!("{}: {}", seq_path.display(), e)))?;
        Ok(current)
    }

    fn forget_ephemerals(state: &mut StoreState, path: &str) {
        let prefix = format!("{}/", path);
        for paths in state.ephemerals.values_mut() {
            paths.retain(|p| p != path && !p.starts_with(&prefix));
        }
    }
}

fn validate(path: &str) -> Result<(), CoordError> {
    let well_formed = path.starts_with('/')
        && !path.ends_with('/')
        && path[1..].split('/').all(|part| !part.is_empty() && !part.starts_with('.'));
    if well_formed {
        Ok(())
    } else {
        Err(CoordError::Io(format!("malformed path '{}'", path)))
    }
}

impl CoordinationStore for FsCoordinationStore {
    fn create(
        &self,
        session: SessionId,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, CoordError> {
        let fs_path = self.fs_path(path)?;
        let mut state = self.lock();
        let (fs_path, path) = match mode {
            CreateMode::EphemeralSequential => {
                let parent = fs_path
                    .parent()
                    .ok_or_else(|| CoordError::Io(format!("no parent for '{}'", path)))?
                    .to_path_buf();
                fs::create_dir_all(&parent)
                    .map_err(|e| CoordError::Io(format!("{}: {}", parent.display(), e)))?;
                let seq = self.next_sequence(&parent)?;
                let actual = format!("{}{:010}", path, seq);
                (self.fs_path(&actual)?, actual)
            }
            _ => (fs_path, path.to_string()),
        };
        if fs_path.is_dir() {
            return Err(CoordError::AlreadyExists(path));
        }
        if let Some(parent) = fs_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CoordError::Io(format!("{}: {}", parent.display(), e)))?;
        }
        fs::create_dir(&fs_path).map_err(|e| CoordError::Io(format!("{}: {}", fs_path.display(), e)))?;
        if !data.is_empty() {
            fs::write(fs_path.join(DATA_FILE), data)
                .map_err(|e| CoordError::Io(format!("{}: {}", fs_path.display(), e)))?;
        }
        if matches!(mode, CreateMode::Ephemeral | CreateMode::EphemeralSequential) {
            state.ephemerals.entry(session).or_default().push(path.clone());
        }
        debug!(path = %path, "created node");
        self.notify(&mut state, TreeEventKind::Created, &path, data);
        Ok(path)
    }

    fn exists(&self, path: &str) -> Result<bool, CoordError> {
        Ok(self.fs_path(path)?.is_dir())
    }

    fn get_data(&self, path: &str) -> Result<Vec<u8>, CoordError> {
        let fs_path = self.fs_path(path)?;
        if !fs_path.is_dir() {
            return Err(CoordError::NotFound(path.to_string()));
        }
        Ok(self.read_data(&fs_path))
    }

    fn set_data(&self, path: &str, data: &[u8]) -> Result<(), CoordError> {
        let fs_path = self.fs_path(path)?;
        let mut state = self.lock();
        if !fs_path.is_dir() {
            return Err(CoordError::NotFound(path.to_string()));
        }
        fs::write(fs_path.join(DATA_FILE), data)
            .map_err(|e| CoordError::Io(format!("{}: {}", fs_path.display(), e)))?;
        self.notify(&mut state, TreeEventKind::Updated, path, data);
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<(), CoordError> {
        let fs_path = self.fs_path(path)?;
        let mut state = self.lock();
        if !fs_path.is_dir() {
            return Err(CoordError::NotFound(path.to_string()));
        }
        let has_children = fs::read_dir(&fs_path)
            .map_err(|e| CoordError::Io(format!("{}: {}", fs_path.display(), e)))?
            .filter_map(|e| e.ok())
            .any(|e| e.path().is_dir());
        if has_children {
            return Err(CoordError::NotEmpty(path.to_string()));
        }
        fs::remove_dir_all(&fs_path)
            .map_err(|e| CoordError::Io(format!("{}: {}", fs_path.display(), e)))?;
        FsCoordinationStore::forget_ephemerals(&mut state, path);
        debug!(path = %path, "deleted node");
        self.notify(&mut state, TreeEventKind::Deleted, path, &[]);
        Ok(())
    }

    fn delete_recursive(&self, path: &str) -> Result<(), CoordError> {
        let fs_path = self.fs_path(path)?;
        let mut state = self.lock();
        if !fs_path.is_dir() {
            return Err(CoordError::NotFound(path.to_string()));
        }
        fs::remove_dir_all(&fs_path)
            .map_err(|e| CoordError::Io(format!("{}: {}", fs_path.display(), e)))?;
        FsCoordinationStore::forget_ephemerals(&mut state, path);
        debug!(path = %path, "deleted subtree");
        self.notify(&mut state, TreeEventKind::Deleted, path, &[]);
        Ok(())
    }

    fn children(&self, path: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>, CoordError> {
        let fs_path = self.fs_path(path)?;
        let _state = self.lock();
        if !fs_path.is_dir() {
            return Ok(None);
        }
        let mut out = BTreeMap::new();
        let entries = fs::read_dir(&fs_path)
            .map_err(|e| CoordError::Io(format!("{}: {}", fs_path.display(), e)))?;
        for entry in entries.filter_map(|e| e.ok()) {
            if entry.path().is_dir() {
                let name = entry.file_name().to_string_lossy().into_owned();
                out.insert(name, self.read_data(&entry.path()));
            }
        }
        Ok(Some(out))
    }

    fn snapshot(&self, path: &str) -> Result<Vec<(String, Vec<u8>)>, CoordError> {
        let fs_path = self.fs_path(path)?;
        let _state = self.lock();
        let mut out = Vec::new();
        if !fs_path.is_dir() {
            return Ok(out);
        }
        for entry in WalkDir::new(&fs_path).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_dir() {
                if let Some(logical) = self.logical_path(entry.path()) {
                    out.push((logical, self.read_data(entry.path())));
                }
            }
        }
        Ok(out)
    }

    fn subscribe(&self, path: &str) -> Receiver<TreeEvent> {
        let (tx, rx) = unbounded();
        self.lock().watchers.push(Watcher { prefix: path.to_string(), tx });
        rx
    }

    fn open_session(&self) -> SessionId {
        let mut state = self.lock();
        state.next_session += 1;
        state.next_session
    }

    fn close_session(&self, session: SessionId) -> Result<(), CoordError> {
        let mut state = self.lock();
        let paths = state.ephemerals.remove(&session).unwrap_or_default();
        for path in paths {
            if let Ok(fs_path) = self.fs_path(&path) {
                if fs_path.is_dir() {
                    fs::remove_dir_all(&fs_path)
                        .map_err(|e| CoordError::Io(format!("{}: {}", fs_path.display(), e)))?;
                    debug!(path = %path, session, "expired ephemeral node");
                    self.notify(&mut state, TreeEventKind::Deleted, &path, &[]);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::CoordinationClient;
    use std::sync::Arc;

    fn temp_store(name: &str) -> (PathBuf, Arc<FsCoordinationStore>) {
        let dir = std::env::temp_dir().join(format!("kgraph-fs-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let store = Arc::new(FsCoordinationStore::open(&dir).unwrap());
        (dir, store)
    }

    #[test]
    fn create_read_delete_roundtrip() {
        let (dir, store) = temp_store("crud");
        let client = CoordinationClient::connect(store.clone());

        client.ensure("/jobs", &[], CreateMode::Persistent).unwrap();
        client.ensure("/jobs/a", b"payload", CreateMode::Persistent).unwrap();
        assert!(client.exists("/jobs/a").unwrap());
        assert_eq!(client.get_data("/jobs/a").unwrap(), b"payload");

        // idempotent re-create and missing-node delete
        client.ensure("/jobs/a", b"other", CreateMode::Persistent).unwrap();
        assert_eq!(client.get_data("/jobs/a").unwrap(), b"payload");
        client.remove("/jobs/missing").unwrap();

        let children = client.children("/jobs").unwrap().unwrap();
        assert_eq!(children.len(), 1);
        assert!(client.children("/nothing").unwrap().is_none());

        client.remove("/jobs/a").unwrap();
        assert!(!client.exists("/jobs/a").unwrap());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn parents_are_materialized() {
        let (dir, store) = temp_store("parents");
        let client = CoordinationClient::connect(store);
        client.ensure("/a/b/c", &[], CreateMode::Persistent).unwrap();
        assert!(client.exists("/a/b").unwrap());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn delete_refuses_non_empty_nodes() {
        let (dir, store) = temp_store("nonempty");
        let client = CoordinationClient::connect(store);
        client.ensure("/a/b", &[], CreateMode::Persistent).unwrap();
        assert!(matches!(client.store().delete("/a"), Err(CoordError::NotEmpty(_))));
        client.remove_recursive("/a").unwrap();
        assert!(!client.exists("/a").unwrap());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn sequential_nodes_are_ordered() {
        let (dir, store) = temp_store("seq");
        let client = CoordinationClient::connect(store);
        let first = client.create("/election/member-", &[], CreateMode::EphemeralSequential).unwrap();
        let second = client.create("/election/member-", &[], CreateMode::EphemeralSequential).unwrap();
        assert!(first < second);
        assert_eq!(client.children("/election").unwrap().unwrap().len(), 2);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn ephemerals_vanish_with_their_session() {
        let (dir, store) = temp_store("ephemeral");
        let holder = CoordinationClient::connect(store.clone());
        let observer = CoordinationClient::connect(store.clone());
        holder.ensure("/live/w0", &[], CreateMode::Ephemeral).unwrap();
        assert!(observer.exists("/live/w0").unwrap());
        drop(holder);
        assert!(!observer.exists("/live/w0").unwrap());
        // the parent container stays
        assert!(observer.exists("/live").unwrap());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn watches_feed_the_tree_cache() {
        use crate::coord::TreeCache;
        let (dir, store) = temp_store("watch");
        let client = CoordinationClient::connect(store.clone());
        client.ensure("/job", &[], CreateMode::Persistent).unwrap();
        client.ensure("/job/before", b"1", CreateMode::Persistent).unwrap();

        let mut cache = TreeCache::new(&client, "/job").unwrap();
        assert!(cache.exists("/job/before"));

        client.ensure("/job/after", b"2", CreateMode::Persistent).unwrap();
        client.set_data("/job/before", b"3").unwrap();
        cache.refresh();
        assert_eq!(cache.data("/job/after"), Some(&b"2"[..]));
        assert_eq!(cache.data("/job/before"), Some(&b"3"[..]));

        client.remove_recursive("/job/after").unwrap();
        cache.refresh();
        assert!(!cache.exists("/job/after"));
        let children = cache.children_of("/job").unwrap();
        assert_eq!(children.keys().collect::<Vec<_>>(), vec!["before"]);
        let _ = fs::remove_dir_all(dir);
    }
}
