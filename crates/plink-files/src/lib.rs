//! Virtual filesystem for the printer SDK.
//!
//! Storages (SD card, USB, internal space) mount under a synthetic root `/`.
//! The in-memory tree is authoritative for everything emitted to the service;
//! physical bytes are reached only through the [`StorageBackend`] seam.
//! Mutations emit `FILE_CHANGED` / `MEDIUM_*` events through an injected
//! sink, and printable files get a lazily computed metadata sidecar.

mod backend;
mod error;
mod metadata;
mod node;
mod validate;
mod watcher;

pub use backend::{BoxedBackend, BoxedReader, BoxedWriter, EntryStat, LocalStorage, SpaceInfo, StorageBackend};
pub use error::FsError;
pub use metadata::{MetadataCache, MetadataExtractor, MetadataRecord, NoopExtractor};
pub use node::{NodeInfo, StorageMeta};
pub use validate::{is_gcode, is_hidden, validate_name, FORBIDDEN_CHARS, MAX_NAME_BYTES};
pub use watcher::{FilesystemWatcher, PollingWatcher, WatchEvent};

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use plink_protocol::{Event, EventKind, FileChangeKind, FileIndex, Source, StorageType};
use serde_json::{json, Value};
use tracing::{debug, warn};

use node::Tree;
use validate::split_path;

/// Where filesystem-originated events go (the printer's event queue).
pub type EventSink = Arc<dyn Fn(Event) + Send + Sync>;

/// Wall-clock seconds since the epoch, signed to stay correct past 2038.
pub fn now_timestamp() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        Err(_) => 0,
    }
}

/// Serialized view produced by [`Filesystem::get_info`].
#[derive(Clone, Debug)]
pub struct FsInfo {
    /// Flat path-keyed file index, the current wire format.
    pub files: FileIndex,
    /// Nested tree for servers predating the flat index.
    pub legacy: Value,
}

pub struct Filesystem {
    tree: RwLock<Tree>,
    backend: BoxedBackend,
    cache: MetadataCache,
    sink: Mutex<Option<EventSink>>,
}

impl Filesystem {
    pub fn new(backend: BoxedBackend) -> Self {
        Self::with_extractor(backend, Box::new(NoopExtractor))
    }

    pub fn with_extractor(backend: BoxedBackend, extractor: Box<dyn MetadataExtractor>) -> Self {
        Self {
            tree: RwLock::new(Tree::new()),
            backend,
            cache: MetadataCache::new(extractor),
            sink: Mutex::new(None),
        }
    }

    /// Wire the event sink. Events raised before this are dropped.
    pub fn set_event_sink(&self, sink: EventSink) {
        *self.sink.lock().expect("sink lock") = Some(sink);
    }

    pub fn backend(&self) -> &BoxedBackend {
        &self.backend
    }

    fn emit(&self, event: Event) {
        if let Some(sink) = self.sink.lock().expect("sink lock").as_ref() {
            sink(event);
        }
    }

    /// Mount an empty storage root. Fails when `name` is taken.
    pub fn mount(
        &self,
        name: &str,
        storage_type: StorageType,
        physical_root: impl Into<PathBuf>,
        read_only: bool,
    ) -> Result<(), FsError> {
        let meta = StorageMeta {
            storage_type,
            path_storage: physical_root.into(),
            free_space: 0,
            total_space: 0,
            last_updated: now_timestamp(),
        };
        let listing = {
            let mut tree = self.tree.write().expect("fs lock");
            let id = tree.mount(name, meta, read_only, now_timestamp())?;
            tree.legacy_node(id)
        };
        self.emit(
            Event::new(EventKind::MediumInserted, Source::Wui)
                .with_data("root", json!(format!("/{name}")))
                .with_data("files", listing),
        );
        Ok(())
    }

    /// Walk `physical_root` through the backend, then mount the populated
    /// tree under `name`.
    pub async fn from_dir(
        &self,
        physical_root: impl Into<PathBuf>,
        name: &str,
        storage_type: StorageType,
    ) -> Result<(), FsError> {
        let root: PathBuf = physical_root.into();
        let root_stat = self.backend.stat(&root).await?;
        let space = self.backend.statvfs(&root).await.unwrap_or_default();
        let meta = StorageMeta {
            storage_type,
            path_storage: root.clone(),
            free_space: space.free,
            total_space: space.total,
            last_updated: now_timestamp(),
        };
        // Scan first so a failed walk leaves nothing half-mounted.
        let mut found: Vec<(Vec<String>, EntryStat)> = Vec::new();
        let mut stack = vec![(root.clone(), Vec::<String>::new())];
        while let Some((dir, rel)) = stack.pop() {
            for (entry_name, stat) in self.backend.listdir(&dir).await? {
                let mut entry_rel = rel.clone();
                entry_rel.push(entry_name.clone());
                if stat.is_dir {
                    stack.push((dir.join(&entry_name), entry_rel.clone()));
                }
                found.push((entry_rel, stat));
            }
        }
        let listing = {
            let mut tree = self.tree.write().expect("fs lock");
            let id = tree.mount(name, meta, root_stat.read_only, root_stat.m_timestamp)?;
            for (rel, stat) in found {
                let mut segments: Vec<&str> = vec![name];
                segments.extend(rel.iter().map(String::as_str));
                let outcome = if stat.is_dir {
                    tree.mkdir(&segments, true, stat.m_timestamp).map(|_| ())
                } else {
                    tree.upsert_file(&segments, stat.size, stat.m_timestamp, stat.read_only)
                        .map(|_| ())
                };
                if let Err(err) = outcome {
                    // Physical names the virtual model refuses stay invisible.
                    debug!("skipping {:?}: {err}", rel);
                }
            }
            tree.legacy_node(id)
        };
        self.emit(
            Event::new(EventKind::MediumInserted, Source::Wui)
                .with_data("root", json!(format!("/{name}")))
                .with_data("files", listing),
        );
        Ok(())
    }

    pub fn unmount(&self, name: &str) -> Result<(), FsError> {
        self.tree.write().expect("fs lock").unmount(name)?;
        self.emit(
            Event::new(EventKind::MediumEjected, Source::Wui)
                .with_data("root", json!(format!("/{name}"))),
        );
        Ok(())
    }

    pub fn get(&self, path: &str) -> Result<NodeInfo, FsError> {
        let tree = self.tree.read().expect("fs lock");
        let id = tree
            .resolve(&split_path(path))
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        Ok(tree.info(id))
    }

    /// Create a folder; no-op when it already exists. With `force`, missing
    /// parents are created as well.
    pub fn create_folder(&self, path: &str, force: bool) -> Result<bool, FsError> {
        let segments = split_path(path);
        let mut tree = self.tree.write().expect("fs lock");
        let (_, created) = tree.mkdir(&segments, force, now_timestamp())?;
        Ok(created)
    }

    /// Record a file in the tree (new or refreshed attributes).
    pub fn add_file(
        &self,
        path: &str,
        size: u64,
        m_timestamp: i64,
        read_only: bool,
    ) -> Result<(NodeInfo, bool), FsError> {
        let segments = split_path(path);
        let mut tree = self.tree.write().expect("fs lock");
        let (id, created) = tree.upsert_file(&segments, size, m_timestamp, read_only)?;
        Ok((tree.info(id), created))
    }

    /// Remove a node from the tree. Non-empty folders need `force`.
    pub fn delete(&self, path: &str, force: bool) -> Result<NodeInfo, FsError> {
        let segments = split_path(path);
        let mut tree = self.tree.write().expect("fs lock");
        let id = tree
            .resolve(&segments)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        let info = tree.info(id);
        tree.remove(&segments, force)?;
        Ok(info)
    }

    /// Serialize the visible tree for `SEND_INFO`.
    pub fn get_info(&self) -> FsInfo {
        let tree = self.tree.read().expect("fs lock");
        FsInfo {
            files: tree.flat_index(),
            legacy: tree.legacy_dict(),
        }
    }

    pub fn get_space_info(&self, storage: &str) -> Result<SpaceInfo, FsError> {
        let tree = self.tree.read().expect("fs lock");
        let meta = tree
            .storage_meta(storage)
            .ok_or_else(|| FsError::NotMounted(storage.to_string()))?;
        Ok(SpaceInfo {
            free: meta.free_space,
            total: meta.total_space,
        })
    }

    /// Query the backend for fresh space numbers and store them on the root.
    pub async fn refresh_space(&self, storage: &str) -> Result<SpaceInfo, FsError> {
        let root = {
            let tree = self.tree.read().expect("fs lock");
            tree.storage_meta(storage)
                .ok_or_else(|| FsError::NotMounted(storage.to_string()))?
                .path_storage
                .clone()
        };
        let space = self.backend.statvfs(&root).await?;
        self.tree
            .write()
            .expect("fs lock")
            .set_space(storage, space.free, space.total, now_timestamp())?;
        Ok(space)
    }

    /// Emit `FILE_CHANGED` for `path` unless the node is hidden.
    pub fn emit_file_changed(&self, path: &str, kind: FileChangeKind) {
        let info = self.get(path).ok();
        if let Some(info) = &info {
            if info.hidden {
                return;
            }
        } else if split_path(path).iter().any(|s| is_hidden(s)) {
            return;
        }
        let mut event = Event::new(EventKind::FileChanged, Source::Wui)
            .with_data("path", json!(path))
            .with_data("kind", serde_json::to_value(kind).unwrap_or(Value::Null));
        if kind != FileChangeKind::Deleted {
            if let Some(info) = info {
                event = event
                    .with_data("size", json!(info.size))
                    .with_data("m_timestamp", json!(info.m_timestamp))
                    .with_data("ro", json!(info.read_only));
            }
        }
        self.emit(event);
    }

    /// Mount name owning `path`.
    pub fn storage_of(&self, path: &str) -> Result<String, FsError> {
        let segments = split_path(path);
        let first = segments
            .first()
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        let tree = self.tree.read().expect("fs lock");
        if tree.storage_meta(first).is_none() {
            return Err(FsError::NotMounted((*first).to_string()));
        }
        Ok((*first).to_string())
    }

    /// Translate a virtual path to the physical one, refusing escapes.
    pub fn to_os_path(&self, path: &str) -> Result<PathBuf, FsError> {
        let segments = split_path(path);
        let (first, rest) = segments
            .split_first()
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if rest
            .iter()
            .any(|s| matches!(Path::new(s).components().next(), Some(Component::ParentDir | Component::CurDir)))
        {
            return Err(FsError::OutsideStorage((*first).to_string()));
        }
        let tree = self.tree.read().expect("fs lock");
        let meta = tree
            .storage_meta(first)
            .ok_or_else(|| FsError::NotMounted((*first).to_string()))?;
        let mut os_path = meta.path_storage.clone();
        for segment in rest {
            os_path.push(segment);
        }
        Ok(os_path)
    }

    /// Translate a physical path back into the virtual namespace, if it lies
    /// under a mounted storage.
    pub fn virtual_path_for(&self, os_path: &Path) -> Option<String> {
        let tree = self.tree.read().expect("fs lock");
        let names: Vec<String> = tree.mounts().map(|(name, _)| name.clone()).collect();
        for name in names {
            let meta = match tree.storage_meta(&name) {
                Some(meta) => meta,
                None => continue,
            };
            if let Ok(rel) = os_path.strip_prefix(&meta.path_storage) {
                let mut virt = format!("/{name}");
                for comp in rel.components() {
                    if let Component::Normal(part) = comp {
                        virt.push('/');
                        virt.push_str(&part.to_string_lossy());
                    }
                }
                return Some(virt);
            }
        }
        None
    }

    /// Metadata for a printable file, via the sidecar cache.
    pub async fn metadata(&self, path: &str) -> Result<Option<MetadataRecord>, FsError> {
        let info = self.get(path)?;
        if info.is_dir {
            return Err(FsError::NotAFile(path.to_string()));
        }
        if info.hidden || !is_gcode(&info.name) {
            return Ok(None);
        }
        let os_path = self.to_os_path(path)?;
        Ok(self
            .cache
            .lookup(&self.backend, &os_path, info.m_timestamp, info.size)
            .await)
    }

    pub async fn invalidate_metadata(&self, path: &str) {
        if let Ok(os_path) = self.to_os_path(path) {
            self.cache.invalidate(&self.backend, &os_path).await;
        }
    }

    /// Fold one watcher observation into the tree, emitting `FILE_CHANGED`
    /// and keeping the metadata cache honest.
    pub async fn apply_watch_event(&self, event: &WatchEvent) {
        let Some(virt) = self.virtual_path_for(event.path()) else {
            warn!("watch event outside mounts: {:?}", event.path());
            return;
        };
        match event {
            WatchEvent::Created { stat, .. } => {
                let outcome = if stat.is_dir {
                    self.create_folder(&virt, true).map(|_| ())
                } else {
                    self.add_file(&virt, stat.size, stat.m_timestamp, stat.read_only)
                        .map(|_| ())
                };
                match outcome {
                    Ok(()) => self.emit_file_changed(&virt, FileChangeKind::Created),
                    Err(err) => debug!("watch create ignored for {virt}: {err}"),
                }
            }
            WatchEvent::Modified { stat, .. } => {
                if stat.is_dir {
                    return;
                }
                match self.add_file(&virt, stat.size, stat.m_timestamp, stat.read_only) {
                    Ok(_) => {
                        self.invalidate_metadata(&virt).await;
                        self.emit_file_changed(&virt, FileChangeKind::Modified);
                    }
                    Err(err) => debug!("watch modify ignored for {virt}: {err}"),
                }
            }
            WatchEvent::Deleted { .. } => {
                self.invalidate_metadata(&virt).await;
                match self.delete(&virt, true) {
                    Ok(info) => {
                        if !info.hidden {
                            self.emit_file_changed(&virt, FileChangeKind::Deleted);
                        }
                    }
                    Err(err) => debug!("watch delete ignored for {virt}: {err}"),
                }
            }
        }
    }
}
