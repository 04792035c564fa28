//! Arena-backed mount tree.
//!
//! Nodes live in a slab indexed by [`NodeId`]; parents and children refer to
//! each other by index only, so the tree has no ownership cycles and ids stay
//! stable across unrelated mutations.

use std::collections::BTreeMap;
use std::path::PathBuf;

use plink_protocol::{FileIndex, FileIndexEntry, StorageType};
use serde_json::{Map, Value};

use crate::error::FsError;
use crate::validate::{is_hidden, validate_name};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

#[derive(Clone, Debug)]
pub struct StorageMeta {
    pub storage_type: StorageType,
    /// Physical root this storage maps to.
    pub path_storage: PathBuf,
    pub free_space: u64,
    pub total_space: u64,
    pub last_updated: i64,
}

#[derive(Clone, Debug)]
pub(crate) enum NodeKind {
    File {
        size: u64,
    },
    Folder {
        children: BTreeMap<String, NodeId>,
        /// Present only on storage roots.
        storage: Option<StorageMeta>,
    },
}

#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub name: String,
    pub parent: Option<NodeId>,
    pub read_only: bool,
    pub m_timestamp: i64,
    pub kind: NodeKind,
}

impl Node {
    fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Folder { .. })
    }

    fn size(&self) -> u64 {
        match self.kind {
            NodeKind::File { size } => size,
            NodeKind::Folder { .. } => 0,
        }
    }
}

/// Snapshot of one node, safe to hand out without holding the tree lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub path: String,
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub m_timestamp: i64,
    pub read_only: bool,
    pub hidden: bool,
}

pub(crate) struct Tree {
    arena: Vec<Option<Node>>,
    free: Vec<u32>,
    mounts: BTreeMap<String, NodeId>,
}

impl Tree {
    pub fn new() -> Self {
        Self {
            arena: Vec::new(),
            free: Vec::new(),
            mounts: BTreeMap::new(),
        }
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(slot) = self.free.pop() {
            self.arena[slot as usize] = Some(node);
            NodeId(slot)
        } else {
            self.arena.push(Some(node));
            NodeId((self.arena.len() - 1) as u32)
        }
    }

    fn dealloc_subtree(&mut self, id: NodeId) {
        let children: Vec<NodeId> = match &self.arena[id.0 as usize] {
            Some(Node {
                kind: NodeKind::Folder { children, .. },
                ..
            }) => children.values().copied().collect(),
            _ => Vec::new(),
        };
        for child in children {
            self.dealloc_subtree(child);
        }
        self.arena[id.0 as usize] = None;
        self.free.push(id.0);
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.arena[id.0 as usize]
            .as_ref()
            .expect("live node id")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.arena[id.0 as usize]
            .as_mut()
            .expect("live node id")
    }

    pub fn mounts(&self) -> impl Iterator<Item = (&String, NodeId)> {
        self.mounts.iter().map(|(name, id)| (name, *id))
    }

    pub fn mount(
        &mut self,
        name: &str,
        storage: StorageMeta,
        read_only: bool,
        m_timestamp: i64,
    ) -> Result<NodeId, FsError> {
        validate_name(name)?;
        if self.mounts.contains_key(name) {
            return Err(FsError::AlreadyMounted(name.to_string()));
        }
        let id = self.alloc(Node {
            name: name.to_string(),
            parent: None,
            read_only,
            m_timestamp,
            kind: NodeKind::Folder {
                children: BTreeMap::new(),
                storage: Some(storage),
            },
        });
        self.mounts.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn unmount(&mut self, name: &str) -> Result<(), FsError> {
        let id = self
            .mounts
            .remove(name)
            .ok_or_else(|| FsError::NotMounted(name.to_string()))?;
        self.dealloc_subtree(id);
        Ok(())
    }

    pub fn resolve(&self, segments: &[&str]) -> Option<NodeId> {
        let (first, rest) = segments.split_first()?;
        let mut current = *self.mounts.get(*first)?;
        for segment in rest {
            match &self.node(current).kind {
                NodeKind::Folder { children, .. } => {
                    current = *children.get(*segment)?;
                }
                NodeKind::File { .. } => return None,
            }
        }
        Some(current)
    }

    pub fn storage_root_of(&self, id: NodeId) -> NodeId {
        let mut current = id;
        while let Some(parent) = self.node(current).parent {
            current = parent;
        }
        current
    }

    pub fn storage_meta(&self, name: &str) -> Option<&StorageMeta> {
        let id = *self.mounts.get(name)?;
        match &self.node(id).kind {
            NodeKind::Folder { storage, .. } => storage.as_ref(),
            NodeKind::File { .. } => None,
        }
    }

    pub fn set_space(&mut self, name: &str, free: u64, total: u64, now: i64) -> Result<(), FsError> {
        let id = *self
            .mounts
            .get(name)
            .ok_or_else(|| FsError::NotMounted(name.to_string()))?;
        if let NodeKind::Folder {
            storage: Some(meta),
            ..
        } = &mut self.node_mut(id).kind
        {
            meta.free_space = free;
            meta.total_space = total;
            meta.last_updated = now;
        }
        Ok(())
    }

    fn attach(&mut self, parent: NodeId, node: Node) -> Result<NodeId, FsError> {
        validate_name(&node.name)?;
        let name = node.name.clone();
        let id = self.alloc(node);
        match &mut self.node_mut(parent).kind {
            NodeKind::Folder { children, .. } => {
                children.insert(name, id);
                Ok(id)
            }
            NodeKind::File { .. } => {
                self.arena[id.0 as usize] = None;
                self.free.push(id.0);
                Err(FsError::NotAFolder(self.abs_path(parent)))
            }
        }
    }

    /// Create a folder at `segments`. With `create_parents` missing folders on
    /// the way are created too; otherwise a missing parent is an error.
    /// Returns the node and whether anything was created.
    pub fn mkdir(
        &mut self,
        segments: &[&str],
        create_parents: bool,
        m_timestamp: i64,
    ) -> Result<(NodeId, bool), FsError> {
        let path = segments.join("/");
        let (first, rest) = segments
            .split_first()
            .ok_or_else(|| FsError::PathNotFound(format!("/{path}")))?;
        let mut current = *self
            .mounts
            .get(*first)
            .ok_or_else(|| FsError::NotMounted((*first).to_string()))?;
        let mut created = false;
        for (depth, segment) in rest.iter().enumerate() {
            let last = depth == rest.len() - 1;
            let existing = match &self.node(current).kind {
                NodeKind::Folder { children, .. } => children.get(*segment).copied(),
                NodeKind::File { .. } => return Err(FsError::NotAFolder(format!("/{path}"))),
            };
            current = match existing {
                Some(id) => {
                    if !self.node(id).is_dir() {
                        return Err(FsError::NotAFolder(self.abs_path(id)));
                    }
                    id
                }
                None => {
                    if !last && !create_parents {
                        return Err(FsError::PathNotFound(format!("/{path}")));
                    }
                    created = true;
                    self.attach(
                        current,
                        Node {
                            name: (*segment).to_string(),
                            parent: Some(current),
                            read_only: false,
                            m_timestamp,
                            kind: NodeKind::Folder {
                                children: BTreeMap::new(),
                                storage: None,
                            },
                        },
                    )?
                }
            };
        }
        Ok((current, created))
    }

    /// Insert or refresh a file node. Returns the node and whether it was new.
    pub fn upsert_file(
        &mut self,
        segments: &[&str],
        size: u64,
        m_timestamp: i64,
        read_only: bool,
    ) -> Result<(NodeId, bool), FsError> {
        let path = segments.join("/");
        let (name, parents) = segments
            .split_last()
            .ok_or_else(|| FsError::PathNotFound(format!("/{path}")))?;
        let parent = self
            .resolve(parents)
            .ok_or_else(|| FsError::PathNotFound(format!("/{path}")))?;
        let existing = match &self.node(parent).kind {
            NodeKind::Folder { children, .. } => children.get(*name).copied(),
            NodeKind::File { .. } => return Err(FsError::NotAFolder(self.abs_path(parent))),
        };
        match existing {
            Some(id) => {
                let node = self.node_mut(id);
                if node.is_dir() {
                    return Err(FsError::NotAFile(format!("/{path}")));
                }
                node.kind = NodeKind::File { size };
                node.m_timestamp = m_timestamp;
                node.read_only = read_only;
                Ok((id, false))
            }
            None => {
                let id = self.attach(
                    parent,
                    Node {
                        name: (*name).to_string(),
                        parent: Some(parent),
                        read_only,
                        m_timestamp,
                        kind: NodeKind::File { size },
                    },
                )?;
                Ok((id, true))
            }
        }
    }

    /// Remove the node at `segments`. Non-empty folders need `force`.
    pub fn remove(&mut self, segments: &[&str], force: bool) -> Result<(), FsError> {
        let path = format!("/{}", segments.join("/"));
        let id = self
            .resolve(segments)
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        let parent = match self.node(id).parent {
            Some(parent) => parent,
            // Storage roots go through unmount, not delete.
            None => return Err(FsError::NotMounted(path)),
        };
        if let NodeKind::Folder { children, .. } = &self.node(id).kind {
            if !children.is_empty() && !force {
                return Err(FsError::NotEmpty(path));
            }
        }
        let name = self.node(id).name.clone();
        if let NodeKind::Folder { children, .. } = &mut self.node_mut(parent).kind {
            children.remove(&name);
        }
        self.dealloc_subtree(id);
        Ok(())
    }

    pub fn abs_path(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut current = Some(id);
        while let Some(cursor) = current {
            let node = self.node(cursor);
            parts.push(node.name.clone());
            current = node.parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    /// Whether the node or any ancestor is hidden.
    pub fn is_effectively_hidden(&self, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(cursor) = current {
            let node = self.node(cursor);
            if is_hidden(&node.name) {
                return true;
            }
            current = node.parent;
        }
        false
    }

    pub fn info(&self, id: NodeId) -> NodeInfo {
        let node = self.node(id);
        NodeInfo {
            path: self.abs_path(id),
            name: node.name.clone(),
            is_dir: node.is_dir(),
            size: node.size(),
            m_timestamp: node.m_timestamp,
            read_only: node.read_only,
            hidden: self.is_effectively_hidden(id),
        }
    }

    /// Flat file index for the service: every visible file, keyed by path.
    pub fn flat_index(&self) -> FileIndex {
        let mut index = FileIndex::new();
        for (_, root) in self.mounts() {
            self.index_into(root, &mut index);
        }
        index
    }

    fn index_into(&self, id: NodeId, index: &mut FileIndex) {
        let node = self.node(id);
        if is_hidden(&node.name) {
            return;
        }
        match &node.kind {
            NodeKind::File { size } => {
                let path = self.abs_path(id);
                index.insert(
                    path.clone(),
                    FileIndexEntry {
                        path,
                        size: *size,
                        m_timestamp: node.m_timestamp,
                        read_only: node.read_only,
                    },
                );
            }
            NodeKind::Folder { children, .. } => {
                for child in children.values() {
                    self.index_into(*child, index);
                }
            }
        }
    }

    /// Nested `{type, name, children}` tree for servers predating the flat
    /// index. Hidden nodes are skipped.
    pub fn legacy_dict(&self) -> Value {
        let children: Vec<Value> = self
            .mounts()
            .filter(|(name, _)| !is_hidden(name))
            .map(|(_, id)| self.legacy_node(id))
            .collect();
        let mut root = Map::new();
        root.insert("type".into(), "DIR".into());
        root.insert("name".into(), "/".into());
        root.insert("ro".into(), true.into());
        root.insert("children".into(), Value::Array(children));
        Value::Object(root)
    }

    pub(crate) fn legacy_node(&self, id: NodeId) -> Value {
        let node = self.node(id);
        let mut out = Map::new();
        out.insert(
            "type".into(),
            if node.is_dir() { "DIR" } else { "FILE" }.into(),
        );
        out.insert("name".into(), node.name.clone().into());
        out.insert("ro".into(), node.read_only.into());
        out.insert("m_timestamp".into(), node.m_timestamp.into());
        if let NodeKind::File { size } = node.kind {
            out.insert("size".into(), size.into());
        }
        if let NodeKind::Folder { children, .. } = &node.kind {
            let visible: Vec<Value> = children
                .iter()
                .filter(|(name, _)| !is_hidden(name))
                .map(|(_, child)| self.legacy_node(*child))
                .collect();
            if !visible.is_empty() {
                out.insert("children".into(), Value::Array(visible));
            }
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> StorageMeta {
        StorageMeta {
            storage_type: StorageType::Usb,
            path_storage: PathBuf::from("/mnt/usb"),
            free_space: 0,
            total_space: 0,
            last_updated: 0,
        }
    }

    #[test]
    fn mount_resolve_and_paths() {
        let mut tree = Tree::new();
        tree.mount("usb", storage(), false, 10).unwrap();
        assert!(matches!(
            tree.mount("usb", storage(), false, 10),
            Err(FsError::AlreadyMounted(_))
        ));
        let (dir, created) = tree.mkdir(&["usb", "models"], false, 11).unwrap();
        assert!(created);
        let (file, _) = tree
            .upsert_file(&["usb", "models", "cat.gcode"], 1200, 12, false)
            .unwrap();
        assert_eq!(tree.abs_path(file), "/usb/models/cat.gcode");
        assert_eq!(tree.abs_path(dir), "/usb/models");
        assert_eq!(tree.resolve(&["usb", "models", "cat.gcode"]), Some(file));
        assert_eq!(tree.resolve(&["usb", "nope"]), None);
    }

    #[test]
    fn mkdir_requires_parent_without_force() {
        let mut tree = Tree::new();
        tree.mount("usb", storage(), false, 0).unwrap();
        assert!(matches!(
            tree.mkdir(&["usb", "a", "b"], false, 0),
            Err(FsError::PathNotFound(_))
        ));
        tree.mkdir(&["usb", "a", "b"], true, 0).unwrap();
        // idempotent
        let (_, created) = tree.mkdir(&["usb", "a", "b"], true, 0).unwrap();
        assert!(!created);
    }

    #[test]
    fn remove_guards_non_empty_folders() {
        let mut tree = Tree::new();
        tree.mount("usb", storage(), false, 0).unwrap();
        tree.mkdir(&["usb", "keep"], false, 0).unwrap();
        tree.upsert_file(&["usb", "keep", "f.g"], 1, 0, false).unwrap();
        assert!(matches!(
            tree.remove(&["usb", "keep"], false),
            Err(FsError::NotEmpty(_))
        ));
        tree.remove(&["usb", "keep"], true).unwrap();
        assert_eq!(tree.resolve(&["usb", "keep"]), None);
    }

    #[test]
    fn slab_reuses_slots() {
        let mut tree = Tree::new();
        tree.mount("usb", storage(), false, 0).unwrap();
        let (a, _) = tree.upsert_file(&["usb", "a.g"], 1, 0, false).unwrap();
        tree.remove(&["usb", "a.g"], false).unwrap();
        let (b, _) = tree.upsert_file(&["usb", "b.g"], 1, 0, false).unwrap();
        assert_eq!(a, b, "freed slot should be reused");
    }

    #[test]
    fn hidden_nodes_do_not_reach_the_index() {
        let mut tree = Tree::new();
        tree.mount("usb", storage(), false, 0).unwrap();
        tree.upsert_file(&["usb", ".secret.gcode"], 5, 0, false).unwrap();
        tree.upsert_file(&["usb", "visible.gcode"], 7, 0, false).unwrap();
        tree.mkdir(&["usb", ".work"], false, 0).unwrap();
        tree.upsert_file(&["usb", ".work", "inner.gcode"], 9, 0, false).unwrap();

        let index = tree.flat_index();
        assert_eq!(index.len(), 1);
        assert!(index.contains_key("/usb/visible.gcode"));

        let legacy = tree.legacy_dict();
        let children = legacy["children"][0]["children"].as_array().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0]["name"], "visible.gcode");

        let secret = tree.resolve(&["usb", ".work", "inner.gcode"]).unwrap();
        assert!(tree.is_effectively_hidden(secret));
    }
}
