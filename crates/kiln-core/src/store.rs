//! In-memory project file store.
//!
//! The store is the single source of truth for project state. Keys are
//! normalized slash-separated paths; directories are implicit.

use crate::error::{StoreError, StoreResult};
use kiln_runtime::MountManifest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of a [`FileNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

/// One node of the display tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    /// Final path component.
    pub name: String,
    /// File or directory.
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Full normalized path.
    pub path: String,
    /// Children sorted by name; `None` for files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
}

/// Normalize a project path.
///
/// Strips leading `/` and `./`, collapses repeated separators and `.`
/// segments. Rejects `..`, backslashes, and paths that normalize to empty.
pub fn normalize_path(path: &str) -> StoreResult<String> {
    if path.contains('\\') {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(StoreError::InvalidPath(path.to_string())),
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(segments.join("/"))
}

/// Canonical path to content map.
#[derive(Debug, Clone, Default)]
pub struct VirtualFileStore {
    files: BTreeMap<String, String>,
}

impl VirtualFileStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store from `(path, content)` pairs.
    pub fn from_files<I, P, C>(files: I) -> StoreResult<Self>
    where
        I: IntoIterator<Item = (P, C)>,
        P: AsRef<str>,
        C: Into<String>,
    {
        let mut store = Self::new();
        for (path, content) in files {
            store.write(path.as_ref(), content)?;
        }
        Ok(store)
    }

    /// Upsert a file, returning its previous content.
    pub fn write(&mut self, path: &str, content: impl Into<String>) -> StoreResult<Option<String>> {
        let path = normalize_path(path)?;
        self.check_tree(&path)?;
        let previous = self.files.insert(path.clone(), content.into());
        tracing::trace!(path = %path, replaced = previous.is_some(), "Store write");
        Ok(previous)
    }

    /// Current content of a file.
    pub fn read(&self, path: &str) -> Option<&str> {
        let path = normalize_path(path).ok()?;
        self.files.get(&path).map(String::as_str)
    }

    /// Whether a file exists at `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.read(path).is_some()
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the store holds no files.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// All files in path order.
    pub fn files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }

    /// Clone of the flat map.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.files.clone()
    }

    /// Convert to the sandbox mount manifest.
    pub fn to_manifest(&self) -> StoreResult<MountManifest> {
        MountManifest::from_files(self.files()).map_err(|e| StoreError::InvalidPath(e.to_string()))
    }

    /// Build a store from a mount manifest.
    pub fn from_manifest(manifest: MountManifest) -> StoreResult<Self> {
        Self::from_files(manifest.into_files())
    }

    /// Hierarchical view, children sorted by name at every level.
    pub fn tree(&self) -> Vec<FileNode> {
        let mut root = DirBuilder::default();
        for path in self.files.keys() {
            let mut dir = &mut root;
            let mut segments = path.split('/').peekable();
            let mut prefix = String::new();
            while let Some(segment) = segments.next() {
                if !prefix.is_empty() {
                    prefix.push('/');
                }
                prefix.push_str(segment);
                if segments.peek().is_none() {
                    dir.files.insert(segment.to_string(), prefix.clone());
                } else {
                    dir = dir.dirs.entry(segment.to_string()).or_default();
                }
            }
        }
        root.into_nodes("")
    }

    fn check_tree(&self, path: &str) -> StoreResult<()> {
        // An ancestor of `path` stored as a file.
        for (idx, _) in path.match_indices('/') {
            let ancestor = &path[..idx];
            if self.files.contains_key(ancestor) {
                return Err(StoreError::Conflict {
                    path: path.to_string(),
                    existing: ancestor.to_string(),
                });
            }
        }
        // A descendant of `path` already stored.
        let prefix = format!("{path}/");
        if let Some((existing, _)) = self.files.range(prefix.clone()..).next() {
            if existing.starts_with(&prefix) {
                return Err(StoreError::Conflict {
                    path: path.to_string(),
                    existing: existing.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct DirBuilder {
    dirs: BTreeMap<String, DirBuilder>,
    files: BTreeMap<String, String>,
}

impl DirBuilder {
    fn into_nodes(self, parent: &str) -> Vec<FileNode> {
        let mut nodes: Vec<FileNode> = self
            .dirs
            .into_iter()
            .map(|(name, dir)| {
                let path = if parent.is_empty() {
                    name.clone()
                } else {
                    format!("{parent}/{name}")
                };
                FileNode {
                    children: Some(dir.into_nodes(&path)),
                    name,
                    kind: NodeKind::Directory,
                    path,
                }
            })
            .chain(self.files.into_iter().map(|(name, path)| FileNode {
                name,
                kind: NodeKind::File,
                path,
                children: None,
            }))
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }
}
