//! Mount manifest - the nested file tree a sandbox is mounted with.
//!
//! On the wire a leaf is `{"file": {"contents": "..."}}` and an interior
//! node is `{"directory": {...}}`, keyed by path segment.

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// A nested directory/file tree ready to be mounted into a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MountManifest {
    entries: BTreeMap<String, MountEntry>,
}

/// One node of a [`MountManifest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountEntry {
    /// A leaf file.
    File {
        /// UTF-8 file contents.
        contents: String,
    },
    /// A directory holding more entries.
    Directory(MountManifest),
}

/// A flattened manifest node, parents always listed before children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestItem<'a> {
    /// Directory path relative to the mount root.
    Directory(String),
    /// File path relative to the mount root, with its contents.
    File(String, &'a str),
}

impl MountManifest {
    /// Create an empty manifest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a manifest from flat slash-separated paths.
    ///
    /// Parent directories are created implicitly. Fails if a path is
    /// invalid or a path would be both a file and a directory.
    pub fn from_files<I, P, C>(files: I) -> Result<Self>
    where
        I: IntoIterator<Item = (P, C)>,
        P: AsRef<str>,
        C: Into<String>,
    {
        let mut manifest = Self::new();
        for (path, contents) in files {
            manifest.insert(path.as_ref(), contents.into())?;
        }
        Ok(manifest)
    }

    /// Insert one file, creating its parent directories.
    pub fn insert(&mut self, path: &str, contents: String) -> Result<()> {
        validate_relative(path)?;
        let segments: Vec<&str> = path.split('/').collect();
        let (leaf, parents) = segments
            .split_last()
            .ok_or_else(|| RuntimeError::InvalidPath(path.to_string()))?;

        let mut dir = self;
        for segment in parents {
            let entry = dir
                .entries
                .entry((*segment).to_string())
                .or_insert_with(|| MountEntry::Directory(MountManifest::new()));
            dir = match entry {
                MountEntry::Directory(child) => child,
                MountEntry::File { .. } => {
                    return Err(RuntimeError::ManifestConflict(path.to_string()))
                }
            };
        }

        match dir.entries.entry((*leaf).to_string()) {
            Entry::Occupied(mut occupied) => match occupied.get_mut() {
                MountEntry::File { contents: existing } => *existing = contents,
                MountEntry::Directory(_) => {
                    return Err(RuntimeError::ManifestConflict(path.to_string()))
                }
            },
            Entry::Vacant(vacant) => {
                vacant.insert(MountEntry::File { contents });
            }
        }
        Ok(())
    }

    /// Flatten back into `path -> contents`. Empty directories are lost.
    pub fn into_files(self) -> BTreeMap<String, String> {
        let mut files = BTreeMap::new();
        self.collect_files("", &mut files);
        files
    }

    fn collect_files(self, prefix: &str, out: &mut BTreeMap<String, String>) {
        for (name, entry) in self.entries {
            let path = join(prefix, &name);
            match entry {
                MountEntry::File { contents } => {
                    out.insert(path, contents);
                }
                MountEntry::Directory(child) => child.collect_files(&path, out),
            }
        }
    }

    /// Walk the tree depth-first, directories before their contents.
    pub fn items(&self) -> Vec<ManifestItem<'_>> {
        let mut items = Vec::new();
        self.walk("", &mut items);
        items
    }

    fn walk<'a>(&'a self, prefix: &str, out: &mut Vec<ManifestItem<'a>>) {
        for (name, entry) in &self.entries {
            let path = join(prefix, name);
            match entry {
                MountEntry::File { contents } => out.push(ManifestItem::File(path, contents)),
                MountEntry::Directory(child) => {
                    out.push(ManifestItem::Directory(path.clone()));
                    child.walk(&path, out);
                }
            }
        }
    }

    /// Look up an entry by slash-separated path.
    pub fn get(&self, path: &str) -> Option<&MountEntry> {
        let mut segments = path.split('/');
        let first = segments.next()?;
        let mut entry = self.entries.get(first)?;
        for segment in segments {
            entry = match entry {
                MountEntry::Directory(dir) => dir.entries.get(segment)?,
                MountEntry::File { .. } => return None,
            };
        }
        Some(entry)
    }

    /// Number of files in the tree.
    pub fn file_count(&self) -> usize {
        self.entries
            .values()
            .map(|entry| match entry {
                MountEntry::File { .. } => 1,
                MountEntry::Directory(dir) => dir.file_count(),
            })
            .sum()
    }

    /// True if the manifest holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Check that `path` is a relative, normalized path inside the sandbox.
pub fn validate_relative(path: &str) -> Result<()> {
    if path.is_empty() || path.starts_with('/') || path.contains('\\') {
        return Err(RuntimeError::InvalidPath(path.to_string()));
    }
    if path
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(RuntimeError::InvalidPath(path.to_string()));
    }
    Ok(())
}
