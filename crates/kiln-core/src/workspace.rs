//! Applying generated artifacts to the project.
//!
//! A [`Workspace`] ties the file store, the entry patcher and the live
//! sandbox together. Every operation runs under the store lock, so an
//! artifact write, its entry patch and their mirror into the sandbox land
//! as one unit.

use crate::error::{WorkspaceError, WorkspaceResult};
use crate::lifecycle::SandboxLifecycleManager;
use crate::patcher::{component_symbol, patch_entry, PatchOutcome};
use crate::seed::ensure_seeded;
use crate::store::{normalize_path, FileNode, VirtualFileStore};
use kiln_gen::GeneratedArtifact;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

/// File name used when the model gives none.
pub const DEFAULT_ARTIFACT_FILENAME: &str = "GeneratedComponent.tsx";

const DEFAULT_EXTENSION: &str = "tsx";

/// Where artifacts go and which file registers them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryConfig {
    /// The entry file patched for every artifact.
    ///
    /// Default: `src/App.tsx`
    pub entry_file: String,

    /// Directory artifacts are written to.
    ///
    /// Default: `src/components`
    pub components_dir: String,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            entry_file: "src/App.tsx".to_string(),
            components_dir: "src/components".to_string(),
        }
    }
}

impl EntryConfig {
    /// Create a config with the given paths, normalizing both.
    pub fn new(entry_file: &str, components_dir: &str) -> WorkspaceResult<Self> {
        Ok(Self {
            entry_file: normalize_path(entry_file)?,
            components_dir: normalize_path(components_dir)?,
        })
    }

    /// Decide the path, symbol and import module for an artifact.
    pub fn place(&self, filename: Option<&str>) -> WorkspaceResult<ArtifactPlacement> {
        let requested = filename
            .map(str::trim)
            .and_then(|f| f.rsplit(['/', '\\']).next())
            .filter(|f| !f.is_empty() && *f != "." && *f != "..")
            .unwrap_or(DEFAULT_ARTIFACT_FILENAME);

        let symbol = component_symbol(requested)
            .ok_or_else(|| WorkspaceError::InvalidFilename(requested.to_string()))?;
        let extension = match requested.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext,
            _ => DEFAULT_EXTENSION,
        };

        Ok(ArtifactPlacement {
            path: format!("{}/{symbol}.{extension}", self.components_dir),
            module: self.module_for(&symbol),
            symbol,
        })
    }

    /// Import specifier for `symbol`, relative to the entry file.
    fn module_for(&self, symbol: &str) -> String {
        let entry_dir: Vec<&str> = match self.entry_file.rsplit_once('/') {
            Some((dir, _)) => dir.split('/').collect(),
            None => Vec::new(),
        };
        let target: Vec<&str> = self.components_dir.split('/').collect();
        let common = entry_dir
            .iter()
            .zip(&target)
            .take_while(|(a, b)| a == b)
            .count();

        let mut parts: Vec<&str> = Vec::new();
        if entry_dir.len() == common {
            parts.push(".");
        } else {
            parts.extend(std::iter::repeat("..").take(entry_dir.len() - common));
        }
        parts.extend(&target[common..]);
        parts.push(symbol);
        parts.join("/")
    }
}

/// Where one artifact lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactPlacement {
    /// Store path of the artifact file.
    pub path: String,
    /// Component symbol registered in the entry file.
    pub symbol: String,
    /// Import specifier used by the entry file.
    pub module: String,
}

/// Outcome of [`Workspace::apply_artifact`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    #[serde(flatten)]
    pub placement: ArtifactPlacement,
    /// Whether an existing file was overwritten.
    pub replaced: bool,
    /// What happened to the entry file.
    pub entry: PatchOutcome,
    /// Mirror status of the live sandbox.
    pub mirror: MirrorStatus,
}

/// Whether a change reached the live sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MirrorStatus {
    /// No mounted sandbox; the change is picked up at the next mount.
    NotMounted,
    /// Written into the sandbox of this generation.
    Mirrored { generation: u64 },
    /// The store changed but the sandbox write failed.
    Failed { generation: u64, error: String },
}

/// Outcome of [`Workspace::write_file`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub path: String,
    pub replaced: bool,
    pub mirror: MirrorStatus,
}

/// Project operations that keep the store and the sandbox in step.
#[derive(Debug, Clone)]
pub struct Workspace {
    manager: SandboxLifecycleManager,
    entry: EntryConfig,
}

impl Workspace {
    /// Create a workspace over the manager's store.
    pub fn new(manager: SandboxLifecycleManager, entry: EntryConfig) -> Self {
        Self { manager, entry }
    }

    /// The lifecycle manager.
    pub fn manager(&self) -> &SandboxLifecycleManager {
        &self.manager
    }

    /// Entry file configuration.
    pub fn entry(&self) -> &EntryConfig {
        &self.entry
    }

    fn store(&self) -> &Arc<Mutex<VirtualFileStore>> {
        self.manager.store()
    }

    /// Current content of a file.
    pub async fn read_file(&self, path: &str) -> Option<String> {
        self.store().lock().await.read(path).map(str::to_string)
    }

    /// Display tree of the project.
    pub async fn tree(&self) -> Vec<FileNode> {
        self.store().lock().await.tree()
    }

    /// Write one file and mirror it into the live sandbox.
    pub async fn write_file(&self, path: &str, contents: &str) -> WorkspaceResult<WriteReport> {
        let path = normalize_path(path)?;
        let mut store = self.store().lock().await;
        let replaced = store.write(&path, contents)?.is_some();
        let mirror = self.mirror(&[(path.as_str(), contents)]).await;
        drop(store);

        tracing::debug!(path = %path, replaced, "File written");
        Ok(WriteReport {
            path,
            replaced,
            mirror,
        })
    }

    /// Write an artifact, register it in the entry file, and mirror both.
    ///
    /// An entry file without anchors leaves the artifact written but
    /// unregistered; the report carries [`PatchOutcome::NoAnchor`].
    pub async fn apply_artifact(&self, artifact: &GeneratedArtifact) -> WorkspaceResult<ApplyReport> {
        let placement = self.entry.place(artifact.filename.as_deref())?;

        let mut store = self.store().lock().await;
        ensure_seeded(&mut store)?;
        let replaced = store.write(&placement.path, artifact.code.as_str())?.is_some();

        let (entry, patched_entry) = match store.read(&self.entry.entry_file) {
            Some(source) => {
                let patched = patch_entry(source, &placement.symbol, &placement.module);
                (patched.outcome, Some(patched.source))
            }
            None => (
                PatchOutcome::NoAnchor {
                    reason: format!("entry file {} not found", self.entry.entry_file),
                },
                None,
            ),
        };

        match (&entry, &patched_entry) {
            (PatchOutcome::Applied { .. }, Some(source)) => {
                store.write(&self.entry.entry_file, source.as_str())?;
            }
            (PatchOutcome::NoAnchor { reason }, _) => {
                tracing::warn!(
                    entry = %self.entry.entry_file,
                    symbol = %placement.symbol,
                    reason = %reason,
                    "Entry file not patched; artifact left unregistered"
                );
            }
            _ => {}
        }

        // The entry goes out on every apply, patched here or not, so a
        // sandbox that missed an earlier mirror catches up.
        let mut writes = vec![(placement.path.as_str(), artifact.code.as_str())];
        if let Some(source) = store.read(&self.entry.entry_file) {
            writes.push((self.entry.entry_file.as_str(), source));
        }

        let mirror = self.mirror(&writes).await;
        drop(store);

        tracing::info!(
            path = %placement.path,
            symbol = %placement.symbol,
            replaced,
            patched = entry.is_applied(),
            "Artifact applied"
        );
        Ok(ApplyReport {
            placement,
            replaced,
            entry,
            mirror,
        })
    }

    /// Copy writes into the mounted sandbox, in order.
    ///
    /// Callers hold the store lock.
    async fn mirror(&self, writes: &[(&str, &str)]) -> MirrorStatus {
        let Some(instance) = self.manager.instance().await.filter(|i| i.is_mounted()) else {
            return MirrorStatus::NotMounted;
        };
        let generation = instance.generation();
        for (path, contents) in writes {
            if let Err(e) = instance.write_file(path, contents).await {
                tracing::warn!(
                    sandbox_id = %instance.id(),
                    path = %path,
                    error = %e,
                    "Failed to mirror write into sandbox"
                );
                return MirrorStatus::Failed {
                    generation,
                    error: e.to_string(),
                };
            }
        }
        tracing::debug!(sandbox_id = %instance.id(), files = writes.len(), "Mirrored writes");
        MirrorStatus::Mirrored { generation }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_place_defaults() {
        let config = EntryConfig::default();
        let placement = config.place(None).unwrap();
        assert_eq!(placement.path, "src/components/GeneratedComponent.tsx");
        assert_eq!(placement.symbol, "GeneratedComponent");
        assert_eq!(placement.module, "./components/GeneratedComponent");
    }

    #[test]
    fn test_place_sanitizes_filename() {
        let config = EntryConfig::default();
        let placement = config.place(Some("../../etc/counter.jsx")).unwrap();
        assert_eq!(placement.path, "src/components/Counter.jsx");
        assert_eq!(placement.symbol, "Counter");

        let placement = config.place(Some("TodoList")).unwrap();
        assert_eq!(placement.path, "src/components/TodoList.tsx");

        let placement = config.place(Some("  ")).unwrap();
        assert_eq!(placement.symbol, "GeneratedComponent");

        assert!(matches!(
            config.place(Some("---.tsx")),
            Err(WorkspaceError::InvalidFilename(_))
        ));
    }

    #[test]
    fn test_module_paths() {
        let nested = EntryConfig::new("app/src/main/App.tsx", "app/src/widgets").unwrap();
        assert_eq!(nested.place(Some("A.tsx")).unwrap().module, "../widgets/A");

        let root = EntryConfig::new("App.tsx", "components").unwrap();
        assert_eq!(root.place(Some("A.tsx")).unwrap().module, "./components/A");

        let same = EntryConfig::new("src/App.tsx", "src").unwrap();
        assert_eq!(same.place(Some("A.tsx")).unwrap().module, "./A");
    }

    #[test]
    fn test_report_json_shape() {
        let report = ApplyReport {
            placement: EntryConfig::default().place(Some("Counter.tsx")).unwrap(),
            replaced: false,
            entry: PatchOutcome::Unchanged,
            mirror: MirrorStatus::Mirrored { generation: 2 },
        };
        let json = serde_json::to_value(report).unwrap();
        assert_eq!(json["path"], "src/components/Counter.tsx");
        assert_eq!(json["entry"]["status"], "unchanged");
        assert_eq!(json["mirror"]["status"], "mirrored");
        assert_eq!(json["mirror"]["generation"], 2);
    }
}
