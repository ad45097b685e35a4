use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{FilesystemId, DEFAULT_SUBVOLUME};

/// An immutable point-in-time image of a filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Caller supplied attribution: author, message, type, ...
    pub metadata: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn new(metadata: BTreeMap<String, String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            metadata,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("filesystem {0} does not exist")]
    NotFound(FilesystemId),
    #[error("filesystem {0} already exists")]
    AlreadyExists(FilesystemId),
    #[error("snapshot {snapshot_id} of filesystem {filesystem_id} does not exist")]
    SnapshotNotFound {
        filesystem_id: FilesystemId,
        snapshot_id: String,
    },
    #[error("snapshot {snapshot_id} of filesystem {filesystem_id} already exists")]
    SnapshotExists {
        filesystem_id: FilesystemId,
        snapshot_id: String,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot history is corrupt: {0}")]
    History(#[from] serde_json::Error),
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Copy-on-write style storage for filesystems and their snapshots.
///
/// Snapshot history returned by [`SnapshotEngine::list_snapshots`] is in
///  creation order; a snapshot is never modified once it has been taken.
#[async_trait]
pub trait SnapshotEngine: Send + Sync + std::fmt::Debug + 'static {
    /// Where the live filesystem is mounted
    fn mount_path(&self, filesystem_id: &FilesystemId) -> PathBuf;

    /// Where a snapshot's content can be read
    fn snapshot_path(&self, filesystem_id: &FilesystemId, snapshot_id: &str) -> PathBuf;

    async fn filesystem_exists(&self, filesystem_id: &FilesystemId) -> bool;

    /// Create an empty filesystem with its default subvolume
    async fn create_filesystem(&self, filesystem_id: &FilesystemId) -> Result<(), StorageError>;

    /// Capture the current content as `snapshot` and append it to the history
    async fn snapshot(
        &self,
        filesystem_id: &FilesystemId,
        snapshot: &Snapshot,
    ) -> Result<(), StorageError>;

    async fn list_snapshots(
        &self,
        filesystem_id: &FilesystemId,
    ) -> Result<Vec<Snapshot>, StorageError>;

    /// Create `new_filesystem` whose content starts out as `snapshot_id` of `origin`
    async fn clone_snapshot(
        &self,
        origin: &FilesystemId,
        snapshot_id: &str,
        new_filesystem: &FilesystemId,
    ) -> Result<(), StorageError>;

    async fn delete_filesystem(&self, filesystem_id: &FilesystemId) -> Result<(), StorageError>;
}

const HISTORY_FILE: &str = "history.json";

/// Engine keeping everything under a local directory.
///
/// Live filesystems live under `<root>/mnt/<id>` and snapshots are read-only
///  copies under `<root>/snapshots/<id>/<snapshot_id>`.
#[derive(Debug, Clone)]
pub struct LocalEngine {
    root: PathBuf,
}

impl LocalEngine {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshots_dir(&self, filesystem_id: &FilesystemId) -> PathBuf {
        self.root.join("snapshots").join(filesystem_id.as_str())
    }

    fn history_path(&self, filesystem_id: &FilesystemId) -> PathBuf {
        self.snapshots_dir(filesystem_id).join(HISTORY_FILE)
    }

    async fn read_history(
        &self,
        filesystem_id: &FilesystemId,
    ) -> Result<Vec<Snapshot>, StorageError> {
        match tokio::fs::read(self.history_path(filesystem_id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_history(
        &self,
        filesystem_id: &FilesystemId,
        history: &[Snapshot],
    ) -> Result<(), StorageError> {
        let path = self.history_path(filesystem_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(history)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotEngine for LocalEngine {
    fn mount_path(&self, filesystem_id: &FilesystemId) -> PathBuf {
        self.root.join("mnt").join(filesystem_id.as_str())
    }

    fn snapshot_path(&self, filesystem_id: &FilesystemId, snapshot_id: &str) -> PathBuf {
        self.snapshots_dir(filesystem_id).join(snapshot_id)
    }

    async fn filesystem_exists(&self, filesystem_id: &FilesystemId) -> bool {
        tokio::fs::metadata(self.mount_path(filesystem_id))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn create_filesystem(&self, filesystem_id: &FilesystemId) -> Result<(), StorageError> {
        if self.filesystem_exists(filesystem_id).await {
            return Err(StorageError::AlreadyExists(filesystem_id.clone()));
        }
        tokio::fs::create_dir_all(self.mount_path(filesystem_id).join(DEFAULT_SUBVOLUME)).await?;
        tokio::fs::create_dir_all(self.snapshots_dir(filesystem_id)).await?;
        tracing::debug!(filesystem_id = %filesystem_id, "created filesystem");
        Ok(())
    }

    async fn snapshot(
        &self,
        filesystem_id: &FilesystemId,
        snapshot: &Snapshot,
    ) -> Result<(), StorageError> {
        if !self.filesystem_exists(filesystem_id).await {
            return Err(StorageError::NotFound(filesystem_id.clone()));
        }
        let mut history = self.read_history(filesystem_id).await?;
        if history.iter().any(|s| s.id == snapshot.id) {
            return Err(StorageError::SnapshotExists {
                filesystem_id: filesystem_id.clone(),
                snapshot_id: snapshot.id.clone(),
            });
        }

        let source = self.mount_path(filesystem_id);
        let dest = self.snapshot_path(filesystem_id, &snapshot.id);
        tokio::task::spawn_blocking(move || copy_tree(&source, &dest, true)).await??;

        history.push(snapshot.clone());
        self.write_history(filesystem_id, &history).await
    }

    async fn list_snapshots(
        &self,
        filesystem_id: &FilesystemId,
    ) -> Result<Vec<Snapshot>, StorageError> {
        if !self.filesystem_exists(filesystem_id).await {
            return Err(StorageError::NotFound(filesystem_id.clone()));
        }
        self.read_history(filesystem_id).await
    }

    async fn clone_snapshot(
        &self,
        origin: &FilesystemId,
        snapshot_id: &str,
        new_filesystem: &FilesystemId,
    ) -> Result<(), StorageError> {
        let history = self.list_snapshots(origin).await?;
        let Some(snapshot) = history.iter().find(|s| s.id == snapshot_id) else {
            return Err(StorageError::SnapshotNotFound {
                filesystem_id: origin.clone(),
                snapshot_id: snapshot_id.to_string(),
            });
        };
        if self.filesystem_exists(new_filesystem).await {
            return Err(StorageError::AlreadyExists(new_filesystem.clone()));
        }

        let source = self.snapshot_path(origin, snapshot_id);
        let dest = self.mount_path(new_filesystem);
        tokio::task::spawn_blocking(move || copy_tree(&source, &dest, false)).await??;

        // the clone's history starts at the snapshot it was made from
        tokio::fs::create_dir_all(self.snapshots_dir(new_filesystem)).await?;
        let source = self.snapshot_path(origin, snapshot_id);
        let dest = self.snapshot_path(new_filesystem, snapshot_id);
        tokio::task::spawn_blocking(move || copy_tree(&source, &dest, true)).await??;
        self.write_history(new_filesystem, std::slice::from_ref(snapshot))
            .await
    }

    async fn delete_filesystem(&self, filesystem_id: &FilesystemId) -> Result<(), StorageError> {
        let mount = self.mount_path(filesystem_id);
        let snapshots = self.snapshots_dir(filesystem_id);
        let mut found = false;
        for dir in [mount, snapshots] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => found = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if !found {
            return Err(StorageError::NotFound(filesystem_id.clone()));
        }
        tracing::debug!(filesystem_id = %filesystem_id, "deleted filesystem");
        Ok(())
    }
}

/// Recursively copy `source` into a fresh `dest`
fn copy_tree(source: &Path, dest: &Path, read_only: bool) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dest.join(entry.file_name());
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target, read_only)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
            let mut permissions = std::fs::metadata(&target)?.permissions();
            permissions.set_readonly(read_only);
            std::fs::set_permissions(&target, permissions)?;
        } else if file_type.is_symlink() {
            copy_symlink(&entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(source: &Path, dest: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(std::fs::read_link(source)?, dest)
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, _dest: &Path) -> std::io::Result<()> {
    tracing::warn!(path = %source.display(), "skipping symlink");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine() -> (LocalEngine, TempDir) {
        let dir = TempDir::new().unwrap();
        (LocalEngine::new(dir.path()), dir)
    }

    fn snap(message: &str) -> Snapshot {
        Snapshot::new(BTreeMap::from([("message".to_string(), message.to_string())]))
    }

    #[tokio::test]
    async fn test_create_and_snapshot() {
        let (engine, _dir) = engine();
        let fs = FilesystemId::from("fs");
        engine.create_filesystem(&fs).await.unwrap();
        assert!(matches!(
            engine.create_filesystem(&fs).await,
            Err(StorageError::AlreadyExists(_))
        ));

        let file = engine.mount_path(&fs).join(DEFAULT_SUBVOLUME).join("a.txt");
        std::fs::write(&file, b"one").unwrap();
        let first = snap("first");
        engine.snapshot(&fs, &first).await.unwrap();

        std::fs::write(&file, b"two").unwrap();
        let second = snap("second");
        engine.snapshot(&fs, &second).await.unwrap();

        let history = engine.list_snapshots(&fs).await.unwrap();
        assert_eq!(history, vec![first.clone(), second]);

        // the earlier snapshot kept its content
        let frozen = engine
            .snapshot_path(&fs, &first.id)
            .join(DEFAULT_SUBVOLUME)
            .join("a.txt");
        assert_eq!(std::fs::read(frozen).unwrap(), b"one");

        assert!(matches!(
            engine.snapshot(&fs, &first).await,
            Err(StorageError::SnapshotExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_snapshot_missing_filesystem() {
        let (engine, _dir) = engine();
        let result = engine.snapshot(&"nope".into(), &snap("x")).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_clone_snapshot() {
        let (engine, _dir) = engine();
        let origin = FilesystemId::from("origin");
        engine.create_filesystem(&origin).await.unwrap();
        let file = engine.mount_path(&origin).join(DEFAULT_SUBVOLUME).join("a.txt");
        std::fs::write(&file, b"data").unwrap();
        let s = snap("base");
        engine.snapshot(&origin, &s).await.unwrap();

        let branch = FilesystemId::from("branch");
        engine.clone_snapshot(&origin, &s.id, &branch).await.unwrap();

        let cloned = engine.mount_path(&branch).join(DEFAULT_SUBVOLUME).join("a.txt");
        assert_eq!(std::fs::read(&cloned).unwrap(), b"data");
        // clone content is writable again
        std::fs::write(&cloned, b"changed").unwrap();
        assert_eq!(engine.list_snapshots(&branch).await.unwrap(), vec![s.clone()]);

        assert!(matches!(
            engine.clone_snapshot(&origin, "missing", &"other".into()).await,
            Err(StorageError::SnapshotNotFound { .. })
        ));
        assert!(matches!(
            engine.clone_snapshot(&origin, &s.id, &branch).await,
            Err(StorageError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_filesystem() {
        let (engine, _dir) = engine();
        let fs = FilesystemId::from("fs");
        engine.create_filesystem(&fs).await.unwrap();
        engine.snapshot(&fs, &snap("s")).await.unwrap();

        engine.delete_filesystem(&fs).await.unwrap();
        assert!(!engine.filesystem_exists(&fs).await);
        assert!(matches!(
            engine.delete_filesystem(&fs).await,
            Err(StorageError::NotFound(_))
        ));
    }
}
