//! Symlinks through which containers see their dots.
//!
//! Each dot gets `<prefix>/<namespace>/<name>` pointing at its filesystem's
//! mount path; containers are handed a subvolume directory beneath it.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::DirBuilder;

use common::kv::KvProvider;
use common::master::{MasterStore, MasterStoreError};
use common::types::{FilesystemId, VolumeName};

#[derive(Debug, Clone)]
pub struct ContainerMounts {
    prefix: PathBuf,
}

impl ContainerMounts {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// The symlink for a dot
    pub fn mountpoint(&self, name: &VolumeName) -> PathBuf {
        self.prefix.join(&name.namespace).join(&name.name)
    }

    /// The directory a container mounts
    pub fn subvolume_path(&self, name: &VolumeName, subvolume: &str) -> PathBuf {
        self.mountpoint(name).join(subvolume)
    }

    /// Point the dot's symlink at `target`, then make sure the subvolume
    ///  exists behind it.
    ///
    /// A symlink that already resolves is left alone even when it points at
    ///  another filesystem, since the dot may have been switched to a branch.
    ///  A dangling one is replaced. Anything else in the way is an error.
    pub async fn link(
        &self,
        name: &VolumeName,
        target: &Path,
        subvolume: &str,
    ) -> io::Result<PathBuf> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(self.prefix.join(&name.namespace))
            .await?;

        let mountpoint = self.mountpoint(name);
        match tokio::fs::symlink_metadata(&mountpoint).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(
                    mountpoint = %mountpoint.display(),
                    target = %target.display(),
                    "creating container mount symlink"
                );
                tokio::fs::symlink(target, &mountpoint).await?;
            }
            Err(e) => return Err(e),
            Ok(meta) if meta.file_type().is_symlink() => {
                let existing = tokio::fs::read_link(&mountpoint).await?;
                match tokio::fs::metadata(&mountpoint).await {
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        tracing::info!(
                            mountpoint = %mountpoint.display(),
                            stale_target = %existing.display(),
                            target = %target.display(),
                            "replacing dangling container mount symlink"
                        );
                        tokio::fs::remove_file(&mountpoint).await?;
                        tokio::fs::symlink(target, &mountpoint).await?;
                    }
                    Err(e) => return Err(e),
                    Ok(_) if existing != target => {
                        tracing::debug!(
                            mountpoint = %mountpoint.display(),
                            existing = %existing.display(),
                            "keeping container mount symlink to non-default target"
                        );
                    }
                    Ok(_) => {}
                }
            }
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!(
                        "{} contains something other than a symlink",
                        mountpoint.display()
                    ),
                ));
            }
        }

        let subvolume_path = self.subvolume_path(name, subvolume);
        DirBuilder::new()
            .recursive(true)
            .mode(0o777)
            .create(&subvolume_path)
            .await?;
        Ok(subvolume_path)
    }

    /// Remove symlinks whose filesystem no longer has a master record.
    ///
    /// The filesystem id is taken from the last component of the link
    ///  target. Returns how many links were removed.
    pub async fn cleanup_stale<K: KvProvider>(
        &self,
        masters: &MasterStore<K>,
    ) -> io::Result<usize> {
        let mut removed = 0;
        let mut namespaces = match tokio::fs::read_dir(&self.prefix).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        while let Some(namespace) = namespaces.next_entry().await? {
            if !namespace.file_type().await?.is_dir() {
                continue;
            }
            let mut links = tokio::fs::read_dir(namespace.path()).await?;
            while let Some(link) = links.next_entry().await? {
                if !link.file_type().await?.is_symlink() {
                    continue;
                }
                let path = link.path();
                let target = match tokio::fs::read_link(&path).await {
                    Ok(target) => target,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e),
                };
                let Some(filesystem_id) = target
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(FilesystemId::from)
                else {
                    continue;
                };

                match masters.get_master(&filesystem_id).await {
                    Err(MasterStoreError::NotFound(_)) => {
                        tracing::info!(
                            link = %path.display(),
                            filesystem_id = %filesystem_id,
                            "removing container mount of deleted filesystem"
                        );
                        tokio::fs::remove_file(&path).await?;
                        removed += 1;
                    }
                    Err(e) => {
                        tracing::warn!(
                            link = %path.display(),
                            filesystem_id = %filesystem_id,
                            error = %e,
                            "could not check container mount, leaving it"
                        );
                    }
                    Ok(_) => {}
                }
            }
        }
        Ok(removed)
    }
}
