//! Content transfer in and out of a live filesystem.
//!
//! These run inside the machine's task as bounded sub-steps of the active
//! (and, for reads, passive) state, then hand control back to the loop.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::event::{Event, EventName, InputFile, OutputFile};
use super::machine::FsMachine;
use super::paths::{contain, sanitize, InvalidPath};
use super::state::State;
use crate::kv::KvProvider;
use crate::types::DEFAULT_SUBVOLUME;

#[derive(Debug, thiserror::Error)]
pub enum FileIoError {
    #[error("invalid path: {0}")]
    InvalidPath(#[from] InvalidPath),
    #[error("filename must not be empty")]
    EmptyFilename,
    #[error("failed to create directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to create file {}: {source}", path.display())]
    CreateFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write file: {0}")]
    Write(std::io::Error),
    #[error("failed to stat {name}: {source}")]
    NotFound {
        name: String,
        source: std::io::Error,
    },
    #[error("failed to stat {name}: {source}")]
    Stat {
        name: String,
        source: std::io::Error,
    },
    #[error("failed to read file: {0}")]
    Open(std::io::Error),
    #[error("cannot stream file: {0}")]
    Stream(std::io::Error),
    #[error("tar of {name} failed: {source}")]
    Archive {
        name: String,
        source: std::io::Error,
    },
    #[error("snapshot {0} does not exist")]
    UnknownSnapshot(String),
}

impl FileIoError {
    /// Reply name a failed read reports as
    fn read_reply(&self) -> EventName {
        match self {
            FileIoError::NotFound { .. } | FileIoError::UnknownSnapshot(_) => {
                EventName::FileNotFound
            }
            _ => EventName::ReadFailed,
        }
    }
}

impl<K: KvProvider> FsMachine<K> {
    /// Write `file` into the default subvolume and commit it as a snapshot.
    ///
    /// Nothing written is cleaned up on failure: a retry with the same name
    ///  simply overwrites whatever a failed attempt left behind.
    pub(super) async fn save_file(&mut self, mut file: InputFile) -> State {
        let relative = match sanitize(&file.filename) {
            Ok(relative) if relative.as_os_str().is_empty() => {
                file.response
                    .send(Event::error(EventName::SaveFailed, FileIoError::EmptyFilename));
                return State::Active;
            }
            Ok(relative) => relative,
            Err(e) => {
                tracing::warn!(filename = %file.filename, error = %e, "rejected filename");
                file.response
                    .send(Event::error(EventName::SaveFailed, FileIoError::from(e)));
                return State::Active;
            }
        };
        let subvolume = self
            .ctx
            .engine
            .mount_path(&self.filesystem_id)
            .join(DEFAULT_SUBVOLUME);
        let dest_path = match contain(&subvolume, &relative).await {
            Ok(dest_path) => dest_path,
            Err(e) => {
                tracing::warn!(filename = %file.filename, error = %e, "rejected filename");
                file.response
                    .send(Event::error(EventName::SaveFailed, FileIoError::from(e)));
                return State::Active;
            }
        };

        let bytes = match write_file(&dest_path, &mut file.contents).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(
                    filesystem_id = %self.filesystem_id,
                    filename = %file.filename,
                    dest_path = %dest_path.display(),
                    error = %e,
                    "failed to save file"
                );
                file.response.send(Event::error(EventName::SaveFailed, e));
                return self.backoff();
            }
        };

        let metadata = BTreeMap::from([
            (
                "message".to_string(),
                format!("Uploaded {} ({})", file.filename, format_bytes(bytes)),
            ),
            ("author".to_string(), file.user.clone()),
            ("type".to_string(), "upload".to_string()),
            ("upload.type".to_string(), "S3".to_string()),
            ("upload.file".to_string(), file.filename.clone()),
            ("upload.bytes".to_string(), bytes.to_string()),
        ]);
        let (reply, _) = self.snapshot(metadata).await;
        if !reply.is(EventName::Snapshotted) {
            tracing::error!(
                filesystem_id = %self.filesystem_id,
                filename = %file.filename,
                response = %reply.name,
                cause = reply.err().unwrap_or_default(),
                "failed to commit saved file"
            );
            file.response
                .send(Event::error(EventName::SaveFailed, "file snapshot failed"));
            return self.backoff();
        }

        let snapshot_id = reply.arg_str("snapshot_id").unwrap_or_default().to_string();
        file.response.send(
            Event::new(EventName::SaveSuccess)
                .with_arg("snapshot_id", snapshot_id)
                .with_arg("bytes", bytes),
        );
        State::Active
    }

    /// Stream a file, or an archive of a directory, out to the caller.
    ///
    /// Every outcome returns to `resume`; a failed read leaves nothing to
    ///  recover from.
    pub(super) async fn read_file(&mut self, mut file: OutputFile, resume: State) -> State {
        let reply = match self
            .resolve_source(&file.filename, file.snapshot_id.as_deref())
            .await
        {
            Ok(source_path) => {
                let name = file.filename.clone();
                match stream_path(&name, &source_path, &mut file.contents).await {
                    Ok(Some(bytes)) => Event::new(EventName::ReadSuccess).with_arg("bytes", bytes),
                    Ok(None) => Event::new(EventName::ReadSuccess).with_arg("archive", true),
                    Err(e) => {
                        tracing::error!(
                            filesystem_id = %self.filesystem_id,
                            filename = %file.filename,
                            source_path = %source_path.display(),
                            error = %e,
                            "failed to read"
                        );
                        Event::error(e.read_reply(), e)
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    filesystem_id = %self.filesystem_id,
                    filename = %file.filename,
                    error = %e,
                    "rejected read"
                );
                Event::error(e.read_reply(), e)
            }
        };
        file.response.send(reply);
        resume
    }

    async fn resolve_source(
        &self,
        filename: &str,
        snapshot_id: Option<&str>,
    ) -> Result<PathBuf, FileIoError> {
        let relative = sanitize(filename)?;
        let root = match snapshot_id {
            Some(snapshot_id) => {
                if !self.history.iter().any(|s| s.id == snapshot_id) {
                    return Err(FileIoError::UnknownSnapshot(snapshot_id.to_string()));
                }
                self.ctx
                    .engine
                    .snapshot_path(&self.filesystem_id, snapshot_id)
            }
            None => self.ctx.engine.mount_path(&self.filesystem_id),
        };
        Ok(contain(&root.join(DEFAULT_SUBVOLUME), &relative).await?)
    }
}

async fn write_file<R>(dest_path: &Path, contents: &mut R) -> Result<u64, FileIoError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if let Some(directory) = dest_path.parent() {
        tokio::fs::create_dir_all(directory)
            .await
            .map_err(|source| FileIoError::CreateDir {
                path: directory.to_path_buf(),
                source,
            })?;
    }
    let mut out = tokio::fs::File::create(dest_path)
        .await
        .map_err(|source| FileIoError::CreateFile {
            path: dest_path.to_path_buf(),
            source,
        })?;
    let bytes = tokio::io::copy(contents, &mut out)
        .await
        .map_err(FileIoError::Write)?;
    out.flush().await.map_err(FileIoError::Write)?;
    Ok(bytes)
}

/// Write the file at `source_path`, or a tar of the directory there, into
///  `out`. Returns the byte count for plain files.
async fn stream_path(
    name: &str,
    source_path: &Path,
    out: &mut Box<dyn AsyncWrite + Send + Unpin>,
) -> Result<Option<u64>, FileIoError> {
    let metadata = match tokio::fs::metadata(source_path).await {
        Ok(metadata) => metadata,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
            return Err(FileIoError::NotFound {
                name: name.to_string(),
                source,
            })
        }
        Err(source) => {
            return Err(FileIoError::Stat {
                name: name.to_string(),
                source,
            })
        }
    };

    if metadata.is_dir() {
        read_directory(name, source_path, out).await?;
        return Ok(None);
    }

    let mut source = tokio::fs::File::open(source_path)
        .await
        .map_err(FileIoError::Open)?;
    let bytes = tokio::io::copy(&mut source, out)
        .await
        .map_err(FileIoError::Stream)?;
    out.shutdown().await.map_err(FileIoError::Stream)?;
    Ok(Some(bytes))
}

/// Archive a directory subtree straight into the caller's stream
async fn read_directory(
    name: &str,
    dir_path: &Path,
    out: &mut Box<dyn AsyncWrite + Send + Unpin>,
) -> Result<(), FileIoError> {
    let archive_error = |source: std::io::Error| FileIoError::Archive {
        name: name.to_string(),
        source,
    };

    // the builder needs to own its writer; lend it ours for the duration
    let writer = std::mem::replace(out, Box::new(tokio::io::sink()));
    let mut builder = tokio_tar::Builder::new(writer);
    // links are archived as links, never followed out of the subtree
    builder.follow_symlinks(false);
    let appended = builder.append_dir_all(".", dir_path).await;
    let finished = builder.into_inner().await;

    let mut writer = match finished {
        Ok(writer) => writer,
        Err(e) => return Err(archive_error(e)),
    };
    appended.map_err(archive_error)?;
    writer.shutdown().await.map_err(archive_error)?;
    *out = writer;
    Ok(())
}

/// Human readable byte count for snapshot messages
fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f64 = bytes as f64;
    let k = 1024_f64;
    let i = (bytes_f64.log(k).floor() as usize).min(UNITS.len() - 1);
    let size = bytes_f64 / k.powi(i as i32);

    format!("{:.2} {}", size, UNITS[i])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_read_reply_classification() {
        let missing = FileIoError::NotFound {
            name: "x".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(missing.read_reply(), EventName::FileNotFound);
        assert_eq!(
            FileIoError::UnknownSnapshot("s".to_string()).read_reply(),
            EventName::FileNotFound
        );
        assert_eq!(
            FileIoError::Open(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
                .read_reply(),
            EventName::ReadFailed
        );
    }
}
