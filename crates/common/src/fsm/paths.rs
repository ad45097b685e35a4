use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidPath {
    #[error("absolute paths are not allowed: {0}")]
    Absolute(String),
    #[error("path escapes the filesystem root: {0}")]
    Escapes(String),
    #[error("path contains a NUL byte")]
    Nul,
    #[error("cannot resolve {path}: {reason}")]
    Unresolvable { path: String, reason: String },
}

/// Normalize a caller supplied filename into a path relative to a
///  subvolume root.
///
/// `.` components are dropped and `..` pops a preceding component. Anything
///  that would land outside the root is rejected rather than clamped. The
///  empty string (or `.`) means the root itself.
pub fn sanitize(filename: &str) -> Result<PathBuf, InvalidPath> {
    if filename.contains('\0') {
        return Err(InvalidPath::Nul);
    }

    let mut normalized = PathBuf::new();
    for component in Path::new(filename).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(InvalidPath::Escapes(filename.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(InvalidPath::Absolute(filename.to_string()));
            }
        }
    }
    Ok(normalized)
}

/// Join a sanitized `relative` path onto `root` and make sure the result
///  stays under `root` once symlinks are resolved.
///
/// The deepest entry that exists (a dangling link counts) is canonicalized
///  and must sit under the canonical root. Components past it do not exist
///  yet, so they cannot redirect anywhere.
pub async fn contain(root: &Path, relative: &Path) -> Result<PathBuf, InvalidPath> {
    let joined = root.join(relative);
    let canonical_root = match tokio::fs::canonicalize(root).await {
        Ok(path) => path,
        // nothing below a missing root can be a link
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(joined),
        Err(e) => return Err(unresolvable(root, e)),
    };

    for candidate in joined.ancestors() {
        match tokio::fs::symlink_metadata(candidate).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(unresolvable(candidate, e)),
        }
        let resolved = match tokio::fs::canonicalize(candidate).await {
            Ok(resolved) => resolved,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(InvalidPath::Escapes(relative.display().to_string()))
            }
            Err(e) => return Err(unresolvable(candidate, e)),
        };
        if !resolved.starts_with(&canonical_root) {
            return Err(InvalidPath::Escapes(relative.display().to_string()));
        }
        return Ok(joined);
    }
    Ok(joined)
}

fn unresolvable(path: &Path, e: std::io::Error) -> InvalidPath {
    InvalidPath::Unresolvable {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}
