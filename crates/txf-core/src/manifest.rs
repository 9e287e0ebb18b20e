//! Transfer manifest: the ordered list of files and directories subject to
//! one transfer session.
//!
//! Entry paths on the wire are relative, `/`-separated, and sanitized
//! against traversal before any filesystem write on the receiving side.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

use crate::error::{Error, Result};

/// One entry of a transfer batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Relative `/`-separated path under the destination directory.
    pub path: String,
    /// Size in bytes; zero for directories.
    pub size: u64,
    /// Directory placeholder: created, never streamed.
    pub is_dir: bool,
}

/// A collected batch of local entries ready for upload.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    /// Ordered entries; directories precede their contents.
    pub entries: Vec<ManifestEntry>,
    /// Local source path for each entry, parallel to `entries`.
    pub sources: Vec<PathBuf>,
    /// Sum of all regular-file sizes.
    pub total_bytes: u64,
}

impl Manifest {
    /// Collect manifest entries from local paths.
    ///
    /// Directory roots are walked recursively; within each directory the
    /// children are sorted by name for deterministic ordering, and a
    /// directory entry always precedes its contents. Paths that cannot be
    /// read are skipped and reported in the second return value.
    pub async fn collect(paths: &[PathBuf]) -> (Manifest, Vec<(PathBuf, Error)>) {
        let mut manifest = Manifest::default();
        let mut skipped = Vec::new();

        for root in paths {
            let meta = match fs::metadata(root).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(path = %root.display(), error = %e, "skipping unreadable path");
                    skipped.push((root.clone(), Error::Io(e)));
                    continue;
                }
            };

            let name = match root.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => {
                    skipped.push((
                        root.clone(),
                        Error::FileTransfer {
                            message: format!("path has no file name: {}", root.display()),
                        },
                    ));
                    continue;
                }
            };

            if meta.is_dir() {
                if let Err(e) = collect_dir(root, &name, &mut manifest, &mut skipped).await {
                    skipped.push((root.clone(), e));
                }
            } else if meta.is_file() {
                manifest.push_file(name, meta.len(), root.clone());
            } else {
                skipped.push((
                    root.clone(),
                    Error::FileTransfer {
                        message: format!("not a regular file: {}", root.display()),
                    },
                ));
            }
        }

        (manifest, skipped)
    }

    fn push_file(&mut self, path: String, size: u64, source: PathBuf) {
        self.total_bytes += size;
        self.entries.push(ManifestEntry {
            path,
            size,
            is_dir: false,
        });
        self.sources.push(source);
    }

    fn push_dir(&mut self, path: String, source: PathBuf) {
        self.entries.push(ManifestEntry {
            path,
            size: 0,
            is_dir: true,
        });
        self.sources.push(source);
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Walk one directory root, appending its entry and contents.
async fn collect_dir(
    dir: &Path,
    rel: &str,
    manifest: &mut Manifest,
    skipped: &mut Vec<(PathBuf, Error)>,
) -> Result<()> {
    manifest.push_dir(rel.to_string(), dir.to_path_buf());

    // Depth-first; children sorted so directories always directly precede
    // their own contents.
    let mut read_dir = fs::read_dir(dir).await?;
    let mut children = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        children.push(entry.path());
    }
    children.sort();

    for child in children {
        let name = match child.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => continue,
        };
        let child_rel = format!("{}/{}", rel, name);

        let meta = match fs::metadata(&child).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %child.display(), error = %e, "skipping unreadable entry");
                skipped.push((child.clone(), Error::Io(e)));
                continue;
            }
        };

        if meta.is_dir() {
            Box::pin(collect_dir(&child, &child_rel, manifest, skipped)).await?;
        } else if meta.is_file() {
            manifest.push_file(child_rel, meta.len(), child);
        }
        // Sockets, fifos etc. are silently ignored
    }

    Ok(())
}

/// Sanitize a wire entry path before any filesystem write.
///
/// Rejects absolute paths, backslashes, and any `..` component. Returns
/// the path as a relative `PathBuf` built only from normal components.
pub fn sanitize_path(path: &str) -> Result<PathBuf> {
    if path.is_empty() {
        return Err(Error::PathEscape(path.to_string()));
    }
    if path.contains('\\') {
        return Err(Error::PathEscape(path.to_string()));
    }

    let raw = Path::new(path);
    if raw.is_absolute() {
        return Err(Error::PathEscape(path.to_string()));
    }

    let mut clean = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return Err(Error::PathEscape(path.to_string())),
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(Error::PathEscape(path.to_string()));
    }

    Ok(clean)
}

/// Resolve a sanitized entry path against the destination directory.
pub fn resolve_dest(dest_dir: &Path, entry_path: &str) -> Result<PathBuf> {
    Ok(dest_dir.join(sanitize_path(entry_path)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_accepts_plain_relative() {
        assert_eq!(sanitize_path("a/b/c.txt").unwrap(), PathBuf::from("a/b/c.txt"));
        assert_eq!(sanitize_path("./a/b").unwrap(), PathBuf::from("a/b"));
    }

    #[test]
    fn sanitize_rejects_traversal() {
        assert!(matches!(sanitize_path("../escape"), Err(Error::PathEscape(_))));
        assert!(matches!(sanitize_path("a/../../b"), Err(Error::PathEscape(_))));
        assert!(matches!(sanitize_path("/etc/passwd"), Err(Error::PathEscape(_))));
        assert!(matches!(sanitize_path(""), Err(Error::PathEscape(_))));
        assert!(matches!(sanitize_path("a\\..\\b"), Err(Error::PathEscape(_))));
    }

    #[test]
    fn resolve_dest_joins() {
        let dest = Path::new("/tmp/dl");
        assert_eq!(
            resolve_dest(dest, "dir/file.bin").unwrap(),
            PathBuf::from("/tmp/dl/dir/file.bin")
        );
        assert!(resolve_dest(dest, "../file").is_err());
    }

    #[tokio::test]
    async fn collect_single_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("hello.txt");
        tokio::fs::write(&file, b"hello").await.unwrap();

        let (manifest, skipped) = Manifest::collect(&[file.clone()]).await;
        assert!(skipped.is_empty());
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.entries[0].path, "hello.txt");
        assert_eq!(manifest.entries[0].size, 5);
        assert!(!manifest.entries[0].is_dir);
        assert_eq!(manifest.sources[0], file);
        assert_eq!(manifest.total_bytes, 5);
    }

    #[tokio::test]
    async fn collect_directory_orders_dirs_first() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("data");
        tokio::fs::create_dir_all(root.join("sub")).await.unwrap();
        tokio::fs::write(root.join("a.txt"), b"aa").await.unwrap();
        tokio::fs::write(root.join("sub/b.txt"), b"bbb").await.unwrap();

        let (manifest, skipped) = Manifest::collect(&[root]).await;
        assert!(skipped.is_empty());

        let paths: Vec<_> = manifest.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["data", "data/a.txt", "data/sub", "data/sub/b.txt"]);
        assert!(manifest.entries[0].is_dir);
        assert!(manifest.entries[2].is_dir);
        assert_eq!(manifest.total_bytes, 5);
    }

    #[tokio::test]
    async fn collect_reports_missing_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope");

        let (manifest, skipped) = Manifest::collect(&[missing.clone()]).await;
        assert!(manifest.is_empty());
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].0, missing);
    }
}
