//! Object storage seam used by table loads and archival moves.
//!
//! Buckets hold objects addressed by `/`-separated names, the way cloud
//! object stores do. [`LocalObjectStore`] maps each bucket onto a directory
//! under a root, which is what local runs and tests use.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::NodeError;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Names of all objects in `bucket` starting with `prefix`, sorted.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, NodeError>;

    /// Read an object. Missing objects yield [`NodeError::SourceNotFound`].
    async fn get(&self, bucket: &str, name: &str) -> Result<Vec<u8>, NodeError>;

    /// Create or overwrite an object.
    async fn put(&self, bucket: &str, name: &str, data: &[u8]) -> Result<(), NodeError>;

    async fn delete(&self, bucket: &str, name: &str) -> Result<(), NodeError>;

    /// Relocate an object; afterwards it no longer exists at the source.
    ///
    /// The default implementation writes the destination before deleting the
    /// source, so a failure never loses data.
    async fn move_object(
        &self,
        src_bucket: &str,
        src_name: &str,
        dst_bucket: &str,
        dst_name: &str,
    ) -> Result<(), NodeError> {
        let data = self.get(src_bucket, src_name).await?;
        self.put(dst_bucket, dst_name, &data).await?;
        self.delete(src_bucket, src_name).await
    }
}

// ---------------------------------------------------------------------------
// LocalObjectStore
// ---------------------------------------------------------------------------

/// Filesystem-backed store: `<root>/<bucket>/<object name>`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory of a bucket; a bucket is a single plain path segment.
    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, NodeError> {
        if bucket.is_empty() || bucket == "." || bucket == ".." || bucket.contains(['/', '\\']) {
            return Err(NodeError::InvalidContract(format!("invalid bucket name '{bucket}'")));
        }
        Ok(self.root.join(bucket))
    }

    /// Resolve an object to a path, refusing names that escape the bucket.
    fn object_path(&self, bucket: &str, name: &str) -> Result<PathBuf, NodeError> {
        let bucket_dir = self.bucket_dir(bucket)?;
        let relative = Path::new(name);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if name.is_empty() || escapes {
            return Err(NodeError::InvalidContract(format!(
                "invalid object reference {bucket}/{name}"
            )));
        }
        Ok(bucket_dir.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, NodeError> {
        let bucket_dir = self.bucket_dir(bucket)?;
        let mut names = Vec::new();
        let mut pending = vec![bucket_dir.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(NodeError::Retryable(format!("listing {}: {e}", dir.display())))
                }
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| NodeError::Retryable(format!("listing {}: {e}", dir.display())))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| NodeError::Retryable(format!("stat {}: {e}", path.display())))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&bucket_dir) else { continue };
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if name.starts_with(prefix) {
                    names.push(name);
                }
            }
        }

        names.sort();
        Ok(names)
    }

    async fn get(&self, bucket: &str, name: &str) -> Result<Vec<u8>, NodeError> {
        let path = self.object_path(bucket, name)?;
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => NodeError::SourceNotFound(format!("{bucket}/{name}")),
            _ => NodeError::Retryable(format!("reading {bucket}/{name}: {e}")),
        })
    }

    async fn put(&self, bucket: &str, name: &str, data: &[u8]) -> Result<(), NodeError> {
        let path = self.object_path(bucket, name)?;
        let write_err = |e: std::io::Error| {
            NodeError::DestinationWriteError(format!("writing {bucket}/{name}: {e}"))
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        tokio::fs::write(&path, data).await.map_err(write_err)
    }

    async fn delete(&self, bucket: &str, name: &str) -> Result<(), NodeError> {
        let path = self.object_path(bucket, name)?;
        tokio::fs::remove_file(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => NodeError::SourceNotFound(format!("{bucket}/{name}")),
            _ => NodeError::Retryable(format!("deleting {bucket}/{name}: {e}")),
        })
    }

    async fn move_object(
        &self,
        src_bucket: &str,
        src_name: &str,
        dst_bucket: &str,
        dst_name: &str,
    ) -> Result<(), NodeError> {
        let src = self.object_path(src_bucket, src_name)?;
        let dst = self.object_path(dst_bucket, dst_name)?;

        if tokio::fs::metadata(&src).await.is_err() {
            return Err(NodeError::SourceNotFound(format!("{src_bucket}/{src_name}")));
        }
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                NodeError::DestinationWriteError(format!("creating {}: {e}", parent.display()))
            })?;
        }

        // Rename is atomic on one filesystem; across devices fall back to copy + delete.
        match tokio::fs::rename(&src, &dst).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("rename {} -> {} failed ({e}), copying", src.display(), dst.display());
                tokio::fs::copy(&src, &dst).await.map_err(|e| {
                    let target = format!("{dst_bucket}/{dst_name}");
                    NodeError::DestinationWriteError(format!("writing {target}: {e}"))
                })?;
                self.delete(src_bucket, src_name).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_list_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        store.put("composer", "data/fec/a.csv", b"x,y\n").await.unwrap();
        store.put("composer", "data/fec/b.csv", b"1,2\n").await.unwrap();
        store.put("composer", "other/c.csv", b"").await.unwrap();

        let names = store.list("composer", "data/fec/").await.unwrap();
        assert_eq!(names, vec!["data/fec/a.csv", "data/fec/b.csv"]);
        assert_eq!(store.get("composer", "data/fec/b.csv").await.unwrap(), b"1,2\n");
    }

    #[tokio::test]
    async fn listing_a_missing_bucket_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert!(store.list("nope", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_object_is_source_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert!(matches!(
            store.get("composer", "missing.csv").await,
            Err(NodeError::SourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn move_removes_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store.put("composer", "data/x.csv", b"payload").await.unwrap();

        store
            .move_object("composer", "data/x.csv", "archive", "datasets/x.csv")
            .await
            .unwrap();

        assert!(store.list("composer", "").await.unwrap().is_empty());
        assert_eq!(store.get("archive", "datasets/x.csv").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn names_escaping_the_bucket_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert!(matches!(
            store.put("composer", "../escape.csv", b"").await,
            Err(NodeError::InvalidContract(_))
        ));
    }

    #[tokio::test]
    async fn buckets_outside_the_root_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("buckets");
        let store = LocalObjectStore::new(&root);
        std::fs::write(dir.path().join("secret.csv"), b"x").unwrap();

        for bucket in ["..", ".", "", "composer/..", "a\\b"] {
            assert!(
                matches!(store.list(bucket, "").await, Err(NodeError::InvalidContract(_))),
                "bucket '{bucket}' was listed"
            );
            assert!(matches!(
                store.get(bucket, "secret.csv").await,
                Err(NodeError::InvalidContract(_))
            ));
        }
    }
}
