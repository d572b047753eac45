//! Bucketed blob storage on the local filesystem.
//!
//! Layout: `<root>/<bucket>/<key>`. Keys may contain `/` to form nested
//! paths, but never `.`/`..` components or absolute paths. Writes land in a
//! temporary file first and are renamed into place, so concurrent readers
//! never observe a partially written object. [`ObjectStore::put_new`] links
//! the temporary file instead of renaming it, which fails atomically when
//! the key is already taken.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },
    #[error("object already exists: {bucket}/{key}")]
    AlreadyExists { bucket: String, key: String },
    #[error("invalid object name: {0:?}")]
    InvalidName(String),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ObjectStoreError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Put/get byte blobs by bucket and key.
pub trait ObjectStore: Send + Sync {
    fn put(&self, bucket: &str, key: &str, body: &[u8]) -> Result<(), ObjectStoreError>;
    /// Store `body` only if `key` is absent; never replaces an existing object.
    fn put_new(&self, bucket: &str, key: &str, body: &[u8]) -> Result<(), ObjectStoreError>;
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError>;
    fn exists(&self, bucket: &str, key: &str) -> Result<bool, ObjectStoreError>;
}

/// Filesystem-backed [`ObjectStore`].
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Open (and create if needed) the storage root.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ObjectStoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        tracing::info!(root = %root.display(), "object store opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, ObjectStoreError> {
        if bucket.is_empty() || bucket.contains(['/', '\\', '\0']) || bucket.starts_with('.') {
            return Err(ObjectStoreError::InvalidName(bucket.to_string()));
        }
        let key_path = Path::new(key);
        let key_ok = !key.is_empty()
            && !key.contains(['\\', '\0'])
            && key_path
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !key_ok {
            return Err(ObjectStoreError::InvalidName(key.to_string()));
        }
        Ok(self.root.join(bucket).join(key_path))
    }

    /// Write `body` to a fresh temporary file next to `path` and hand it to
    /// `publish`. The temporary file never outlives the call.
    fn write_via_temp(
        &self,
        path: &Path,
        key: &str,
        body: &[u8],
        publish: impl FnOnce(&Path, &Path) -> std::io::Result<()>,
    ) -> Result<(), ObjectStoreError> {
        let parent = path
            .parent()
            .ok_or_else(|| ObjectStoreError::InvalidName(key.to_string()))?;
        fs::create_dir_all(parent)?;

        let tmp = parent.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(body)?;
            file.sync_all()?;
            publish(&tmp, path)
        };
        let result = write();
        let _ = fs::remove_file(&tmp);
        result.map_err(ObjectStoreError::from)
    }
}

impl ObjectStore for FsObjectStore {
    fn put(&self, bucket: &str, key: &str, body: &[u8]) -> Result<(), ObjectStoreError> {
        let path = self.object_path(bucket, key)?;
        self.write_via_temp(&path, key, body, |tmp, path| fs::rename(tmp, path))?;
        tracing::debug!(bucket, key, bytes = body.len(), "object stored");
        Ok(())
    }

    fn put_new(&self, bucket: &str, key: &str, body: &[u8]) -> Result<(), ObjectStoreError> {
        let path = self.object_path(bucket, key)?;
        self.write_via_temp(&path, key, body, |tmp, path| fs::hard_link(tmp, path))
            .map_err(|e| match e {
                ObjectStoreError::Io(io) if io.kind() == ErrorKind::AlreadyExists => {
                    ObjectStoreError::AlreadyExists {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                }
                other => other,
            })?;
        tracing::debug!(bucket, key, bytes = body.len(), "new object stored");
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.object_path(bucket, key)?;
        fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            _ => ObjectStoreError::Io(e),
        })
    }

    fn exists(&self, bucket: &str, key: &str) -> Result<bool, ObjectStoreError> {
        let path = self.object_path(bucket, key)?;
        Ok(path.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::open(dir.path().join("buckets")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_then_get() {
        let (_dir, store) = store();
        store.put("photos", "P1.jpg", b"hello").unwrap();
        assert_eq!(store.get("photos", "P1.jpg").unwrap(), b"hello");
        assert!(store.exists("photos", "P1.jpg").unwrap());
    }

    #[test]
    fn test_buckets_are_separate() {
        let (_dir, store) = store();
        store.put("photos", "k", b"a").unwrap();
        assert!(!store.exists("faces", "k").unwrap());
        assert!(matches!(
            store.get("faces", "k"),
            Err(ObjectStoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_put_overwrites() {
        let (_dir, store) = store();
        store.put("faces", "f.jpg", b"first").unwrap();
        store.put("faces", "f.jpg", b"second").unwrap();
        assert_eq!(store.get("faces", "f.jpg").unwrap(), b"second");
    }

    #[test]
    fn test_put_new_refuses_existing_key() {
        let (_dir, store) = store();
        store.put_new("photos", "P1.jpg", b"first").unwrap();
        assert!(matches!(
            store.put_new("photos", "P1.jpg", b"second"),
            Err(ObjectStoreError::AlreadyExists { .. })
        ));
        assert_eq!(store.get("photos", "P1.jpg").unwrap(), b"first");

        let names: Vec<_> = fs::read_dir(store.root().join("photos"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["P1.jpg".to_string()]);
    }

    #[test]
    fn test_put_new_races_have_one_winner() {
        let (_dir, store) = store();
        let wins = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8u8)
                .map(|i| {
                    let store = &store;
                    s.spawn(move || store.put_new("photos", "P1.jpg", &[i]).is_ok())
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count()
        });
        assert_eq!(wins, 1);
        assert_eq!(store.get("photos", "P1.jpg").unwrap().len(), 1);
    }

    #[test]
    fn test_nested_keys() {
        let (_dir, store) = store();
        store.put("photos", "2024/06/P1.jpg", b"x").unwrap();
        assert_eq!(store.get("photos", "2024/06/P1.jpg").unwrap(), b"x");
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let (_dir, store) = store();
        store.put("faces", "a.jpg", b"x").unwrap();
        let names: Vec<_> = fs::read_dir(store.root().join("faces"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["a.jpg".to_string()]);
    }

    #[test]
    fn test_rejects_escaping_names() {
        let (_dir, store) = store();
        for key in ["../x", "/etc/passwd", "a/../../b", "", "./a", "a\\b"] {
            assert!(
                matches!(store.put("photos", key, b"x"), Err(ObjectStoreError::InvalidName(_))),
                "key {key:?} should be rejected"
            );
        }
        for bucket in ["", "..", "a/b", ".hidden"] {
            assert!(matches!(
                store.get(bucket, "k"),
                Err(ObjectStoreError::InvalidName(_))
            ));
        }
    }

    #[test]
    fn test_error_classification() {
        let not_found = ObjectStoreError::NotFound {
            bucket: "b".into(),
            key: "k".into(),
        };
        assert!(!not_found.is_transient());
        assert!(!ObjectStoreError::InvalidName("x".into()).is_transient());
        let taken = ObjectStoreError::AlreadyExists {
            bucket: "b".into(),
            key: "k".into(),
        };
        assert!(!taken.is_transient());
        assert!(ObjectStoreError::Io(std::io::Error::other("disk")).is_transient());
    }
}
