//! Object storage backends.
//!
//! Shards and encrypted key blobs live in a flat key/value object store.
//! Keys are `/`-separated paths such as `sh-42/seq-7` or `did:plc:abc.kms`.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{StoreError, StoreResult};

/// Content type of shard objects.
pub const CAR_CONTENT_TYPE: &str = "application/vnd.ipld.car";
/// Content type of opaque binary objects.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Flat key/value object storage.
///
/// Writes are idempotent on key: a second `put` to the same key replaces the
/// object.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store an object.
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StoreResult<()>;

    /// Read a whole object.
    async fn get(&self, key: &str) -> StoreResult<Bytes>;

    /// Read an object from `offset` to its end (`bytes=offset-`).
    async fn get_range(&self, key: &str, offset: u64) -> StoreResult<Bytes>;

    /// Object length in bytes.
    async fn size(&self, key: &str) -> StoreResult<u64>;

    /// Delete an object. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

struct StoredObject {
    data: Bytes,
    content_type: String,
}

/// In-memory object storage for tests and embedding.
pub struct MemObjectStorage {
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemObjectStorage {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().expect("lock poisoned").is_empty()
    }

    /// Content type recorded for `key`.
    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .expect("lock poisoned")
            .get(key)
            .map(|o| o.content_type.clone())
    }
}

impl Default for MemObjectStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStorage for MemObjectStorage {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> StoreResult<()> {
        self.objects.write().expect("lock poisoned").insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Bytes> {
        self.objects
            .read()
            .expect("lock poisoned")
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StoreError::ObjectNotFound(key.to_string()))
    }

    async fn get_range(&self, key: &str, offset: u64) -> StoreResult<Bytes> {
        let data = self.get(key).await?;
        let start = (offset as usize).min(data.len());
        Ok(data.slice(start..))
    }

    async fn size(&self, key: &str) -> StoreResult<u64> {
        Ok(self.get(key).await?.len() as u64)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.objects.write().expect("lock poisoned").remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .objects
            .read()
            .expect("lock poisoned")
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Filesystem backend
// ---------------------------------------------------------------------------

/// Object storage rooted at a directory.
///
/// Each key maps to a file under the root. Writes go to a temporary sibling
/// and are renamed into place, so readers never observe a partial object.
pub struct FsObjectStorage {
    root: PathBuf,
}

impl FsObjectStorage {
    /// Open (creating if needed) an object store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid object key {key:?}"),
            )));
        }
        Ok(self.root.join(key))
    }

    fn map_not_found(key: &str, e: std::io::Error) -> StoreError {
        if e.kind() == std::io::ErrorKind::NotFound {
            StoreError::ObjectNotFound(key.to_string())
        } else {
            StoreError::Io(e)
        }
    }
}

#[async_trait]
impl ObjectStorage for FsObjectStorage {
    async fn put(&self, key: &str, data: Bytes, _content_type: &str) -> StoreResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp-write");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Bytes> {
        let path = self.path_for(key)?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| Self::map_not_found(key, e))?;
        Ok(Bytes::from(data))
    }

    async fn get_range(&self, key: &str, offset: u64) -> StoreResult<Bytes> {
        let path = self.path_for(key)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Self::map_not_found(key, e))?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn size(&self, key: &str) -> StoreResult<u64> {
        let path = self.path_for(key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Self::map_not_found(key, e))?;
        Ok(meta.len())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(key, "object deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let keys = tokio::task::spawn_blocking(move || -> StoreResult<Vec<String>> {
            let mut keys = Vec::new();
            for entry in walkdir::WalkDir::new(&root).min_depth(1) {
                let entry = entry.map_err(|e| StoreError::Io(e.into()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.ends_with(".tmp-write") {
                    continue;
                }
                if key.starts_with(&prefix) {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn ObjectStorage) {
        store
            .put("sh-1/seq-1", Bytes::from_static(b"hello world"), CAR_CONTENT_TYPE)
            .await
            .unwrap();
        store
            .put("sh-1/seq-2", Bytes::from_static(b"second"), CAR_CONTENT_TYPE)
            .await
            .unwrap();
        store
            .put("sh-2/seq-1", Bytes::from_static(b"other"), CAR_CONTENT_TYPE)
            .await
            .unwrap();

        assert_eq!(&store.get("sh-1/seq-1").await.unwrap()[..], b"hello world");
        assert_eq!(&store.get_range("sh-1/seq-1", 6).await.unwrap()[..], b"world");
        assert_eq!(store.size("sh-1/seq-2").await.unwrap(), 6);
        assert_eq!(
            store.list("sh-1/").await.unwrap(),
            vec!["sh-1/seq-1".to_string(), "sh-1/seq-2".to_string()]
        );

        // overwrite is idempotent on key
        store
            .put("sh-1/seq-2", Bytes::from_static(b"replaced"), CAR_CONTENT_TYPE)
            .await
            .unwrap();
        assert_eq!(&store.get("sh-1/seq-2").await.unwrap()[..], b"replaced");

        store.delete("sh-1/seq-1").await.unwrap();
        store.delete("sh-1/seq-1").await.unwrap();
        assert!(matches!(
            store.get("sh-1/seq-1").await,
            Err(StoreError::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn memory_backend() {
        let store = MemObjectStorage::new();
        exercise(&store).await;
        assert_eq!(
            store.content_type("sh-2/seq-1").as_deref(),
            Some(CAR_CONTENT_TYPE)
        );
    }

    #[tokio::test]
    async fn filesystem_backend() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStorage::open(dir.path()).await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn filesystem_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStorage::open(dir.path()).await.unwrap();
        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.get("/abs").await.is_err());
    }

    #[tokio::test]
    async fn filesystem_accepts_did_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStorage::open(dir.path()).await.unwrap();
        store
            .put("did:plc:abc.kms", Bytes::from_static(b"k"), OCTET_STREAM)
            .await
            .unwrap();
        assert_eq!(store.list("did:").await.unwrap(), vec!["did:plc:abc.kms"]);
    }
}
