//! On-disk blob store for one storage node.
//!
//! Files land as plain blobs in the data directory; the directory is wiped
//! on startup because the controller's allocation table does not survive
//! restarts either, so leftover blobs would only confuse the next listing.
//! Every blob's size and crc32 are kept in memory and the checksum is
//! verified on read.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;

use crate::common::{Error, Result};

#[derive(Debug, Clone, Copy)]
struct BlobMeta {
    size: u64,
    crc: u32,
}

#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    files: Mutex<HashMap<String, BlobMeta>>,
}

/// File names travel over the wire unescaped; anything that could leave the
/// data directory is rejected outright.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(Error::InvalidFileName(name.to_string()));
    }
    Ok(())
}

impl FileStore {
    /// Open the store, wiping whatever a previous run left behind.
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            files: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub async fn save(&self, name: &str, data: &[u8]) -> Result<()> {
        validate_name(name)?;
        let crc = crc32fast::hash(data);
        tokio::fs::write(self.path_for(name), data).await?;
        self.files.lock().unwrap().insert(
            name.to_string(),
            BlobMeta {
                size: data.len() as u64,
                crc,
            },
        );
        Ok(())
    }

    pub async fn read(&self, name: &str) -> Result<Bytes> {
        validate_name(name)?;
        let meta = self
            .files
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .ok_or_else(|| Error::FileNotFound(name.to_string()))?;
        let data = tokio::fs::read(self.path_for(name)).await?;
        if data.len() as u64 != meta.size || crc32fast::hash(&data) != meta.crc {
            return Err(Error::Corrupted(name.to_string()));
        }
        Ok(Bytes::from(data))
    }

    /// Delete a blob; false when it was not stored here.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        let known = self.files.lock().unwrap().remove(name).is_some();
        if known {
            tokio::fs::remove_file(self.path_for(name)).await?;
        }
        Ok(known)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.lock().unwrap().contains_key(name)
    }

    pub fn size_of(&self, name: &str) -> Option<u64> {
        self.files.lock().unwrap().get(name).map(|m| m.size)
    }

    pub fn list(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_save_read_remove() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        store.save("a.txt", b"hello").await.unwrap();
        assert!(store.contains("a.txt"));
        assert_eq!(store.size_of("a.txt"), Some(5));
        assert_eq!(store.read("a.txt").await.unwrap().as_ref(), b"hello");

        assert!(store.remove("a.txt").await.unwrap());
        assert!(!store.remove("a.txt").await.unwrap());
        assert!(store.read("a.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_open_wipes_leftovers() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("stale.bin"), b"old").unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        assert!(store.list().is_empty());
        assert!(!dir.path().join("stale.bin").exists());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_corruption() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        store.save("a.txt", b"hello").await.unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hellX").unwrap();
        assert!(matches!(
            store.read("a.txt").await,
            Err(Error::Corrupted(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_escaping_names() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        assert!(store.save("../evil", b"x").await.is_err());
        assert!(store.save("a/b", b"x").await.is_err());
        assert!(store.save("", b"x").await.is_err());
    }
}
