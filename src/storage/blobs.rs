use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Enclosure blobs on disk, one directory per enclosure public id:
/// `<root>/<public_id>/<name>`.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, public_id: &str, name: &str) -> PathBuf {
        self.root.join(public_id).join(name)
    }

    pub async fn write(&self, public_id: &str, name: &str, bytes: &[u8]) -> Result<()> {
        let dir = self.root.join(public_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create blob directory {}", dir.display()))?;
        let path = dir.join(name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write blob {}", path.display()))?;
        Ok(())
    }

    pub async fn read(&self, public_id: &str, name: &str) -> Result<Vec<u8>> {
        let path = self.path(public_id, name);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read blob {}", path.display()))
    }

    /// Remove an enclosure's directory. A directory that is already gone is
    /// not an error.
    pub async fn remove(&self, public_id: &str) -> Result<()> {
        let dir = self.root.join(public_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove blob directory {}", dir.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::new(dir.path());

        blobs.write("abc123", "notes.txt", b"hello").await.unwrap();
        assert!(blobs.path("abc123", "notes.txt").exists());
        assert_eq!(blobs.read("abc123", "notes.txt").await.unwrap(), b"hello");

        blobs.remove("abc123").await.unwrap();
        assert!(!dir.path().join("abc123").exists());
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::new(dir.path());
        blobs.remove("never-written").await.unwrap();
    }
}
