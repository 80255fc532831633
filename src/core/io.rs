use anyhow::{Context, Result};
use async_trait::async_trait;

/// Byte storage used by the local back-ends (book records, stored profiles,
/// reference image files).
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

pub struct NativeStorage;

impl NativeStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NativeStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        // Write-then-rename so a reader never sees a half-written record.
        let tmp = format!("{}.tmp", path);
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp))?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if tokio::fs::try_exists(path).await? {
            if std::path::Path::new(path).is_dir() {
                tokio::fs::remove_dir_all(path).await?;
            } else {
                tokio::fs::remove_file(path).await?;
            }
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let path = std::path::Path::new(prefix);
        let mut entries = Vec::new();

        if path.exists() {
            if path.is_dir() {
                let mut dir = tokio::fs::read_dir(path).await?;
                while let Some(entry) = dir.next_entry().await? {
                    entries.push(entry.path().to_string_lossy().to_string());
                }
            } else {
                entries.push(prefix.to_string());
            }
        }

        entries.sort();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_creates_parents_and_lists_sorted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("books");
        let storage = NativeStorage::new();

        let b = root.join("2.json");
        let a = root.join("1.json");
        storage.write(b.to_str().unwrap(), b"{}").await?;
        storage.write(a.to_str().unwrap(), b"[]").await?;

        let listed = storage.list(root.to_str().unwrap()).await?;
        assert_eq!(listed.len(), 2);
        assert!(listed[0].ends_with("1.json"));
        assert_eq!(storage.read(a.to_str().unwrap()).await?, b"[]");

        storage.delete(a.to_str().unwrap()).await?;
        assert!(!storage.exists(a.to_str().unwrap()).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_missing_prefix_is_empty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let missing = dir.path().join("nothing-here");
        let storage = NativeStorage::new();
        assert!(storage.list(missing.to_str().unwrap()).await?.is_empty());
        Ok(())
    }
}
