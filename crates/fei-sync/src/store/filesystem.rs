//! Filesystem storage backend

use crate::store::Storage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Filesystem storage backend
///
/// One JSON file per key. Writes go to a temporary file that is renamed over
/// the old one, so a crash never leaves a half-written value behind.
#[derive(Clone)]
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    /// Create the backend, creating the directory if needed
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create cache directory {:?}", root))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", encode_key(key)))
    }
}

/// Keys like `collection:feis` are not filesystem-safe everywhere
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[async_trait]
impl Storage for FilesystemStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.key_to_path(key);

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("Failed to read cache file"),
        };

        let value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to deserialize cache file {:?}", path))?;

        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: &Value) -> Result<()> {
        let path = self.key_to_path(key);
        let tmp = path.with_extension("json.tmp");

        let json = serde_json::to_vec(value).context("Failed to serialize value")?;

        fs::write(&tmp, json)
            .await
            .context("Failed to write cache file")?;
        fs::rename(&tmp, &path)
            .await
            .context("Failed to move cache file into place")?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_to_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to delete cache file"),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .context("Failed to read cache directory")?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(key) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(decode_key)
            {
                keys.push(key);
            }
        }

        Ok(keys)
    }

    fn name(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_key_encoding_is_reversible() {
        for key in ["collection:carcasses-intermediaires", "mark:feis", "outbound_queue", "a/b c"] {
            let encoded = encode_key(key);
            assert!(!encoded.contains(':') && !encoded.contains('/'));
            assert_eq!(decode_key(&encoded).as_deref(), Some(key));
        }
    }

    #[tokio::test]
    async fn test_filesystem_storage_basic() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FilesystemStorage::new(temp_dir.path()).await.unwrap();

        storage.set("collection:feis", &json!([{"numero": "A"}])).await.unwrap();

        let retrieved = storage.get("collection:feis").await.unwrap();
        assert_eq!(retrieved, Some(json!([{"numero": "A"}])));
        assert_eq!(storage.keys().await.unwrap(), vec!["collection:feis".to_string()]);

        storage.delete("collection:feis").await.unwrap();
        assert!(storage.get("collection:feis").await.unwrap().is_none());
        storage.delete("collection:feis").await.unwrap();
    }

    #[tokio::test]
    async fn test_filesystem_storage_persistence() {
        let temp_dir = TempDir::new().unwrap();

        {
            let storage = FilesystemStorage::new(temp_dir.path()).await.unwrap();
            storage.set("mark:feis", &json!("2024-01-01T00:00:00Z")).await.unwrap();
        }

        // New instance, as after a restart
        {
            let storage = FilesystemStorage::new(temp_dir.path()).await.unwrap();
            let retrieved = storage.get("mark:feis").await.unwrap();
            assert_eq!(retrieved, Some(json!("2024-01-01T00:00:00Z")));
        }
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FilesystemStorage::new(temp_dir.path()).await.unwrap();

        std::fs::write(storage.key_to_path("profile"), "{not json").unwrap();

        assert!(storage.get("profile").await.is_err());
    }
}
