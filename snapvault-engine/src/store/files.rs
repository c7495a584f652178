//! Read-only directory over an explicit list of local files.
//!
//! Used to archive loose files: each file is exposed under its file name.

use super::{ByteStream, ObjectBody, ObjectDirectory, RemoteObjectRef, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

#[derive(Debug, Clone)]
pub struct FileListDirectory {
    files: BTreeMap<String, PathBuf>,
}

impl FileListDirectory {
    /// Build the directory. Two files sharing a file name are rejected since
    /// they would collide on the same key.
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Result<Self, StoreError> {
        let mut files = BTreeMap::new();
        for path in paths {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| StoreError::InvalidKey {
                    key: path.display().to_string(),
                    reason: "no usable file name".to_string(),
                })?
                .to_string();
            if let Some(previous) = files.insert(name.clone(), path.clone()) {
                return Err(StoreError::InvalidKey {
                    key: name,
                    reason: format!(
                        "both {} and {} map to this key",
                        previous.display(),
                        path.display()
                    ),
                });
            }
        }
        Ok(Self { files })
    }

}

fn version_for(size: u64, modified: SystemTime) -> String {
    let nanos = modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}-{:x}", nanos, size)
}

#[async_trait]
impl ObjectDirectory for FileListDirectory {
    /// Files that are missing or not regular files are still listed so the
    /// failure is recorded per key when the content is read.
    async fn list(&self, _source: &str) -> Result<Vec<RemoteObjectRef>, StoreError> {
        let mut objects = Vec::with_capacity(self.files.len());
        for (key, path) in &self.files {
            let (size_bytes, modified) = match tokio::fs::metadata(path).await {
                Ok(m) if m.is_file() => (m.len(), m.modified().unwrap_or(SystemTime::UNIX_EPOCH)),
                Ok(_) => (0, SystemTime::UNIX_EPOCH),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (0, SystemTime::UNIX_EPOCH),
                Err(e) => return Err(StoreError::Io(e)),
            };
            objects.push(RemoteObjectRef {
                logical_key: key.clone(),
                size_bytes,
                last_modified: DateTime::<Utc>::from(modified),
                remote_version_id: version_for(size_bytes, modified),
            });
        }
        Ok(objects)
    }

    async fn read(&self, logical_key: &str) -> Result<ObjectBody, StoreError> {
        let path = self
            .files
            .get(logical_key)
            .ok_or_else(|| StoreError::NotFound(logical_key.to_string()))?;
        let file = match tokio::fs::File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(StoreError::Other(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        Ok(ObjectBody {
            remote_version_id: version_for(
                metadata.len(),
                metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            ),
            reader: Box::pin(file),
        })
    }

    async fn write(&self, logical_key: &str, _body: ByteStream) -> Result<String, StoreError> {
        Err(StoreError::Unsupported(format!(
            "file list is read-only (write {})",
            logical_key
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_lists_by_file_name() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("sub")).unwrap();
        fs::write(temp_dir.path().join("report.pdf"), b"pdf").unwrap();
        fs::write(temp_dir.path().join("sub/notes.txt"), b"notes").unwrap();

        let dir = FileListDirectory::new(vec![
            temp_dir.path().join("sub/notes.txt"),
            temp_dir.path().join("report.pdf"),
        ])
        .unwrap();

        let objects = dir.list("").await.unwrap();
        let keys: Vec<_> = objects.iter().map(|o| o.logical_key.as_str()).collect();
        assert_eq!(keys, vec!["notes.txt", "report.pdf"]);
        assert!(dir.read("notes.txt").await.is_ok());
        assert!(dir
            .write("notes.txt", Box::pin(std::io::Cursor::new(Vec::new())))
            .await
            .is_err());
    }

    #[test]
    fn test_duplicate_file_names_rejected() {
        let result = FileListDirectory::new(vec![
            PathBuf::from("/a/same.txt"),
            PathBuf::from("/b/same.txt"),
        ]);
        assert!(matches!(result, Err(StoreError::InvalidKey { .. })));
    }

    #[tokio::test]
    async fn test_missing_file_is_listed_but_unreadable() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("here.txt"), b"here").unwrap();
        let dir = FileListDirectory::new(vec![
            temp_dir.path().join("here.txt"),
            temp_dir.path().join("gone.txt"),
            temp_dir.path().to_path_buf(),
        ])
        .unwrap();

        let objects = dir.list("").await.unwrap();
        assert_eq!(objects.len(), 3);
        assert!(dir.read("here.txt").await.is_ok());
        assert!(matches!(dir.read("gone.txt").await, Err(StoreError::NotFound(_))));

        let dir_key = temp_dir.path().file_name().unwrap().to_str().unwrap();
        assert!(matches!(dir.read(dir_key).await, Err(StoreError::Other(_))));
    }
}
