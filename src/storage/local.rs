//! Object storage on the local filesystem.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::diagnostics::{DiagnosticDepth, DiagnosticReport, failure_detail, new_log_id};
use crate::storage::{ByteStream, StorageConnector, StorageError, StorageResult, WriteMetadata};

/// Stores each object as a file below `root`.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    root: PathBuf,
}

impl LocalConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an object path below the root; absolute paths are taken as relative.
    fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        let mut resolved = self.root.clone();
        let mut depth = 0;
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidPath {
                        path: path.to_string(),
                    });
                }
            }
        }
        if depth == 0 {
            return Err(StorageError::InvalidPath {
                path: path.to_string(),
            });
        }
        Ok(resolved)
    }

    async fn count_entries(&self) -> std::io::Result<u64> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut count = 0;
        while entries.next_entry().await?.is_some() {
            count += 1;
        }
        Ok(count)
    }
}

#[async_trait]
impl StorageConnector for LocalConnector {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn write(&self, path: &str, mut stream: ByteStream) -> StorageResult<WriteMetadata> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(path, e))?;
        }

        // write aside and rename so readers never see a partial object
        let mut partial = target.clone().into_os_string();
        partial.push(format!(".partial-{}", uuid::Uuid::new_v4()));
        let partial = PathBuf::from(partial);
        let mut file = File::create(&partial)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        let mut size = 0u64;
        while let Some(chunk) = stream.next().await {
            let written = match chunk {
                Ok(chunk) => file.write_all(&chunk).await.map(|_| chunk.len()),
                Err(e) => Err(e),
            };
            match written {
                Ok(n) => size += n as u64,
                Err(e) => {
                    drop(file);
                    let _ = fs::remove_file(&partial).await;
                    return Err(StorageError::io(path, e));
                }
            }
        }
        file.flush().await.map_err(|e| StorageError::io(path, e))?;
        drop(file);
        fs::rename(&partial, &target)
            .await
            .map_err(|e| StorageError::io(path, e))?;

        debug!(path, size, "local object written");
        Ok(WriteMetadata { size })
    }

    async fn read(&self, path: &str) -> StorageResult<ByteStream> {
        let file = File::open(self.resolve(path)?)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        Ok(Box::pin(ReaderStream::new(file)))
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let target = self.resolve(path)?;
        fs::try_exists(&target)
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    async fn remove(&self, path: &str) -> StorageResult<bool> {
        match fs::remove_file(self.resolve(path)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    async fn get_diagnostics(&self, depth: DiagnosticDepth) -> DiagnosticReport {
        let root = self.root.display().to_string();
        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) | Err(_) => {
                let log_id = new_log_id();
                warn!(root = %root, log_id = %log_id, "local storage root is not a readable directory");
                return DiagnosticReport::failed().with("logId", json!(log_id));
            }
        }

        let mut report = DiagnosticReport::ok().with("root", json!(root));
        if matches!(depth, DiagnosticDepth::StatsBasic | DiagnosticDepth::StatsDeep) {
            let entries = match self.count_entries().await {
                Ok(count) => json!(count),
                Err(e) => {
                    let log_id = new_log_id();
                    warn!(root = %root, log_id = %log_id, error = %e, "cannot list local storage root");
                    failure_detail(&log_id)
                }
            };
            report.insert("entries", entries);
        }
        report
    }
}
