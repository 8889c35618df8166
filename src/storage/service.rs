//! Storage service: chunk layout, encryption and read probing above a strategy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use tracing::{debug, warn};

use crate::config::{ReadRetryConfig, StorageConfig};
use crate::diagnostics::{DiagnosticDepth, DiagnosticProvider, DiagnosticReport};
use crate::storage::strategy::strategy_from_config;
use crate::storage::{
    ByteStream, Cipher, StorageConnector, StorageError, StorageResult, WriteMetadata,
    bytes_stream, collect_stream, error_stream,
};

/// Path of chunk `chunk` of the object at `path`; chunks are numbered from 1.
pub fn chunk_path(path: &str, chunk: Option<u32>) -> String {
    match chunk {
        Some(n) => format!("{}/chunk{}", path.trim_end_matches('/'), n),
        None => path.to_string(),
    }
}

/// Front door for object storage used by the upload and download paths.
#[derive(Clone)]
pub struct StorageService {
    backend: Arc<dyn StorageConnector>,
    cipher: Option<Cipher>,
    retry: ReadRetryConfig,
    poll_period: Option<Duration>,
}

impl StorageService {
    pub fn new(
        backend: Arc<dyn StorageConnector>,
        cipher: Option<Cipher>,
        retry: ReadRetryConfig,
    ) -> Self {
        Self {
            backend,
            cipher,
            retry,
            poll_period: None,
        }
    }

    /// Have a diagnostics registry sample this service every `period`.
    pub fn with_poll_period(mut self, period: Option<Duration>) -> Self {
        self.poll_period = period;
        self
    }

    pub fn from_config(config: &StorageConfig) -> StorageResult<Self> {
        let cipher = match (&config.secret, &config.iv) {
            (Some(secret), Some(iv)) => Some(Cipher::new(secret, iv)),
            _ => None,
        };
        Ok(Self::new(
            strategy_from_config(config)?,
            cipher,
            config.read_retry.clone(),
        )
        .with_poll_period(config.diagnostics_poll()))
    }

    pub fn backend(&self) -> &Arc<dyn StorageConnector> {
        &self.backend
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Store one object, or one chunk of it. The returned size is the
    /// plaintext size.
    pub async fn write(
        &self,
        path: &str,
        stream: ByteStream,
        chunk: Option<u32>,
    ) -> StorageResult<WriteMetadata> {
        let target = chunk_path(path, chunk);
        match &self.cipher {
            None => self.backend.write(&target, stream).await,
            Some(cipher) => {
                let plain = collect_stream(stream)
                    .await
                    .map_err(|e| StorageError::io(&target, e))?;
                let encrypted = cipher.encrypt(&plain)?;
                self.backend
                    .write(&target, bytes_stream(encrypted))
                    .await?;
                Ok(WriteMetadata {
                    size: plain.len() as u64,
                })
            }
        }
    }

    /// Wait until `path` shows up, within the configured attempts.
    async fn probe(&self, path: &str) -> StorageResult<()> {
        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            match self.backend.exists(path).await {
                Ok(true) => return Ok(()),
                Ok(false) => debug!(path, attempt, "object not visible yet"),
                Err(e) => debug!(path, attempt, error = %e, "existence probe failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(self.retry.delay_ms)).await;
            }
        }
        warn!(path, attempts, "object still missing after probing");
        Err(StorageError::NotFound {
            path: path.to_string(),
        })
    }

    async fn open(&self, path: &str) -> StorageResult<ByteStream> {
        self.probe(path).await?;
        let stream = self.backend.read(path).await?;
        match &self.cipher {
            None => Ok(stream),
            Some(cipher) => {
                let encrypted = collect_stream(stream)
                    .await
                    .map_err(|e| StorageError::io(path, e))?;
                Ok(bytes_stream(cipher.decrypt(&encrypted)?))
            }
        }
    }

    /// Read an object. With `total_chunks`, chunks 1..=total are read in order
    /// and concatenated; the first chunk is opened before returning so a
    /// missing object fails here rather than mid-stream.
    pub async fn read(&self, path: &str, total_chunks: Option<u32>) -> StorageResult<ByteStream> {
        let Some(total) = total_chunks else {
            return self.open(path).await;
        };
        if total == 0 {
            return Err(StorageError::NotFound {
                path: path.to_string(),
            });
        }

        let first = self.open(&chunk_path(path, Some(1))).await?;
        let service = self.clone();
        let base = path.to_string();
        let rest = stream::iter(2..=total)
            .then(move |n| {
                let service = service.clone();
                let target = chunk_path(&base, Some(n));
                async move {
                    match service.open(&target).await {
                        Ok(stream) => stream,
                        Err(e) => error_stream(std::io::Error::other(e)),
                    }
                }
            })
            .flatten();
        Ok(Box::pin(first.chain(rest)))
    }

    pub async fn exists(&self, path: &str, chunk: Option<u32>) -> StorageResult<bool> {
        self.backend.exists(&chunk_path(path, chunk)).await
    }

    /// Remove an object or all of its chunks; `true` only when every part went away.
    ///
    /// Every chunk is attempted even after a failure; failed chunks are
    /// logged and reported as not removed.
    pub async fn remove(&self, path: &str, total_chunks: Option<u32>) -> StorageResult<bool> {
        let Some(total) = total_chunks else {
            return self.backend.remove(path).await;
        };
        let mut removed = true;
        for n in 1..=total {
            let target = chunk_path(path, Some(n));
            match self.backend.remove(&target).await {
                Ok(gone) => removed &= gone,
                Err(e) => {
                    warn!(path = %target, error = %e, "chunk removal failed");
                    removed = false;
                }
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl DiagnosticProvider for StorageService {
    fn key(&self) -> String {
        "storage".to_string()
    }

    fn poll_period(&self) -> Option<Duration> {
        self.poll_period
    }

    async fn get_diagnostics(&self, depth: DiagnosticDepth) -> DiagnosticReport {
        let mut report = self.backend.get_diagnostics(depth).await;
        report.insert("encrypted", serde_json::json!(self.is_encrypted()));
        report
    }
}
