//! Storage strategies: how logical objects map onto physical backends.
//!
//! `default` forwards to one backend. `oneof` replicates writes to every
//! backend and reads from the first one that can serve the object. A write
//! succeeds when any backend succeeds while a removal succeeds only when all
//! of them do, so backends can drift apart; nothing here reconciles them.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::join_all;
use futures_util::{StreamExt, stream};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::{StorageBackendConfig, StorageConfig, StorageKind, StorageStrategyKind};
use crate::diagnostics::{DiagnosticDepth, DiagnosticReport};
use crate::storage::{
    ByteStream, LocalConnector, StorageConnector, StorageError, StorageResult, WriteMetadata,
};

/// Chunks buffered per replica before the slowest one applies backpressure.
const TEE_BUFFER: usize = 16;

/// Build one physical backend.
pub fn backend_from_config(config: &StorageBackendConfig) -> StorageResult<Arc<dyn StorageConnector>> {
    match config.kind {
        StorageKind::Local => {
            let local = config.local.as_ref().ok_or_else(|| StorageError::Configuration {
                message: "storage type 'local' requires a 'local.path'".to_string(),
            })?;
            Ok(Arc::new(LocalConnector::new(&local.path)))
        }
        #[cfg(feature = "s3")]
        StorageKind::S3 => {
            let s3 = config.s3.as_ref().ok_or_else(|| StorageError::Configuration {
                message: "storage type 'S3' requires an 'S3' section".to_string(),
            })?;
            Ok(Arc::new(crate::storage::S3Connector::new(s3)?))
        }
        #[cfg(not(feature = "s3"))]
        StorageKind::S3 => Err(StorageError::Configuration {
            message: "S3 storage requires the 's3' feature".to_string(),
        }),
    }
}

/// Build the configured strategy.
pub fn strategy_from_config(config: &StorageConfig) -> StorageResult<Arc<dyn StorageConnector>> {
    match config.strategy {
        StorageStrategyKind::Default => Ok(Arc::new(DefaultStrategy::new(backend_from_config(
            &config.backend,
        )?))),
        StorageStrategyKind::OneOf => {
            let backends = config
                .oneof
                .iter()
                .map(backend_from_config)
                .collect::<StorageResult<Vec<_>>>()?;
            Ok(Arc::new(OneOfStrategy::new(backends)?))
        }
    }
}

/// Passthrough to a single backend.
pub struct DefaultStrategy {
    backend: Arc<dyn StorageConnector>,
}

impl DefaultStrategy {
    pub fn new(backend: Arc<dyn StorageConnector>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl StorageConnector for DefaultStrategy {
    fn kind(&self) -> &'static str {
        self.backend.kind()
    }

    async fn write(&self, path: &str, stream: ByteStream) -> StorageResult<WriteMetadata> {
        self.backend.write(path, stream).await
    }

    async fn read(&self, path: &str) -> StorageResult<ByteStream> {
        self.backend.read(path).await
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        self.backend.exists(path).await
    }

    async fn remove(&self, path: &str) -> StorageResult<bool> {
        self.backend.remove(path).await
    }

    async fn get_diagnostics(&self, depth: DiagnosticDepth) -> DiagnosticReport {
        self.backend.get_diagnostics(depth).await
    }
}

/// Replicated storage over several backends, in read priority order.
pub struct OneOfStrategy {
    backends: Vec<Arc<dyn StorageConnector>>,
}

impl OneOfStrategy {
    pub fn new(backends: Vec<Arc<dyn StorageConnector>>) -> StorageResult<Self> {
        if backends.is_empty() {
            return Err(StorageError::Configuration {
                message: "oneof strategy needs at least one backend".to_string(),
            });
        }
        Ok(Self { backends })
    }

    pub fn backends(&self) -> &[Arc<dyn StorageConnector>] {
        &self.backends
    }

    fn label(&self, index: usize) -> String {
        format!("{}#{}", self.backends[index].kind(), index)
    }
}

/// Copy `input` into `outputs` until the input ends. Replicas whose reader
/// went away are dropped; an input error is forwarded to every replica.
async fn pump(mut input: ByteStream, mut outputs: Vec<mpsc::Sender<io::Result<Bytes>>>) {
    while let Some(item) = input.next().await {
        match item {
            Ok(chunk) => {
                let mut live = Vec::with_capacity(outputs.len());
                for tx in outputs {
                    if tx.send(Ok(chunk.clone())).await.is_ok() {
                        live.push(tx);
                    }
                }
                outputs = live;
                if outputs.is_empty() {
                    return;
                }
            }
            Err(e) => {
                for tx in &outputs {
                    let _ = tx.send(Err(io::Error::new(e.kind(), e.to_string()))).await;
                }
                return;
            }
        }
    }
}

fn replica(rx: mpsc::Receiver<io::Result<Bytes>>) -> ByteStream {
    Box::pin(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

/// Split one stream into `count` independent copies.
pub fn tee(input: ByteStream, count: usize) -> Vec<ByteStream> {
    let (senders, receivers): (Vec<_>, Vec<_>) =
        (0..count).map(|_| mpsc::channel(TEE_BUFFER)).unzip();
    tokio::spawn(pump(input, senders));
    receivers.into_iter().map(replica).collect()
}

#[async_trait]
impl StorageConnector for OneOfStrategy {
    fn kind(&self) -> &'static str {
        "oneof"
    }

    async fn write(&self, path: &str, stream: ByteStream) -> StorageResult<WriteMetadata> {
        let copies = tee(stream, self.backends.len());
        let results = join_all(
            self.backends
                .iter()
                .zip(copies)
                .map(|(backend, copy)| backend.write(path, copy)),
        )
        .await;

        let mut first_success = None;
        let mut errors = vec![];
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(metadata) => {
                    first_success.get_or_insert(metadata);
                }
                Err(e) => {
                    warn!(backend = %self.label(index), path, error = %e, "replica write failed");
                    errors.push(format!("{}: {}", self.label(index), e));
                }
            }
        }

        match first_success {
            Some(metadata) => {
                if !errors.is_empty() {
                    warn!(path, failed = errors.len(), total = self.backends.len(), "write stored on a subset of backends");
                }
                Ok(metadata)
            }
            None => {
                error!(path, errors = ?errors, "write failed on every backend");
                Err(StorageError::AllBackendsFailed {
                    operation: "write".to_string(),
                    path: path.to_string(),
                    errors,
                })
            }
        }
    }

    async fn read(&self, path: &str) -> StorageResult<ByteStream> {
        let mut errors = vec![];
        let mut all_missing = true;
        for (index, backend) in self.backends.iter().enumerate() {
            match backend.read(path).await {
                Ok(stream) => {
                    debug!(backend = %self.label(index), path, "read served");
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(backend = %self.label(index), path, error = %e, "read failed, trying next backend");
                    all_missing &= e.is_not_found();
                    errors.push(format!("{}: {}", self.label(index), e));
                }
            }
        }
        if all_missing {
            return Err(StorageError::NotFound {
                path: path.to_string(),
            });
        }
        Err(StorageError::AllBackendsFailed {
            operation: "read".to_string(),
            path: path.to_string(),
            errors,
        })
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let mut errors = vec![];
        for (index, backend) in self.backends.iter().enumerate() {
            match backend.exists(path).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => {
                    warn!(backend = %self.label(index), path, error = %e, "existence probe failed, trying next backend");
                    errors.push(format!("{}: {}", self.label(index), e));
                }
            }
        }
        if errors.len() == self.backends.len() {
            return Err(StorageError::AllBackendsFailed {
                operation: "exists".to_string(),
                path: path.to_string(),
                errors,
            });
        }
        Ok(false)
    }

    async fn remove(&self, path: &str) -> StorageResult<bool> {
        let results = join_all(self.backends.iter().map(|backend| backend.remove(path))).await;
        let mut removed_everywhere = true;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(true) => {}
                Ok(false) => {
                    warn!(backend = %self.label(index), path, "object was not removed");
                    removed_everywhere = false;
                }
                Err(e) => {
                    error!(backend = %self.label(index), path, error = %e, "remove failed");
                    removed_everywhere = false;
                }
            }
        }
        Ok(removed_everywhere)
    }

    async fn get_diagnostics(&self, depth: DiagnosticDepth) -> DiagnosticReport {
        let reports = join_all(
            self.backends
                .iter()
                .map(|backend| backend.get_diagnostics(depth)),
        )
        .await;

        let mut backends = Map::new();
        let mut any_ok = false;
        for (index, report) in reports.into_iter().enumerate() {
            any_ok |= report.ok;
            backends.insert(
                self.label(index),
                serde_json::to_value(&report).unwrap_or(Value::Null),
            );
        }
        let report = if any_ok {
            DiagnosticReport::ok()
        } else {
            DiagnosticReport::failed()
        };
        report.with("backends", json!(backends))
    }
}
