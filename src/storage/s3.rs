//! S3-compatible object storage.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{ObjectStore, WriteMultipart};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::S3Options;
use crate::diagnostics::{DiagnosticDepth, DiagnosticReport, new_log_id};
use crate::storage::{ByteStream, StorageConnector, StorageError, StorageResult, WriteMetadata};

const BACKEND: &str = "S3";

/// Part uploads in flight per object before the writer waits.
const MAX_CONCURRENT_PARTS: usize = 8;

fn backend_error(e: object_store::Error) -> StorageError {
    StorageError::Backend {
        backend: BACKEND.to_string(),
        message: e.to_string(),
    }
}

fn object_error(path: &str, e: object_store::Error) -> StorageError {
    match e {
        object_store::Error::NotFound { .. } => StorageError::NotFound {
            path: path.to_string(),
        },
        other => backend_error(other),
    }
}

pub struct S3Connector {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    disable_remove: bool,
}

impl S3Connector {
    pub fn new(options: &S3Options) -> StorageResult<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&options.bucket)
            .with_region(&options.region)
            .with_allow_http(!options.use_ssl);
        if let Some(host) = &options.end_point {
            let scheme = if options.use_ssl { "https" } else { "http" };
            let endpoint = match options.port {
                Some(port) => format!("{scheme}://{host}:{port}"),
                None => format!("{scheme}://{host}"),
            };
            builder = builder.with_endpoint(endpoint);
        }
        if let Some(key) = &options.access_key {
            builder = builder.with_access_key_id(key);
        }
        if let Some(secret) = &options.secret_key {
            builder = builder.with_secret_access_key(secret);
        }
        let store = builder.build().map_err(|e| StorageError::Configuration {
            message: e.to_string(),
        })?;

        Ok(Self::with_store(
            Arc::new(store),
            &options.bucket,
            options.disable_remove,
        ))
    }

    /// Serve `bucket` from an already built object store.
    pub fn with_store(store: Arc<dyn ObjectStore>, bucket: &str, disable_remove: bool) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
            disable_remove,
        }
    }
}

#[async_trait]
impl StorageConnector for S3Connector {
    fn kind(&self) -> &'static str {
        BACKEND
    }

    async fn write(&self, path: &str, mut stream: ByteStream) -> StorageResult<WriteMetadata> {
        let location = Path::from(path);
        let upload = self
            .store
            .put_multipart(&location)
            .await
            .map_err(backend_error)?;
        let mut writer = WriteMultipart::new(upload);
        let mut size = 0u64;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    if let Err(e) = writer.wait_for_capacity(MAX_CONCURRENT_PARTS).await {
                        let _ = writer.abort().await;
                        return Err(backend_error(e));
                    }
                    size += chunk.len() as u64;
                    writer.write(&chunk);
                }
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(StorageError::io(path, e));
                }
            }
        }
        writer.finish().await.map_err(backend_error)?;
        debug!(bucket = %self.bucket, path, size, "S3 object written");
        Ok(WriteMetadata { size })
    }

    async fn read(&self, path: &str) -> StorageResult<ByteStream> {
        let result = self
            .store
            .get(&Path::from(path))
            .await
            .map_err(|e| object_error(path, e))?;
        Ok(Box::pin(result.into_stream().map_err(std::io::Error::other)))
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        match self.store.head(&Path::from(path)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(backend_error(e)),
        }
    }

    async fn remove(&self, path: &str) -> StorageResult<bool> {
        if self.disable_remove {
            info!(bucket = %self.bucket, path, "S3 remove disabled, object kept");
            return Ok(true);
        }
        match self.store.delete(&Path::from(path)).await {
            Ok(()) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(backend_error(e)),
        }
    }

    async fn get_diagnostics(&self, depth: DiagnosticDepth) -> DiagnosticReport {
        let listing = match self.store.list_with_delimiter(None).await {
            Ok(listing) => listing,
            Err(e) => {
                let log_id = new_log_id();
                warn!(bucket = %self.bucket, log_id = %log_id, error = %e, "S3 bucket probe failed");
                return DiagnosticReport::failed().with("logId", json!(log_id));
            }
        };

        let mut report = DiagnosticReport::ok().with("bucket", json!(self.bucket));
        if matches!(depth, DiagnosticDepth::StatsBasic | DiagnosticDepth::StatsDeep) {
            report.insert("prefixes", json!(listing.common_prefixes.len()));
            report.insert("objects", json!(listing.objects.len()));
        }
        report
    }
}
