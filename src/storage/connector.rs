//! The contract every object store implements.

use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::diagnostics::{DiagnosticDepth, DiagnosticReport};
use crate::storage::StorageResult;

/// Object contents as a stream of byte chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Result of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteMetadata {
    /// Bytes written.
    pub size: u64,
}

/// A stream yielding `data` in one piece.
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(stream::once(async move { Ok(data) }))
}

/// A stream failing immediately with `error`.
pub fn error_stream(error: io::Error) -> ByteStream {
    Box::pin(stream::once(async move { Err(error) }))
}

/// Drain a stream into memory.
pub async fn collect_stream(mut stream: ByteStream) -> io::Result<Bytes> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}

/// One physical (or composite) object store.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StorageConnector: Send + Sync {
    /// Backend name used in logs (`local`, `S3`, `oneof`).
    fn kind(&self) -> &'static str;

    async fn write(&self, path: &str, stream: ByteStream) -> StorageResult<WriteMetadata>;

    async fn read(&self, path: &str) -> StorageResult<ByteStream>;

    async fn exists(&self, path: &str) -> StorageResult<bool>;

    /// `true` when the object was removed.
    async fn remove(&self, path: &str) -> StorageResult<bool>;

    async fn get_diagnostics(&self, depth: DiagnosticDepth) -> DiagnosticReport;
}
