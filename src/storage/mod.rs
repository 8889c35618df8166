//! Object storage.
//!
//! # Architecture
//!
//! - `connector`: the [`StorageConnector`] contract and stream helpers
//! - `local` / `s3`: physical backends
//! - `strategy`: `default` and `oneof` composition of backends
//! - `crypto`: per-object AES-256-CBC
//! - `service`: chunk paths, encryption and read probing for callers

mod connector;
mod crypto;
mod error;
mod local;
#[cfg(feature = "s3")]
mod s3;
mod service;
mod strategy;

#[cfg(test)]
mod service_test;

#[cfg(test)]
pub use connector::MockStorageConnector;
pub use connector::{
    ByteStream, StorageConnector, WriteMetadata, bytes_stream, collect_stream, error_stream,
};
pub use crypto::Cipher;
pub use error::{StorageError, StorageResult};
pub use local::LocalConnector;
#[cfg(feature = "s3")]
pub use s3::S3Connector;
pub use service::{StorageService, chunk_path};
pub use strategy::{
    DefaultStrategy, OneOfStrategy, backend_from_config, strategy_from_config, tee,
};
