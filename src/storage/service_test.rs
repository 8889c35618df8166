//! Tests for the storage service.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tempfile::TempDir;

use crate::config::{LocalOptions, ReadRetryConfig, StorageBackendConfig, StorageConfig, StorageKind};
use crate::diagnostics::{DiagnosticDepth, DiagnosticProvider};
use crate::storage::{
    Cipher, LocalConnector, MockStorageConnector, StorageError, StorageService, bytes_stream,
    chunk_path, collect_stream,
};

fn fast_retry(attempts: u32) -> ReadRetryConfig {
    ReadRetryConfig {
        attempts,
        delay_ms: 1,
    }
}

fn local_service(dir: &TempDir, cipher: Option<Cipher>) -> StorageService {
    StorageService::new(
        Arc::new(LocalConnector::new(dir.path())),
        cipher,
        fast_retry(2),
    )
}

async fn read_all(service: &StorageService, path: &str, chunks: Option<u32>) -> Vec<u8> {
    let stream = service.read(path, chunks).await.unwrap();
    collect_stream(stream).await.unwrap().to_vec()
}

#[test]
fn test_chunk_path() {
    assert_eq!(chunk_path("files/c1/f1", None), "files/c1/f1");
    assert_eq!(chunk_path("files/c1/f1", Some(1)), "files/c1/f1/chunk1");
    assert_eq!(chunk_path("files/c1/f1/", Some(12)), "files/c1/f1/chunk12");
}

#[tokio::test]
async fn test_plain_write_and_read() {
    let dir = TempDir::new().unwrap();
    let service = local_service(&dir, None);

    let metadata = service
        .write("files/f1", bytes_stream("plain"), None)
        .await
        .unwrap();
    assert_eq!(metadata.size, 5);
    assert_eq!(std::fs::read(dir.path().join("files/f1")).unwrap(), b"plain");
    assert_eq!(read_all(&service, "files/f1", None).await, b"plain");
}

#[tokio::test]
async fn test_encrypted_objects_are_ciphertext_at_rest() {
    let dir = TempDir::new().unwrap();
    let service = local_service(&dir, Some(Cipher::new("secret", "iv")));
    assert!(service.is_encrypted());

    let metadata = service
        .write("f1", bytes_stream("confidential"), Some(1))
        .await
        .unwrap();
    assert_eq!(metadata.size, 12);

    let at_rest = std::fs::read(dir.path().join("f1/chunk1")).unwrap();
    assert_ne!(at_rest, b"confidential");
    assert_eq!(at_rest.len() % 16, 0);

    assert_eq!(read_all(&service, "f1", Some(1)).await, b"confidential");
}

#[tokio::test]
async fn test_chunks_are_concatenated_in_order() {
    let dir = TempDir::new().unwrap();
    let service = local_service(&dir, Some(Cipher::new("secret", "iv")));
    for (n, part) in [(1, "alpha-"), (2, "beta-"), (3, "gamma")] {
        service
            .write("f1", bytes_stream(part), Some(n))
            .await
            .unwrap();
    }

    assert_eq!(read_all(&service, "f1", Some(3)).await, b"alpha-beta-gamma");
    assert!(service.exists("f1", Some(2)).await.unwrap());
    assert!(!service.exists("f1", Some(4)).await.unwrap());
}

#[tokio::test]
async fn test_missing_later_chunk_fails_the_stream() {
    let dir = TempDir::new().unwrap();
    let service = local_service(&dir, None);
    service.write("f1", bytes_stream("a"), Some(1)).await.unwrap();

    let stream = service.read("f1", Some(2)).await.unwrap();
    assert!(collect_stream(stream).await.is_err());
}

#[tokio::test]
async fn test_missing_object_is_not_found_after_probing() {
    let dir = TempDir::new().unwrap();
    let service = local_service(&dir, None);

    let err = service.read("nope", None).await.err().unwrap();
    assert!(err.is_not_found());
    assert!(service.read("nope", Some(0)).await.err().unwrap().is_not_found());
}

#[tokio::test]
async fn test_probe_waits_for_late_objects() {
    let probes = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&probes);

    let mut mock = MockStorageConnector::new();
    mock.expect_exists()
        .returning(move |_| Ok(counter.fetch_add(1, Ordering::SeqCst) >= 2));
    mock.expect_read()
        .times(1)
        .returning(|_| Ok(bytes_stream("late")));

    let service = StorageService::new(Arc::new(mock), None, fast_retry(5));
    let stream = service.read("f1", None).await.unwrap();
    assert_eq!(&collect_stream(stream).await.unwrap()[..], b"late");
    assert_eq!(probes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_probe_gives_up_after_configured_attempts() {
    let mut mock = MockStorageConnector::new();
    mock.expect_exists().times(3).returning(|_| Ok(false));
    mock.expect_read().never();

    let service = StorageService::new(Arc::new(mock), None, fast_retry(3));
    assert!(service.read("f1", None).await.err().unwrap().is_not_found());
}

#[tokio::test]
async fn test_remove_covers_every_chunk() {
    let dir = TempDir::new().unwrap();
    let service = local_service(&dir, None);
    for n in 1..=3 {
        service.write("f1", bytes_stream("x"), Some(n)).await.unwrap();
    }

    assert!(service.remove("f1", Some(3)).await.unwrap());
    assert!(!service.exists("f1", Some(1)).await.unwrap());

    service.write("f2", bytes_stream("x"), Some(1)).await.unwrap();
    assert!(!service.remove("f2", Some(2)).await.unwrap());
}

#[tokio::test]
async fn test_remove_keeps_going_after_a_failed_chunk() {
    let attempted = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = Arc::clone(&attempted);

    let mut mock = MockStorageConnector::new();
    mock.expect_remove().times(3).returning(move |path| {
        seen.lock().unwrap().push(path.to_string());
        if path.ends_with("chunk1") {
            Err(StorageError::Backend {
                backend: "mock".into(),
                message: "timeout".into(),
            })
        } else {
            Ok(true)
        }
    });

    let service = StorageService::new(Arc::new(mock), None, fast_retry(1));
    assert!(!service.remove("f1", Some(3)).await.unwrap());
    assert_eq!(
        *attempted.lock().unwrap(),
        vec!["f1/chunk1", "f1/chunk2", "f1/chunk3"]
    );
}

#[tokio::test]
async fn test_diagnostics_poll_period_comes_from_config() {
    let dir = TempDir::new().unwrap();
    let mut config = StorageConfig {
        backend: StorageBackendConfig {
            kind: StorageKind::Local,
            s3: None,
            local: Some(LocalOptions {
                path: dir.path().display().to_string(),
            }),
        },
        ..Default::default()
    };
    assert!(StorageService::from_config(&config).unwrap().poll_period().is_none());

    config.diagnostics_poll_ms = Some(250);
    let service = StorageService::from_config(&config).unwrap();
    assert_eq!(service.poll_period(), Some(std::time::Duration::from_millis(250)));
}

#[tokio::test]
async fn test_from_config_with_local_storage() {
    let dir = TempDir::new().unwrap();
    let config = StorageConfig {
        secret: Some("s".into()),
        iv: Some("i".into()),
        backend: StorageBackendConfig {
            kind: StorageKind::Local,
            s3: None,
            local: Some(LocalOptions {
                path: dir.path().display().to_string(),
            }),
        },
        ..Default::default()
    };

    let service = StorageService::from_config(&config).unwrap();
    assert!(service.is_encrypted());
    assert_eq!(service.backend().kind(), "local");

    let report = service.get_diagnostics(DiagnosticDepth::Alive).await;
    assert!(report.ok);
    assert_eq!(report.details["encrypted"], serde_json::json!(true));
    assert_eq!(service.key(), "storage");
}
