//! Tests for the diagnostics registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{
    DiagnosticDepth, DiagnosticProvider, DiagnosticReport, DiagnosticsError, DiagnosticsRegistry,
};

struct StaticProvider {
    key: &'static str,
    alive: bool,
    polls: Arc<AtomicUsize>,
    period: Option<Duration>,
}

impl StaticProvider {
    fn new(key: &'static str, alive: bool) -> Self {
        Self {
            key,
            alive,
            polls: Arc::new(AtomicUsize::new(0)),
            period: None,
        }
    }
}

#[async_trait]
impl DiagnosticProvider for StaticProvider {
    fn key(&self) -> String {
        self.key.to_string()
    }

    fn poll_period(&self) -> Option<Duration> {
        self.period
    }

    async fn get_diagnostics(&self, depth: DiagnosticDepth) -> DiagnosticReport {
        if depth == DiagnosticDepth::StatsTrack {
            self.polls.fetch_add(1, Ordering::SeqCst);
        }
        if self.alive {
            DiagnosticReport::ok().with("depth", json!(depth.to_string()))
        } else {
            DiagnosticReport::failed()
        }
    }
}

#[tokio::test]
async fn test_summary_is_ok_when_every_provider_is_ok() {
    let registry = DiagnosticsRegistry::new();
    registry
        .register(Arc::new(StaticProvider::new("db", true)))
        .unwrap();
    registry
        .register(Arc::new(StaticProvider::new("storage", true)))
        .unwrap();

    let summary = registry.get(DiagnosticDepth::Alive).await;
    assert!(summary.ok);
    assert_eq!(summary.providers.len(), 2);
    assert_eq!(summary.providers["db"].details["depth"], json!("alive"));
}

#[tokio::test]
async fn test_one_failing_provider_fails_the_summary() {
    let registry = DiagnosticsRegistry::new();
    registry
        .register(Arc::new(StaticProvider::new("db", true)))
        .unwrap();
    registry
        .register(Arc::new(StaticProvider::new("storage", false)))
        .unwrap();

    let summary = registry.get(DiagnosticDepth::Alive).await;
    assert!(!summary.ok);
    assert!(summary.providers["db"].ok);
    assert!(!summary.providers["storage"].ok);
}

#[tokio::test]
async fn test_duplicate_keys_are_rejected() {
    let registry = DiagnosticsRegistry::new();
    registry
        .register(Arc::new(StaticProvider::new("db", true)))
        .unwrap();
    let err = registry
        .register(Arc::new(StaticProvider::new("db", true)))
        .unwrap_err();
    assert_eq!(
        err,
        DiagnosticsError::DuplicateProvider {
            key: "db".to_string()
        }
    );
}

#[tokio::test]
async fn test_registration_refused_after_shutdown() {
    let registry = DiagnosticsRegistry::new();
    registry.shutdown();
    assert!(registry.is_shut_down());

    let err = registry
        .register(Arc::new(StaticProvider::new("db", true)))
        .unwrap_err();
    assert_eq!(err, DiagnosticsError::ShutDown);
}

#[tokio::test]
async fn test_poller_samples_until_shutdown() {
    let registry = DiagnosticsRegistry::new();
    let mut provider = StaticProvider::new("db", true);
    provider.period = Some(Duration::from_millis(10));
    let polls = Arc::clone(&provider.polls);
    registry.register(Arc::new(provider)).unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(polls.load(Ordering::SeqCst) >= 2);
    assert!(registry.latest("db").is_some());

    registry.shutdown();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let after_shutdown = polls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(polls.load(Ordering::SeqCst), after_shutdown);
}
