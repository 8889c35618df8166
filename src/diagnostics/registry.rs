//! Registry, pollers and aggregation for diagnostic providers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DiagnosticDepth, DiagnosticProvider, DiagnosticReport};

/// Errors raised by the registry itself.
#[derive(Error, Diagnostic, Debug, PartialEq, Eq)]
pub enum DiagnosticsError {
    #[error("Diagnostics registry is shut down")]
    #[diagnostic(code(drive::diagnostics::shut_down))]
    ShutDown,

    #[error("Diagnostic provider '{key}' is already registered")]
    #[diagnostic(code(drive::diagnostics::duplicate))]
    DuplicateProvider { key: String },
}

/// Aggregated result of probing every provider at one depth.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSummary {
    pub ok: bool,
    pub depth: DiagnosticDepth,
    pub providers: BTreeMap<String, DiagnosticReport>,
}

#[derive(Default)]
struct RegistryState {
    providers: Vec<Arc<dyn DiagnosticProvider>>,
    pollers: Vec<JoinHandle<()>>,
    closed: bool,
}

/// Process-wide set of diagnostic providers.
///
/// Built once at startup and handed to every component that registers.
/// Registering a provider with a poll period spawns a tokio task, so that
/// call must happen inside a runtime.
pub struct DiagnosticsRegistry {
    state: Mutex<RegistryState>,
    latest: Arc<dashmap::DashMap<String, DiagnosticReport>>,
    cancel: CancellationToken,
}

impl Default for DiagnosticsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticsRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            latest: Arc::new(dashmap::DashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn register(&self, provider: Arc<dyn DiagnosticProvider>) -> Result<(), DiagnosticsError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(DiagnosticsError::ShutDown);
        }
        let key = provider.key();
        if state.providers.iter().any(|p| p.key() == key) {
            return Err(DiagnosticsError::DuplicateProvider { key });
        }

        if let Some(period) = provider.poll_period() {
            let provider = Arc::clone(&provider);
            let latest = Arc::clone(&self.latest);
            let cancel = self.cancel.child_token();
            state.pollers.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            let key = provider.key();
                            let report = provider.get_diagnostics(DiagnosticDepth::StatsTrack).await;
                            if report.ok {
                                debug!(provider = %key, report = ?report.details, "diagnostics poll");
                            } else {
                                warn!(provider = %key, report = ?report.details, "diagnostics poll reported failure");
                            }
                            latest.insert(key, report);
                        }
                    }
                }
            }));
        }

        info!(provider = %key, "diagnostic provider registered");
        state.providers.push(provider);
        Ok(())
    }

    /// Keys of the registered providers, in registration order.
    pub fn provider_keys(&self) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.providers.iter().map(|p| p.key()).collect()
    }

    /// Last `stats_track` sample taken by the poller of `key`.
    pub fn latest(&self, key: &str) -> Option<DiagnosticReport> {
        self.latest.get(key).map(|r| r.value().clone())
    }

    /// Probe every provider concurrently at `depth`.
    pub async fn get(&self, depth: DiagnosticDepth) -> DiagnosticsSummary {
        let providers: Vec<Arc<dyn DiagnosticProvider>> = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.providers.clone()
        };

        let reports = join_all(providers.iter().map(|provider| async move {
            (provider.key(), provider.get_diagnostics(depth).await)
        }))
        .await;

        let ok = reports.iter().all(|(_, report)| report.ok);
        DiagnosticsSummary {
            ok,
            depth,
            providers: reports.into_iter().collect(),
        }
    }

    /// Stop every poller and refuse further registrations.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return;
        }
        state.closed = true;
        self.cancel.cancel();
        for poller in state.pollers.drain(..) {
            poller.abort();
        }
        info!("diagnostics registry shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed
    }
}

impl Drop for DiagnosticsRegistry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
