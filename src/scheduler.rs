//! Probe scheduling.
//!
//! One cycle probes every configured endpoint, at most `concurrency` at a
//! time, and then writes the results into the gauge store in configured
//! order. Between cycles the scheduler pauses for a fixed interval that
//! does not account for how long the cycle took.

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::{
    observe_chain, unix_seconds, CertificateObservation, CertificateSource, Endpoint,
    ExpiryGaugeStore, ProbeError,
};

/// Slack on top of the probe timeout before the scheduler stops waiting
/// for a probe that is still blocked in the OS.
const PROBE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Pause after each cycle
    pub interval: Duration,
    /// Per-probe bound for connect plus handshake
    pub timeout: Duration,
    /// Endpoints probed at once, 1 probes them one after another
    pub concurrency: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
            concurrency: 1,
        }
    }
}

impl From<&Settings> for SchedulerOptions {
    fn from(settings: &Settings) -> Self {
        SchedulerOptions {
            interval: settings.interval,
            timeout: settings.timeout,
            concurrency: settings.concurrency,
        }
    }
}

/// What one probe of one endpoint produced.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Observed {
        endpoint: Endpoint,
        certificates: Vec<CertificateObservation>,
    },
    Failed {
        endpoint: Endpoint,
        error: String,
    },
}

impl ProbeOutcome {
    pub fn endpoint(&self) -> &Endpoint {
        match self {
            ProbeOutcome::Observed { endpoint, .. } | ProbeOutcome::Failed { endpoint, .. } => {
                endpoint
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Observed { .. })
    }
}

/// Outcome of one cycle, one entry per endpoint in configured order.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: i64,
    pub duration_ms: u128,
    pub outcomes: Vec<ProbeOutcome>,
}

impl CycleReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

pub struct Scheduler {
    endpoints: Vec<Endpoint>,
    source: Arc<dyn CertificateSource>,
    store: Arc<ExpiryGaugeStore>,
    options: SchedulerOptions,
    cycle: u64,
    in_flight: Arc<Mutex<HashSet<Endpoint>>>,
}

impl Scheduler {
    pub fn new(
        endpoints: Vec<Endpoint>,
        source: Arc<dyn CertificateSource>,
        store: Arc<ExpiryGaugeStore>,
        options: SchedulerOptions,
    ) -> Self {
        Scheduler {
            endpoints,
            source,
            store,
            options,
            cycle: 0,
            in_flight: Arc::default(),
        }
    }

    /// Probes until `cancel` fires.
    ///
    /// Cancellation is honoured while probes are in flight and during the
    /// pause; a cycle interrupted before its results were applied leaves the
    /// store untouched.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            endpoints = self.endpoints.len(),
            interval_secs = self.options.interval.as_secs(),
            timeout_secs = self.options.timeout.as_secs(),
            concurrency = self.options.concurrency,
            "probe scheduler started"
        );

        while !cancel.is_cancelled() {
            let report = tokio::select! {
                report = self.run_cycle() => report,
                _ = cancel.cancelled() => break,
            };
            info!(
                cycle = report.cycle,
                succeeded = report.succeeded(),
                failed = report.failed(),
                duration_ms = report.duration_ms as u64,
                "probe cycle finished"
            );

            tokio::select! {
                _ = tokio::time::sleep(self.options.interval) => {}
                _ = cancel.cancelled() => break,
            }
        }

        info!("probe scheduler stopped");
    }

    /// Runs exactly one cycle over every endpoint.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycle += 1;
        let started = Instant::now();
        let started_at = SystemTime::now();

        let source = Arc::clone(&self.source);
        let in_flight = Arc::clone(&self.in_flight);
        let timeout = self.options.timeout;
        let results: Vec<(Endpoint, Result<Vec<CertificateObservation>, ProbeError>)> =
            stream::iter(self.endpoints.clone())
                .map(move |endpoint| {
                    let source = Arc::clone(&source);
                    let in_flight = Arc::clone(&in_flight);
                    async move {
                        let result = probe(source, in_flight, &endpoint, timeout).await;
                        (endpoint, result)
                    }
                })
                .buffered(self.options.concurrency.max(1))
                .collect()
                .await;

        let outcomes = results
            .into_iter()
            .map(|(endpoint, result)| self.apply(endpoint, result))
            .collect();

        CycleReport {
            cycle: self.cycle,
            started_at: unix_seconds(started_at),
            duration_ms: started.elapsed().as_millis(),
            outcomes,
        }
    }

    fn apply(
        &self,
        endpoint: Endpoint,
        result: Result<Vec<CertificateObservation>, ProbeError>,
    ) -> ProbeOutcome {
        match result {
            Ok(certificates) => {
                if certificates.is_empty() {
                    debug!(server = %endpoint, "endpoint presented no certificates");
                }
                for observation in &certificates {
                    debug!(
                        server = %endpoint,
                        certificate = %observation.subject,
                        seconds_until_expiry = observation.seconds_until_expiry,
                        "observed certificate"
                    );
                    self.store.set(
                        &endpoint,
                        &observation.subject,
                        observation.seconds_until_expiry as f64,
                    );
                }

                let seen: Vec<String> = certificates.iter().map(|o| o.subject.clone()).collect();
                for subject in self.store.sweep_endpoint(&endpoint, &seen) {
                    info!(server = %endpoint, certificate = %subject, "removed stale certificate series");
                }
                self.store.record_probe(&endpoint, true, SystemTime::now());

                ProbeOutcome::Observed {
                    endpoint,
                    certificates,
                }
            }
            Err(e) => {
                warn!(server = %endpoint, error = %e, "failed to sniff certificates");
                self.store.record_probe(&endpoint, false, SystemTime::now());
                ProbeOutcome::Failed {
                    endpoint,
                    error: e.to_string(),
                }
            }
        }
    }
}

/// Marks an endpoint as having a blocking sniff in progress until dropped.
struct InFlight {
    endpoints: Arc<Mutex<HashSet<Endpoint>>>,
    endpoint: Endpoint,
}

impl InFlight {
    fn claim(endpoints: &Arc<Mutex<HashSet<Endpoint>>>, endpoint: &Endpoint) -> Option<Self> {
        if !endpoints.lock().insert(endpoint.clone()) {
            return None;
        }
        Some(InFlight {
            endpoints: Arc::clone(endpoints),
            endpoint: endpoint.clone(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.endpoints.lock().remove(&self.endpoint);
    }
}

/// Runs one blocking sniff on the blocking pool, bounded by `timeout`.
///
/// A sniff stuck in the OS (DNS lookups cannot be interrupted) keeps its
/// blocking thread after the deadline passes. Until that thread returns,
/// later cycles fail the endpoint straight away instead of starting another
/// sniff, so one unresponsive resolver holds at most one thread per endpoint.
async fn probe(
    source: Arc<dyn CertificateSource>,
    in_flight: Arc<Mutex<HashSet<Endpoint>>>,
    endpoint: &Endpoint,
    timeout: Duration,
) -> Result<Vec<CertificateObservation>, ProbeError> {
    let guard = InFlight::claim(&in_flight, endpoint).ok_or_else(|| ProbeError::Other {
        address: endpoint.as_str().to_string(),
        message: "previous attempt is still running".to_string(),
    })?;

    let task_endpoint = endpoint.clone();
    let task = tokio::task::spawn_blocking(move || {
        let _guard = guard;
        let chain = source.peer_chain(&task_endpoint)?;
        observe_chain(&task_endpoint, &chain, SystemTime::now())
    });

    match tokio::time::timeout(timeout + PROBE_GRACE, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(ProbeError::Other {
            address: endpoint.as_str().to_string(),
            message: format!("probe task failed: {}", join_error),
        }),
        Err(_) => Err(ProbeError::Timeout {
            address: endpoint.as_str().to_string(),
            operation: "certificate probe".to_string(),
        }),
    }
}
