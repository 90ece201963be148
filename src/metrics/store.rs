use parking_lot::Mutex;
use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::time::SystemTime;
use tracing::debug;

use crate::{unix_seconds, Endpoint};

pub const EXPIRY_METRIC: &str = "certificate_expiry_duration_seconds";
pub const PROBE_SUCCESS_METRIC: &str = "certificate_probe_success";
pub const LAST_SUCCESS_METRIC: &str = "certificate_last_successful_probe_timestamp_seconds";
pub const BUILD_INFO_METRIC: &str = "certificate_exporter_build_info";

/// `(server, certificate)` label pair of one expiry series.
type SeriesKey = (String, String);

/// Label-keyed gauge holding the seconds until expiry of every certificate
/// seen so far, plus per-endpoint probe status.
///
/// Owns its registry; nothing is registered process-wide.
pub struct ExpiryGaugeStore {
    registry: Registry,
    expiry: GaugeVec,
    probe_success: GaugeVec,
    last_success: GaugeVec,
    stale_after_cycles: Option<u64>,
    // consecutive successful probes of the endpoint that did not include the series
    series: Mutex<HashMap<SeriesKey, u64>>,
}

impl ExpiryGaugeStore {
    /// Builds the store and registers its metrics.
    ///
    /// `stale_after_cycles` of `None` keeps every series forever.
    pub fn new(stale_after_cycles: Option<u64>) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let expiry = GaugeVec::new(
            Opts::new(EXPIRY_METRIC, "Duration in seconds until certificate expires"),
            &["server", "certificate"],
        )?;
        registry.register(Box::new(expiry.clone()))?;

        let probe_success = GaugeVec::new(
            Opts::new(
                PROBE_SUCCESS_METRIC,
                "Whether the last certificate probe of the server succeeded",
            ),
            &["server"],
        )?;
        registry.register(Box::new(probe_success.clone()))?;

        let last_success = GaugeVec::new(
            Opts::new(
                LAST_SUCCESS_METRIC,
                "Unix time of the last successful certificate probe of the server",
            ),
            &["server"],
        )?;
        registry.register(Box::new(last_success.clone()))?;

        let build_info = Gauge::with_opts(
            Opts::new(BUILD_INFO_METRIC, "Build information of the exporter")
                .const_label("version", env!("CARGO_PKG_VERSION")),
        )?;
        build_info.set(1.0);
        registry.register(Box::new(build_info))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(ExpiryGaugeStore {
            registry,
            expiry,
            probe_success,
            last_success,
            stale_after_cycles,
            series: Mutex::new(HashMap::new()),
        })
    }

    /// Upserts the expiry series of `(endpoint, subject)`.
    pub fn set(&self, endpoint: &Endpoint, subject: &str, seconds_until_expiry: f64) {
        let mut series = self.series.lock();
        self.expiry
            .with_label_values(&[endpoint.as_str(), subject])
            .set(seconds_until_expiry);
        series.insert((endpoint.as_str().to_string(), subject.to_string()), 0);
    }

    /// Current value of a series, `None` if it was never set or was removed.
    pub fn value(&self, endpoint: &Endpoint, subject: &str) -> Option<f64> {
        let series = self.series.lock();
        let key = (endpoint.as_str().to_string(), subject.to_string());
        if !series.contains_key(&key) {
            return None;
        }
        Some(
            self.expiry
                .with_label_values(&[endpoint.as_str(), subject])
                .get(),
        )
    }

    pub fn series_count(&self) -> usize {
        self.series.lock().len()
    }

    /// Records the outcome of one probe of `endpoint`.
    pub fn record_probe(&self, endpoint: &Endpoint, success: bool, at: SystemTime) {
        let server = [endpoint.as_str()];
        if success {
            self.probe_success.with_label_values(&server).set(1.0);
            self.last_success
                .with_label_values(&server)
                .set(unix_seconds(at) as f64);
        } else {
            self.probe_success.with_label_values(&server).set(0.0);
        }
    }

    /// Ages the series of `endpoint` that a successful probe did not report.
    ///
    /// Only does something when stale expiry is enabled. Returns the
    /// subjects whose series were removed.
    pub fn sweep_endpoint(&self, endpoint: &Endpoint, seen: &[String]) -> Vec<String> {
        let limit = match self.stale_after_cycles {
            Some(limit) => limit,
            None => return Vec::new(),
        };

        let mut series = self.series.lock();
        let mut removed = Vec::new();
        series.retain(|(server, subject), missed| {
            if server != endpoint.as_str() || seen.contains(subject) {
                return true;
            }
            *missed += 1;
            if *missed < limit {
                return true;
            }
            if let Err(e) = self
                .expiry
                .remove_label_values(&[server.as_str(), subject.as_str()])
            {
                debug!(server = %server, certificate = %subject, error = %e, "series already gone");
            }
            removed.push(subject.clone());
            false
        });
        removed
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders every registered metric in the text exposition format.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
