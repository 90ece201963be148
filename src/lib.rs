//! Certificate expiry exporter.
//!
//! Periodically performs a TLS handshake with every configured endpoint,
//! reads the certificate chain the peer presents (without verifying it) and
//! publishes the remaining lifetime of each certificate as the
//! `certificate_expiry_duration_seconds` gauge, labelled by `server` and
//! `certificate`.

pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod sniffer;

use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::hash::MessageDigest;
use openssl::x509::{X509Ref, X509};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use url::{Host, Url};

pub use error::{ExporterError, ProbeError};
pub use metrics::ExpiryGaugeStore;
pub use scheduler::{CycleReport, ProbeOutcome, Scheduler, SchedulerOptions};
pub use sniffer::{CertificateSource, TlsSniffer};

static DEFAULT_PORT: u16 = 443;

/// A configured network address probed for its certificate chain.
///
/// The identity is the address exactly as configured; it is what the
/// `server` label carries, so two spellings of the same host are two
/// endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(String);

/// Host and port an [`Endpoint`] resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Server name to send in the TLS SNI extension; IP literals send none.
    pub fn server_name(&self) -> Option<&str> {
        match self.host.parse::<IpAddr>() {
            Ok(_) => None,
            Err(_) => Some(&self.host),
        }
    }
}

impl Endpoint {
    pub fn new(address: &str) -> Self {
        Endpoint(address.trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolves the configured address into host and port.
    ///
    /// Accepts `host:port`, a bare `host` (port 443), `[v6]:port` and
    /// `https://host[:port]`; other URL schemes are rejected. Malformed
    /// addresses come back as [`ProbeError::InvalidAddress`] so they fail
    /// like any other probe.
    pub fn target(&self) -> Result<Target, ProbeError> {
        let raw = self.as_str();
        let invalid = |reason: &str| ProbeError::InvalidAddress {
            address: raw.to_string(),
            reason: reason.to_string(),
        };

        if raw.is_empty() {
            return Err(invalid("address is empty"));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(invalid("address contains whitespace"));
        }

        let url = if raw.contains("://") {
            Url::parse(raw)
        } else {
            Url::parse(&format!("tls://{}", raw))
        }
        .map_err(|e| invalid(&e.to_string()))?;

        if !matches!(url.scheme(), "https" | "tls") {
            return Err(invalid("only https:// URLs are accepted"));
        }
        if !(url.path().is_empty() || url.path() == "/")
            || url.query().is_some()
            || url.fragment().is_some()
        {
            return Err(invalid("address must not contain a path or query"));
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(invalid("address has no host")),
        };

        let port = url.port_or_known_default().unwrap_or(DEFAULT_PORT);
        if port == 0 {
            return Err(invalid("port must not be zero"));
        }

        Ok(Target { host, port })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(address: &str) -> Self {
        Endpoint::new(address)
    }
}

/// Remaining lifetime of one certificate as seen in one probe.
///
/// Recomputed on every cycle; nothing here is carried over between cycles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CertificateObservation {
    pub endpoint: Endpoint,
    pub subject: String,
    /// Position in the presented chain, 0 is the leaf
    pub chain_position: usize,
    /// notAfter as unix seconds
    pub not_after: i64,
    /// notAfter as printed by OpenSSL, e.g. `Jan  1 00:00:00 2030 GMT`
    pub valid_to: String,
    /// notAfter minus observation time, negative once expired
    pub seconds_until_expiry: i64,
}

/// Turns a presented chain into one observation per certificate, in chain order.
pub fn observe_chain(
    endpoint: &Endpoint,
    chain: &[X509],
    now: SystemTime,
) -> Result<Vec<CertificateObservation>, ProbeError> {
    let now = unix_seconds(now);
    chain
        .iter()
        .enumerate()
        .map(|(position, cert)| {
            let not_after = not_after_unix(cert.not_after())
                .map_err(|e| ProbeError::openssl(endpoint.as_str(), e))?;
            Ok(CertificateObservation {
                endpoint: endpoint.clone(),
                subject: subject_identity(cert),
                chain_position: position,
                not_after,
                valid_to: cert.not_after().to_string(),
                seconds_until_expiry: not_after - now,
            })
        })
        .collect()
}

/// Stable identity of a certificate: its subject DN in RFC 2253 order.
///
/// Certificates with an empty subject are identified by their SHA-256
/// fingerprint instead.
pub fn subject_identity(cert: &X509Ref) -> String {
    let mut parts: Vec<String> = cert
        .subject_name()
        .entries()
        .map(|entry| {
            let key = entry
                .object()
                .nid()
                .short_name()
                .map(str::to_string)
                .unwrap_or_else(|_| entry.object().to_string());
            let value = entry
                .data()
                .as_utf8()
                .map(|s| s.to_string())
                .unwrap_or_else(|_| format!("#{}", hex(entry.data().as_slice())));
            format!("{}={}", key, escape_dn_value(&value))
        })
        .collect();

    if parts.is_empty() {
        return match cert.digest(MessageDigest::sha256()) {
            Ok(digest) => format!("sha256:{}", hex(&digest)),
            Err(_) => "sha256:unknown".to_string(),
        };
    }

    parts.reverse();
    parts.join(",")
}

fn escape_dn_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);
    for (i, c) in value.chars().enumerate() {
        let needs_escape = matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';')
            || (i == 0 && (c == '#' || c == ' '))
            || (i == last && c == ' ');
        if needs_escape {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn not_after_unix(not_after: &Asn1TimeRef) -> Result<i64, openssl::error::ErrorStack> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(not_after)?;
    Ok(i64::from(diff.days) * 86_400 + i64::from(diff.secs))
}

pub(crate) fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}
