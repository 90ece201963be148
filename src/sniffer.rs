//! Certificate sniffing over a single TLS handshake.
//!
//! The handshake is made without verifying the peer: the point is to read
//! whatever chain the server presents, trusted or not.

use openssl::ssl::{HandshakeError, Ssl, SslContext, SslMethod, SslRef, SslVerifyMode};
use openssl::x509::X509;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::{Endpoint, ProbeError, Target};

/// Anything able to hand back the certificate chain an endpoint presents.
///
/// Implementations are called from the blocking thread pool and must not
/// hold on to any connection after returning.
pub trait CertificateSource: Send + Sync {
    fn peer_chain(&self, endpoint: &Endpoint) -> Result<Vec<X509>, ProbeError>;
}

/// OpenSSL backed [`CertificateSource`] bounded by a per-probe timeout.
pub struct TlsSniffer {
    context: SslContext,
    timeout: Duration,
}

impl TlsSniffer {
    pub fn new(timeout: Duration) -> Result<Self, openssl::error::ErrorStack> {
        let mut context = SslContext::builder(SslMethod::tls())?;
        context.set_verify(SslVerifyMode::empty());
        Ok(TlsSniffer {
            context: context.build(),
            timeout,
        })
    }
}

impl CertificateSource for TlsSniffer {
    fn peer_chain(&self, endpoint: &Endpoint) -> Result<Vec<X509>, ProbeError> {
        let address = endpoint.as_str();
        let target = endpoint.target()?;
        let deadline = Instant::now() + self.timeout;

        let tcp_stream = connect(address, &target, deadline)?;
        let remaining = remaining_until(address, deadline, "tls handshake")?;
        tcp_stream
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::from_io(address, "tls handshake", e))?;
        tcp_stream
            .set_write_timeout(Some(remaining))
            .map_err(|e| ProbeError::from_io(address, "tls handshake", e))?;

        let mut ssl = Ssl::new(&self.context).map_err(|e| ProbeError::openssl(address, e))?;
        if let Some(server_name) = target.server_name() {
            ssl.set_hostname(server_name)
                .map_err(|e| ProbeError::openssl(address, e))?;
        }

        let mut stream = ssl
            .connect(tcp_stream)
            .map_err(|e| handshake_error(address, e))?;
        debug!(
            endpoint = address,
            version = stream.ssl().version_str(),
            "tls handshake completed"
        );

        let chain = presented_chain(stream.ssl());
        // Close notify is a courtesy; the socket is dropped either way.
        let _ = stream.shutdown();
        Ok(chain)
    }
}

/// Leaf first, followed by whatever intermediates the peer sent.
fn presented_chain(ssl: &SslRef) -> Vec<X509> {
    match ssl.peer_cert_chain() {
        Some(stack) => stack.iter().map(|cert| cert.to_owned()).collect(),
        None => ssl.peer_certificate().into_iter().collect(),
    }
}

fn connect(address: &str, target: &Target, deadline: Instant) -> Result<TcpStream, ProbeError> {
    let socket_addrs: Vec<SocketAddr> = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| ProbeError::DnsResolution {
            address: address.to_string(),
            source: e,
        })?
        .collect();

    if socket_addrs.is_empty() {
        return Err(ProbeError::DnsResolution {
            address: address.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses returned"),
        });
    }

    let mut last_error = None;
    for socket_addr in socket_addrs {
        let remaining = remaining_until(address, deadline, "tcp connect")?;
        match TcpStream::connect_timeout(&socket_addr, remaining) {
            Ok(stream) => {
                debug!(endpoint = address, peer = %socket_addr, "tcp connection established");
                return Ok(stream);
            }
            Err(e) => {
                debug!(endpoint = address, peer = %socket_addr, error = %e, "tcp connect failed");
                last_error = Some(e);
            }
        }
    }

    let e = last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no address tried"));
    Err(ProbeError::from_io(address, "tcp connect", e))
}

fn remaining_until(
    address: &str,
    deadline: Instant,
    operation: &str,
) -> Result<Duration, ProbeError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(ProbeError::Timeout {
            address: address.to_string(),
            operation: operation.to_string(),
        });
    }
    Ok(remaining)
}

fn handshake_error<S>(address: &str, e: HandshakeError<S>) -> ProbeError {
    match e {
        HandshakeError::SetupFailure(stack) => ProbeError::openssl(address, stack),
        HandshakeError::WouldBlock(_) => ProbeError::Timeout {
            address: address.to_string(),
            operation: "tls handshake".to_string(),
        },
        HandshakeError::Failure(mid) => {
            let timed_out = mid
                .error()
                .io_error()
                .map(|io| matches!(io.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock))
                .unwrap_or(false);
            if timed_out {
                ProbeError::Timeout {
                    address: address.to_string(),
                    operation: "tls handshake".to_string(),
                }
            } else {
                ProbeError::HandshakeFailed {
                    address: address.to_string(),
                    details: mid.error().to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_invalid_address_fails_before_connecting() {
        let sniffer = TlsSniffer::new(Duration::from_secs(1)).unwrap();
        let err = sniffer.peer_chain(&Endpoint::new("not a host")).unwrap_err();
        assert!(matches!(err, ProbeError::InvalidAddress { .. }));
    }

    #[test]
    fn test_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let sniffer = TlsSniffer::new(Duration::from_secs(2)).unwrap();
        let endpoint = Endpoint::new(&format!("127.0.0.1:{}", port));
        match sniffer.peer_chain(&endpoint) {
            Err(ProbeError::ConnectionFailed { address, .. }) => {
                assert_eq!(address, endpoint.as_str())
            }
            other => panic!("expected ConnectionFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept and hold the socket without ever answering the ClientHello.
        let holder = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(2));
            drop(socket);
        });

        let sniffer = TlsSniffer::new(Duration::from_millis(300)).unwrap();
        let started = Instant::now();
        let err = sniffer
            .peer_chain(&Endpoint::new(&format!("127.0.0.1:{}", port)))
            .unwrap_err();

        assert!(matches!(err, ProbeError::Timeout { .. }), "got {:?}", err);
        assert!(started.elapsed() < Duration::from_secs(2));
        holder.join().unwrap();
    }

    #[test]
    fn test_peer_closing_early_is_handshake_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let closer = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            drop(socket);
        });

        let sniffer = TlsSniffer::new(Duration::from_secs(2)).unwrap();
        let err = sniffer
            .peer_chain(&Endpoint::new(&format!("127.0.0.1:{}", port)))
            .unwrap_err();

        assert!(
            matches!(
                err,
                ProbeError::HandshakeFailed { .. } | ProbeError::ConnectionFailed { .. }
            ),
            "got {:?}",
            err
        );
        closer.join().unwrap();
    }
}
