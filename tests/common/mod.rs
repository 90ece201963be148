#![allow(dead_code)]

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{NameType, SslAcceptor, SslMethod};
use openssl::x509::{X509NameBuilder, X509};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

pub const TEN_DAYS: i64 = 10 * 86_400;

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

/// Self-signed EC certificate with the given subject, expiring at `not_after_unix`.
pub fn certificate(subject: &[(&str, &str)], not_after_unix: i64) -> (X509, PKey<Private>) {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    for (field, value) in subject {
        name.append_entry_by_text(field, value).unwrap();
    }
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(42).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::from_unix(not_after_unix).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

/// TLS server on 127.0.0.1 presenting `leaf` followed by `extra` for a fixed
/// number of connections.
pub struct TlsServer {
    pub port: u16,
    pub server_names: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl TlsServer {
    pub fn start(leaf: &X509, key: &PKey<Private>, extra: &[X509], connections: usize) -> Self {
        let server_names = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&server_names);

        let mut acceptor = SslAcceptor::mozilla_intermediate(SslMethod::tls()).unwrap();
        acceptor.set_private_key(key).unwrap();
        acceptor.set_certificate(leaf).unwrap();
        for cert in extra {
            acceptor.add_extra_chain_cert(cert.clone()).unwrap();
        }
        acceptor.check_private_key().unwrap();
        acceptor.set_servername_callback(move |ssl, _alert| {
            if let Some(name) = ssl.servername(NameType::HOST_NAME) {
                recorded.lock().unwrap().push(name.to_string());
            }
            Ok(())
        });
        let acceptor = acceptor.build();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            for stream in listener.incoming().take(connections) {
                if let Ok(stream) = stream {
                    if let Ok(mut tls) = acceptor.accept(stream) {
                        let _ = tls.shutdown();
                    }
                }
            }
        });

        TlsServer {
            port,
            server_names,
            handle,
        }
    }

    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn join(self) {
        self.handle.join().unwrap();
    }
}

/// An address nothing listens on.
pub fn closed_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);
    address
}
