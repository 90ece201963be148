//! Probe cycle against real TLS endpoints, scraped over HTTP.

mod common;

use cert_expiry_exporter::metrics;
use cert_expiry_exporter::{
    Endpoint, ExpiryGaugeStore, Scheduler, SchedulerOptions, TlsSniffer,
};
use common::{certificate, closed_address, now_unix, TlsServer, TEN_DAYS};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn sample_value(text: &str, prefix: &str) -> Option<f64> {
    text.lines()
        .find(|line| line.starts_with(prefix))
        .and_then(|line| line.rsplit(' ').next())
        .and_then(|value| value.parse().ok())
}

#[tokio::test]
async fn test_scrape_after_cycle_with_one_unreachable_endpoint() {
    let (leaf, key) = certificate(&[("CN", "example.com")], now_unix() + TEN_DAYS);
    let server = TlsServer::start(&leaf, &key, &[], 1);
    let good = server.address();
    let bad = closed_address();

    let store = Arc::new(ExpiryGaugeStore::new(None).unwrap());
    let sniffer = Arc::new(TlsSniffer::new(Duration::from_secs(5)).unwrap());
    let mut scheduler = Scheduler::new(
        vec![Endpoint::new(&bad), Endpoint::new(&good)],
        sniffer,
        Arc::clone(&store),
        SchedulerOptions {
            timeout: Duration::from_secs(5),
            ..SchedulerOptions::default()
        },
    );
    let report = scheduler.run_cycle().await;
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.failed(), 1);
    tokio::task::spawn_blocking(move || server.join()).await.unwrap();

    let listener = metrics::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let cancel = CancellationToken::new();
    let serving = tokio::spawn(metrics::serve(
        listener,
        metrics::router(Arc::clone(&store), "/metrics"),
        cancel.clone(),
    ));

    let response = reqwest::get(format!("http://127.0.0.1:{}/metrics", port))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let content_type = response.headers()[reqwest::header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/plain"));
    let body = response.text().await.unwrap();

    let value = sample_value(
        &body,
        &format!(
            "certificate_expiry_duration_seconds{{certificate=\"CN=example.com\",server=\"{}\"}}",
            good
        ),
    )
    .expect("expiry sample missing");
    assert!((value - TEN_DAYS as f64).abs() <= 60.0, "value was {}", value);

    assert!(!body.contains(&format!(
        "certificate_expiry_duration_seconds{{certificate=\"CN=example.com\",server=\"{}\"}}",
        bad
    )));
    assert_eq!(
        sample_value(&body, &format!("certificate_probe_success{{server=\"{}\"}}", bad)),
        Some(0.0)
    );
    assert_eq!(
        sample_value(&body, &format!("certificate_probe_success{{server=\"{}\"}}", good)),
        Some(1.0)
    );

    let health = reqwest::get(format!("http://127.0.0.1:{}/health", port))
        .await
        .unwrap();
    assert_eq!(health.text().await.unwrap(), "OK");

    cancel.cancel();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = taken.local_addr().unwrap().to_string();

    match metrics::bind(&address).await {
        Err(cert_expiry_exporter::ExporterError::Bind { address: failed, .. }) => {
            assert_eq!(failed, address)
        }
        other => panic!("expected bind error, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_custom_metrics_path() {
    let store = Arc::new(ExpiryGaugeStore::new(None).unwrap());
    store.set(&Endpoint::new("example.com:443"), "CN=example.com", 42.0);

    let listener = metrics::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let cancel = CancellationToken::new();
    let serving = tokio::spawn(metrics::serve(
        listener,
        metrics::router(store, "/probe/metrics"),
        cancel.clone(),
    ));

    let body = reqwest::get(format!("http://127.0.0.1:{}/probe/metrics", port))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("server=\"example.com:443\"} 42"));

    let missing = reqwest::get(format!("http://127.0.0.1:{}/metrics", port))
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    cancel.cancel();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_all_interfaces_shorthand_binds() {
    let settings = cert_expiry_exporter::config::Config {
        targets: Some(vec!["example.com:443".to_string()]),
        listen_address: Some(":0".to_string()),
        ..cert_expiry_exporter::config::Config::defaults()
    }
    .resolve()
    .unwrap();
    assert_eq!(settings.listen_address, "[::]:0");

    let listener = metrics::bind(&settings.listen_address).await.unwrap();
    let local = listener.local_addr().unwrap();
    assert!(local.ip().is_unspecified());
    assert_ne!(local.port(), 0);

    let cancel = CancellationToken::new();
    let serving = tokio::spawn(metrics::serve(
        listener,
        metrics::router(Arc::new(ExpiryGaugeStore::new(None).unwrap()), "/metrics"),
        cancel.clone(),
    ));
    let health = reqwest::get(format!("http://127.0.0.1:{}/health", local.port()))
        .await
        .unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);

    cancel.cancel();
    serving.await.unwrap().unwrap();
}
