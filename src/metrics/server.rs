use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use prometheus::{Encoder, TextEncoder};
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::ExpiryGaugeStore;
use crate::ExporterError;

#[derive(Clone)]
struct ExporterState {
    store: Arc<ExpiryGaugeStore>,
}

/// Routes serving the store at `metrics_path`, plus `/health`.
pub fn router(store: Arc<ExpiryGaugeStore>, metrics_path: &str) -> Router {
    let mut router = Router::new().route(metrics_path, get(handle_metrics));
    if metrics_path != "/health" {
        router = router.route("/health", get(handle_health));
    }
    router.with_state(ExporterState { store })
}

/// Binds the exposition listener. Failing here is fatal for the process.
///
/// `[::]:port` falls back to `0.0.0.0:port` on hosts without IPv6.
pub async fn bind(address: &str) -> Result<TcpListener, ExporterError> {
    match TcpListener::bind(address).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() != io::ErrorKind::AddrInUse && address.starts_with("[::]:") => {
            let fallback = address.replacen("[::]", "0.0.0.0", 1);
            warn!(address, fallback = %fallback, error = %e, "IPv6 unavailable, listening on IPv4 only");
            TcpListener::bind(&fallback)
                .await
                .map_err(|e| ExporterError::Bind {
                    address: fallback.clone(),
                    source: e,
                })
        }
        Err(e) => Err(ExporterError::Bind {
            address: address.to_string(),
            source: e,
        }),
    }
}

/// Serves `router` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), ExporterError> {
    if let Ok(local) = listener.local_addr() {
        info!(address = %local, "serving metrics");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(ExporterError::Serve)
}

async fn handle_metrics(State(state): State<ExporterState>) -> Result<impl IntoResponse, StatusCode> {
    let body = state.store.encode_text().map_err(|e| {
        error!(error = %e, "failed to encode metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok((
        [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
        body,
    ))
}

async fn handle_health() -> &'static str {
    "OK"
}
