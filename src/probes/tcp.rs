//! TCP connection latency probe.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use super::ProbeError;

/// Connect to `endpoint` (`host:port`) and return the handshake time.
///
/// The connection is closed immediately; nothing is written to it.
pub async fn connect_latency(endpoint: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let start = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect(endpoint)).await {
        Ok(Ok(_stream)) => {
            let elapsed = start.elapsed();
            tracing::debug!(%endpoint, latency_ms = elapsed.as_millis() as u64, "TCP connect ok");
            Ok(elapsed)
        }
        Ok(Err(e)) => Err(ProbeError::Connect {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(ProbeError::ConnectTimeout {
            endpoint: endpoint.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
