//! HTTP download speed probe.

use std::time::Duration;

use futures::TryStreamExt;
use reqwest::Client;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tokio_util::io::StreamReader;

use super::{ProbeConfig, ProbeError};
use crate::config::ProbeSettings;

/// Bounded-size download against the configured test URLs.
///
/// One pooled client is shared by every worker in a batch.
pub struct SpeedProbe {
    client: Client,
}

impl SpeedProbe {
    pub fn new(settings: &ProbeSettings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(settings.idle_timeout_secs))
            .pool_max_idle_per_host(settings.max_idle_per_host)
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    /// Try each test URL in order; the first success wins.
    ///
    /// All mirrors share one `speed_timeout` budget for the node.
    pub async fn measure(&self, config: &ProbeConfig) -> Result<f64, ProbeError> {
        let deadline = Instant::now() + config.speed_timeout;
        let mut last_err = None;
        for url in &config.test_urls {
            if Instant::now() >= deadline {
                tracing::debug!(%url, "speed budget spent, skipping remaining mirrors");
                break;
            }
            match self.download(url, config, deadline).await {
                Ok(speed) => return Ok(speed),
                Err(e) => {
                    tracing::debug!(%url, error = %e, "test URL failed, trying next mirror");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ProbeError::Download("no test URLs configured".to_string())))
    }

    /// Download until `max_download_bytes`, EOF, or `deadline`.
    ///
    /// Hitting the deadline after some bytes arrived still yields a speed
    /// over what was received.
    async fn download(
        &self,
        url: &str,
        config: &ProbeConfig,
        deadline: Instant,
    ) -> Result<f64, ProbeError> {
        let start = Instant::now();

        let response = tokio::time::timeout_at(deadline, self.client.get(url).send())
            .await
            .map_err(|_| ProbeError::Download(format!("{}: request timed out", url)))?
            .map_err(|e| ProbeError::Download(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(ProbeError::Download(format!(
                "{}: HTTP {}",
                url,
                response.status().as_u16()
            )));
        }

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        let mut reader = StreamReader::new(stream);
        let mut buf = vec![0u8; config.buffer_size];
        let mut received: u64 = 0;

        while received < config.max_download_bytes {
            match tokio::time::timeout_at(deadline, reader.read(&mut buf)).await {
                Err(_) => break,
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => received += n as u64,
                Ok(Err(e)) => {
                    return Err(ProbeError::Download(format!("{}: read failed: {}", url, e)));
                }
            }
        }

        if received == 0 {
            return Err(ProbeError::Download(format!("{}: no data received", url)));
        }

        Ok(mb_per_sec(received, start.elapsed().as_secs_f64()))
    }
}

/// Bytes over seconds, in MB/s (2^20 bytes).
pub fn mb_per_sec(bytes: u64, secs: f64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0 / secs.max(f64::EPSILON)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    /// Serve `body_len` bytes with `status` to every connection.
    async fn serve_blob(status: &'static str, body_len: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut req = [0u8; 1024];
                    let _ = sock.read(&mut req).await;
                    let head = format!(
                        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        status, body_len
                    );
                    let _ = sock.write_all(head.as_bytes()).await;
                    let _ = sock.write_all(&vec![0xAB; body_len]).await;
                    let _ = sock.shutdown().await;
                });
            }
        });
        format!("http://{}/blob", addr)
    }

    fn config(urls: Vec<String>) -> ProbeConfig {
        ProbeConfig {
            max_latency_ms: 400,
            test_urls: urls,
            latency_timeout: Duration::from_secs(1),
            speed_timeout: Duration::from_secs(5),
            concurrency: 1,
            buffer_size: 4096,
            max_download_bytes: 64 * 1024,
        }
    }

    #[test]
    fn test_mb_per_sec() {
        assert_eq!(mb_per_sec(1024 * 1024, 1.0), 1.0);
        assert_eq!(mb_per_sec(10 * 1024 * 1024, 2.0), 5.0);
    }

    #[tokio::test]
    async fn test_measure_local_blob() {
        let url = serve_blob("200 OK", 128 * 1024).await;
        let probe = SpeedProbe::new(&ProbeSettings::default()).unwrap();

        let speed = probe.measure(&config(vec![url])).await.unwrap();
        assert!(speed > 0.0);
    }

    #[tokio::test]
    async fn test_falls_back_to_mirror() {
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            format!("http://{}/blob", listener.local_addr().unwrap())
        };
        let good = serve_blob("200 OK", 16 * 1024).await;
        let probe = SpeedProbe::new(&ProbeSettings::default()).unwrap();

        let speed = probe.measure(&config(vec![dead, good])).await.unwrap();
        assert!(speed > 0.0);
    }

    /// Accepts connections and never answers them.
    async fn silent_mirror() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });
        format!("http://{}/blob", addr)
    }

    #[tokio::test]
    async fn test_mirrors_share_one_deadline() {
        let urls = vec![silent_mirror().await, silent_mirror().await, silent_mirror().await];
        let probe = SpeedProbe::new(&ProbeSettings::default()).unwrap();
        let cfg = ProbeConfig {
            speed_timeout: Duration::from_millis(600),
            ..config(urls)
        };

        let start = std::time::Instant::now();
        let err = probe.measure(&cfg).await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, ProbeError::Download(_)));
        assert!(elapsed < Duration::from_millis(1100), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_http_error_status_is_download_error() {
        let url = serve_blob("404 Not Found", 0).await;
        let probe = SpeedProbe::new(&ProbeSettings::default()).unwrap();

        let err = probe.measure(&config(vec![url])).await.unwrap_err();
        assert!(matches!(err, ProbeError::Download(_)));
        assert!(err.to_string().contains("404"));
    }
}
