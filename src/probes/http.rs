use super::{ProbeFailure, ProbeReading, Prober};
use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Client;
use std::error::Error as _;
use std::time::{Duration, Instant};

/// HTTP probe checking status code and response latency.
pub struct HttpProber {
    client: Client,
}

impl HttpProber {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("smartuptime/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

fn normalize_url(target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else {
        format!("http://{}", target)
    }
}

/// Map a transport error to one of the failure shapes.
fn classify_error(err: &reqwest::Error) -> ProbeFailure {
    if err.is_timeout() {
        return ProbeFailure::Timeout;
    }
    // The innermost source carries the useful detail (refused, dns, tls).
    let mut detail = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        detail = inner.to_string();
        source = inner.source();
    }
    if err.is_connect() {
        ProbeFailure::Unreachable(detail)
    } else {
        ProbeFailure::Other(detail)
    }
}

#[async_trait::async_trait]
impl Prober for HttpProber {
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeReading {
        let url = normalize_url(url);
        let checked_at = Utc::now();

        let start = Instant::now();
        let result = self.client.get(&url).timeout(timeout).send().await;
        let latency = start.elapsed();

        match result {
            Ok(resp) => {
                let status = resp.status().as_u16();
                tracing::debug!(%url, status, latency_ms = latency.as_millis() as u64, "Probe responded");
                ProbeReading::responded(checked_at, status, latency)
            }
            Err(e) => {
                let failure = classify_error(&e);
                tracing::debug!(%url, %failure, "Probe failed");
                ProbeReading::failed(checked_at, failure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};

    async fn spawn_server(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("example.com"), "http://example.com");
        assert_eq!(normalize_url("https://example.com"), "https://example.com");
    }

    #[tokio::test]
    async fn test_success_records_status_and_latency() {
        let base = spawn_server(Router::new().route("/", get(|| async { "ok" }))).await;
        let prober = HttpProber::new().unwrap();

        let reading = prober.probe(&base, Duration::from_secs(5)).await;
        assert_eq!(reading.status_code, 200);
        assert!(reading.latency_ms.is_some());
        assert!(reading.failure.is_none());
    }

    #[tokio::test]
    async fn test_non_2xx_is_not_a_failure() {
        let app = Router::new().route("/", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let base = spawn_server(app).await;
        let prober = HttpProber::new().unwrap();

        let reading = prober.probe(&base, Duration::from_secs(5)).await;
        assert_eq!(reading.status_code, 503);
        assert!(reading.latency_ms.is_some());
        assert!(reading.failure.is_none());
    }

    #[tokio::test]
    async fn test_timeout_maps_to_timeout_failure() {
        let app = Router::new().route(
            "/",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let base = spawn_server(app).await;
        let prober = HttpProber::new().unwrap();

        let reading = prober.probe(&base, Duration::from_millis(100)).await;
        assert_eq!(reading.status_code, 0);
        assert_eq!(reading.latency_ms, None);
        assert_eq!(reading.failure, Some(ProbeFailure::Timeout));
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        // Bind and drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let prober = HttpProber::new().unwrap();
        let reading = prober
            .probe(&format!("http://{addr}"), Duration::from_secs(2))
            .await;
        assert_eq!(reading.status_code, 0);
        assert!(matches!(reading.failure, Some(ProbeFailure::Unreachable(_))));
    }
}
