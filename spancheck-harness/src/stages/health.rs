//! Health stage: is the ingestion service answering at all?

use crate::report::{Stage, StageReport};
use reqwest::Client;
use std::time::{Duration, Instant};
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;

async fn probe_once(client: &Client, url: &str) -> Result<u16, String> {
    let response = client.get(url).send().await.map_err(|e| e.to_string())?;
    let status = response.status();
    if status.is_success() {
        Ok(status.as_u16())
    } else {
        tracing::debug!(status = status.as_u16(), url, "Health probe returned non-success");
        Err(format!("endpoint returned status {}", status.as_u16()))
    }
}

/// `GET url`, retried on a fixed interval, `attempts` tries in total.
pub async fn check_endpoint(url: &str, attempts: usize, retry_delay: Duration) -> StageReport {
    tracing::info!(url, "Testing API endpoint health");
    let started = Instant::now();

    let client = match Client::builder().timeout(Duration::from_secs(10)).build() {
        Ok(c) => c,
        Err(e) => return StageReport::failed(Stage::Health, e.to_string()),
    };

    let strategy = FixedInterval::new(retry_delay).take(attempts.saturating_sub(1));
    match Retry::spawn(strategy, || probe_once(&client, url)).await {
        Ok(status) => {
            tracing::info!(status, "API endpoint is accessible");
            StageReport::passed(Stage::Health, format!("status {status}"))
                .with_elapsed(started.elapsed())
        }
        Err(e) => {
            tracing::error!(attempts, error = %e, "API endpoint health check failed");
            StageReport::failed(Stage::Health, e).with_elapsed(started.elapsed())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::StageStatus;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_healthy_endpoint_passes() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let url = format!("{}/api/health", mock_server.uri());
        let report = check_endpoint(&url, 3, Duration::from_millis(10)).await;

        assert!(report.is_pass(), "{}", report.detail);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let url = format!("{}/api/health", mock_server.uri());
        let report = check_endpoint(&url, 3, Duration::from_millis(10)).await;

        assert!(report.is_pass());
    }

    #[tokio::test]
    async fn test_gives_up_after_all_attempts() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&mock_server)
            .await;

        let url = format!("{}/api/health", mock_server.uri());
        let report = check_endpoint(&url, 2, Duration::from_millis(10)).await;

        assert_eq!(report.status, StageStatus::Failed);
        assert_eq!(report.detail, "endpoint returned status 500");
    }
}
