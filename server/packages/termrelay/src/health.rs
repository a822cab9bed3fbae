use std::future::Future;
use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;

const HEALTH_CHECK_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const HEALTH_CHECK_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("backend not healthy after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    /// Attempts used, including the successful one.
    pub attempts: u32,
    pub service: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    status: String,
    service: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveStats {
    pub pings: u64,
    pub failures: u64,
}

pub fn health_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(HEALTH_CHECK_CONNECT_TIMEOUT)
        .timeout(HEALTH_CHECK_REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

pub fn health_url(base_url: &str) -> String {
    format!("{}/health", base_url.trim_end_matches('/'))
}

/// Poll `url` until it reports healthy, at most `attempts` times with a fixed
/// `backoff` between tries.
pub async fn probe_health(
    client: &reqwest::Client,
    url: &str,
    attempts: u32,
    backoff: Duration,
) -> Result<HealthReport, ProbeError> {
    let started_at = Instant::now();
    let attempts = attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match check_once(client, url).await {
            Ok(body) => {
                tracing::info!(
                    attempts = attempt,
                    elapsed_ms = started_at.elapsed().as_millis(),
                    "backend healthy"
                );
                return Ok(HealthReport {
                    attempts: attempt,
                    service: body.service,
                });
            }
            Err(reason) => {
                tracing::debug!(attempt, error = %reason, "health probe failed");
                last_error = reason;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(backoff).await;
        }
    }

    tracing::warn!(
        attempts,
        elapsed_ms = started_at.elapsed().as_millis(),
        error = %last_error,
        "backend never became healthy"
    );
    Err(ProbeError::Exhausted {
        attempts,
        last_error,
    })
}

/// Ping `url` every `interval` until `shutdown` resolves.
pub async fn keepalive<F>(
    client: &reqwest::Client,
    url: &str,
    interval: Duration,
    shutdown: F,
) -> KeepaliveStats
where
    F: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    let mut stats = KeepaliveStats::default();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                stats.pings += 1;
                match check_once(client, url).await {
                    Ok(_) => tracing::debug!(pings = stats.pings, "keepalive ok"),
                    Err(reason) => {
                        stats.failures += 1;
                        tracing::warn!(error = %reason, "keepalive ping failed");
                    }
                }
            }
        }
    }
    tracing::info!(pings = stats.pings, failures = stats.failures, "keepalive stopped");
    stats
}

async fn check_once(client: &reqwest::Client, url: &str) -> Result<HealthBody, String> {
    let response = client.get(url).send().await.map_err(|err| err.to_string())?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("status {status}"));
    }
    let body: HealthBody = response.json().await.map_err(|err| err.to_string())?;
    if body.status != "healthy" {
        return Err(format!("reported status `{}`", body.status));
    }
    Ok(body)
}
