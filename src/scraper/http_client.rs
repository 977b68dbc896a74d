use crate::config::ScraperConfig;
use anyhow::{Context, Result};
use rand::RngExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

pub struct HttpClient {
    inner: reqwest::Client,
    config: ScraperConfig,
    ua_cursor: AtomicUsize,
}

impl HttpClient {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            // Several storefronts bounce cookieless sessions to an age gate.
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            inner,
            config: config.clone(),
            ua_cursor: AtomicUsize::new(0),
        })
    }

    /// Fetch a URL as text. Each call starts with the polite delay; throttle
    /// responses (429/503) and transport errors are retried up to the
    /// configured attempt cap with a growing backoff, any other failure
    /// status ends the attempt immediately.
    pub async fn get_text(&self, url: &str) -> Result<String> {
        self.polite_delay().await;

        let mut last_error = anyhow::anyhow!("no attempts made");

        for attempt in 1..=(self.config.max_retries + 1) {
            debug!("GET {} (attempt {})", url, attempt);

            let request = self.inner.get(url).header("User-Agent", self.next_user_agent());
            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!("Request failed on attempt {}: {}", attempt, e);
                    last_error = anyhow::anyhow!("request error: {e}");
                    sleep(Duration::from_millis(
                        self.config.request_delay_ms * u64::from(attempt),
                    ))
                    .await;
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return response.text().await.context("Failed to read response body");
            }

            last_error = anyhow::anyhow!("HTTP {}", status);
            if status.as_u16() == 429 || status.as_u16() == 503 {
                // The site is throttling us: widen the gap each round.
                let backoff =
                    Duration::from_millis(self.config.request_delay_ms * 2u64.pow(attempt));
                warn!(
                    "Throttled ({}) on attempt {}, backing off {:?}",
                    status, attempt, backoff
                );
                sleep(backoff).await;
            } else {
                // Anything else (404, 500, …) will not improve on retry.
                break;
            }
        }

        Err(last_error).with_context(|| format!("Giving up on {}", url))
    }

    /// Round-robin over the configured user agents.
    fn next_user_agent(&self) -> &str {
        if self.config.user_agents.is_empty() {
            return "Mozilla/5.0";
        }
        let i = self.ua_cursor.fetch_add(1, Ordering::Relaxed);
        &self.config.user_agents[i % self.config.user_agents.len()]
    }

    /// Sleep for the configured delay + random jitter. Jitter only spaces
    /// requests out; nothing downstream of the fetch uses randomness.
    async fn polite_delay(&self) {
        let jitter = rand::rng().random_range(0..=self.config.jitter_ms);
        let total = Duration::from_millis(self.config.request_delay_ms + jitter);
        sleep(total).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_rotation_wraps() {
        let mut config = ScraperConfig::default();
        config.user_agents = vec!["ua-a".to_string(), "ua-b".to_string()];
        let client = HttpClient::new(&config).unwrap();
        assert_eq!(client.next_user_agent(), "ua-a");
        assert_eq!(client.next_user_agent(), "ua-b");
        assert_eq!(client.next_user_agent(), "ua-a");
    }

    #[test]
    fn test_empty_user_agent_list_has_fallback() {
        let mut config = ScraperConfig::default();
        config.user_agents.clear();
        let client = HttpClient::new(&config).unwrap();
        assert_eq!(client.next_user_agent(), "Mozilla/5.0");
    }
}
