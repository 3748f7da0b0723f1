use anyhow::{anyhow, Result};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::constants::{ORACLE_BURST, ORACLE_HTTP_TIMEOUT_SECONDS, ORACLE_REQUESTS_PER_MINUTE};
use crate::error_classifier::retry_backoff;

/// HTTP price oracle, rate limited by a token bucket.
///
/// One fetch serves every position holding the token; the monitor dedups
/// mints before calling here. 429s back off exponentially and never bubble a
/// retryable failure past MAX_RETRIES.
pub struct PriceOracle {
    limiter: Arc<
        RateLimiter<
            governor::state::NotKeyed,
            governor::state::InMemoryState,
            governor::clock::DefaultClock,
        >,
    >,
    client: Client,
    base_url: String,
    stats: Arc<Mutex<OracleStats>>,
}

#[derive(Debug, Clone, Default)]
pub struct OracleStats {
    pub requests: u64,
    pub rate_limit_hits: u64,
    pub failures: u64,
}

const MAX_RETRIES: u32 = 4;

impl PriceOracle {
    pub fn new(base_url: String, requests_per_minute: u32, burst: u32) -> Self {
        let rpm = NonZeroU32::new(requests_per_minute).unwrap_or(nonzero!(60u32));
        let burst = NonZeroU32::new(burst).unwrap_or(nonzero!(10u32));
        let quota = Quota::per_minute(rpm).allow_burst(burst);

        let client = Client::builder()
            .timeout(Duration::from_secs(ORACLE_HTTP_TIMEOUT_SECONDS))
            .gzip(true)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            client,
            base_url,
            stats: Arc::new(Mutex::new(OracleStats::default())),
        }
    }

    /// Current price in SOL per whole token, or None when the oracle has no
    /// quote for the mint.
    pub async fn get_price(&self, token_mint: &str) -> Result<Option<f64>> {
        self.limiter.until_ready().await;
        self.stats.lock().requests += 1;

        let url = format!("{}?ids={}", self.base_url, token_mint);
        let mut attempt = 0u32;

        loop {
            match self.fetch(&url, token_mint).await {
                Ok(price) => return Ok(price),
                Err(e) => {
                    attempt += 1;
                    let msg = e.to_string();
                    let rate_limited = msg.contains("429") || msg.contains("rate limit");
                    if rate_limited {
                        self.stats.lock().rate_limit_hits += 1;
                    }

                    if attempt >= MAX_RETRIES {
                        self.stats.lock().failures += 1;
                        return Err(e);
                    }

                    let delay = retry_backoff(attempt, if rate_limited { 1_000 } else { 200 }, 8_000);
                    warn!(
                        "⚠️  Price fetch failed for {} (attempt {}/{}), retrying in {}ms: {}",
                        token_mint,
                        attempt,
                        MAX_RETRIES,
                        delay.as_millis(),
                        msg
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    async fn fetch(&self, url: &str, token_mint: &str) -> Result<Option<f64>> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Price API error {}: {}", status, body));
        }

        let body: Value = response.json().await?;
        let price = body
            .get("data")
            .and_then(|data| data.get(token_mint))
            .and_then(|entry| entry.get("price"))
            .and_then(parse_price);

        debug!("🔎 Oracle {} -> {:?}", token_mint, price);
        Ok(price)
    }

    pub fn stats(&self) -> OracleStats {
        self.stats.lock().clone()
    }
}

/// The price field arrives as either a JSON number or a decimal string.
fn parse_price(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_string_and_numeric_prices() {
        assert_eq!(parse_price(&json!("0.0000012")), Some(0.0000012));
        assert_eq!(parse_price(&json!(0.5)), Some(0.5));
        assert_eq!(parse_price(&json!(null)), None);
        assert_eq!(parse_price(&json!({"nested": 1})), None);
    }
}
