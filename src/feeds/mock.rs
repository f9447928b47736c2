//! In-process quote source for local runs and tests

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::{Error, Money, Quote, QuoteSource, Result};

/// Mock quote source with per-symbol prices
pub struct MockQuoteFeed {
    default_price: Money,
    prices: RwLock<HashMap<String, Money>>,
    latency: Duration,
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl MockQuoteFeed {
    pub fn new(default_price: Money) -> Self {
        Self {
            default_price,
            prices: RwLock::new(HashMap::new()),
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_price(&self, symbol: &str, price: Money) {
        self.prices.write().insert(symbol.to_string(), price);
    }

    /// Make every subsequent fetch fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of fetches served so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QuoteSource for MockQuoteFeed {
    async fn fetch_quote(&self, symbol: &str, user_id: &str) -> Result<Quote> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Quote(format!("mock feed down for {}", symbol)));
        }

        let price = self
            .prices
            .read()
            .get(symbol)
            .copied()
            .unwrap_or(self.default_price);

        Ok(Quote {
            symbol: symbol.to_string(),
            price,
            user_id: user_id.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
            cryptokey: "mock".to_string(),
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prices_and_call_count() {
        let feed = MockQuoteFeed::new(1250);
        feed.set_price("XYZ", 999);

        assert_eq!(feed.fetch_quote("ABC", "u1").await.unwrap().price, 1250);
        assert_eq!(feed.fetch_quote("XYZ", "u1").await.unwrap().price, 999);
        assert_eq!(feed.calls(), 2);

        feed.set_failing(true);
        assert!(feed.fetch_quote("ABC", "u1").await.is_err());
    }
}
