//! Quote cache - TTL cache with single-flight refresh per symbol

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{KeyedLocks, TtlCache};
use crate::core::{AuditSink, Quote, QuoteSource, Result};

pub struct QuoteCache {
    source: Arc<dyn QuoteSource>,
    audit: Arc<dyn AuditSink>,
    quotes: TtlCache<String, Quote>,
    inflight: KeyedLocks<String>,
}

impl QuoteCache {
    pub fn new(source: Arc<dyn QuoteSource>, audit: Arc<dyn AuditSink>, ttl: Duration) -> Self {
        Self {
            source,
            audit,
            quotes: TtlCache::new(ttl),
            inflight: KeyedLocks::new(),
        }
    }

    /// Cached quote for `symbol`, fetched from the source at most once per TTL.
    ///
    /// Concurrent misses on the same symbol wait on one fetch; other symbols are
    /// never held up. Failed fetches are not cached.
    pub async fn get_quote(&self, symbol: &str, user_id: &str, transaction_num: i64) -> Result<Quote> {
        if let Some(quote) = self.quotes.get(symbol) {
            return Ok(quote);
        }

        let _guard = self.inflight.lock(symbol.to_string()).await;
        if let Some(quote) = self.quotes.get(symbol) {
            tracing::trace!("quote for {} filled while waiting", symbol);
            return Ok(quote);
        }

        let quote = self.source.fetch_quote(symbol, user_id).await.map_err(|e| {
            tracing::warn!("{} quote fetch for {} failed: {}", self.source.name(), symbol, e);
            e
        })?;
        tracing::debug!("💹 {} = {} ({})", symbol, quote.price, self.source.name());

        self.quotes.insert(symbol.to_string(), quote.clone());
        self.audit.quote_server(&quote, transaction_num);
        Ok(quote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::core::config::AuditConfig;
    use crate::feeds::MockQuoteFeed;
    use crate::ledger::MemoryLedger;

    fn cache_with(feed: Arc<MockQuoteFeed>) -> QuoteCache {
        let ledger = Arc::new(MemoryLedger::new());
        let audit = Arc::new(AuditLog::spawn(ledger, "test", &AuditConfig::default()));
        QuoteCache::new(feed, audit, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_concurrent_misses_fetch_once() {
        let feed = Arc::new(MockQuoteFeed::new(1250).with_latency(Duration::from_millis(50)));
        let cache = Arc::new(cache_with(Arc::clone(&feed)));

        let mut handles = Vec::new();
        for i in 0..16 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.get_quote("ABC", &format!("u{}", i), i).await.unwrap().price
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 1250);
        }
        assert_eq!(feed.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_quote_is_refetched() {
        let feed = Arc::new(MockQuoteFeed::new(1250));
        let cache = cache_with(Arc::clone(&feed));

        cache.get_quote("ABC", "u1", 1).await.unwrap();
        feed.set_price("ABC", 1300);
        assert_eq!(cache.get_quote("ABC", "u1", 2).await.unwrap().price, 1250);
        assert_eq!(feed.calls(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get_quote("ABC", "u1", 3).await.unwrap().price, 1300);
        assert_eq!(feed.calls(), 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let feed = Arc::new(MockQuoteFeed::new(1250));
        let cache = cache_with(Arc::clone(&feed));

        feed.set_failing(true);
        assert!(cache.get_quote("ABC", "u1", 1).await.is_err());
        feed.set_failing(false);
        assert!(cache.get_quote("ABC", "u1", 2).await.is_ok());
        assert_eq!(feed.calls(), 2);
    }

    #[tokio::test]
    async fn test_symbols_are_cached_separately() {
        let feed = Arc::new(MockQuoteFeed::new(1250));
        feed.set_price("XYZ", 400);
        let cache = cache_with(Arc::clone(&feed));

        assert_eq!(cache.get_quote("ABC", "u1", 1).await.unwrap().price, 1250);
        assert_eq!(cache.get_quote("XYZ", "u1", 2).await.unwrap().price, 400);
        assert_eq!(feed.calls(), 2);
    }
}
