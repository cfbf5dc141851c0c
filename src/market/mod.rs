//! Market data access: paginated candles, cached prices, BTC dominance.

use crate::config::MarketConfig;
use crate::exchange::{to_exchange_symbol, Candle, DominanceSource, ExchangeError, MarketDataSource};
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Consecutive rate-limit responses tolerated for a single page.
const MAX_RATE_LIMIT_RETRIES: u32 = 5;

/// Fetches and caches market data from a candle source and a dominance source.
pub struct MarketDataHandler<M, D> {
    source: Arc<M>,
    dominance: Arc<D>,
    config: MarketConfig,
    price_cache: Mutex<HashMap<String, (Decimal, Instant)>>,
}

impl<M, D> MarketDataHandler<M, D>
where
    M: MarketDataSource,
    D: DominanceSource,
{
    pub fn new(source: Arc<M>, dominance: Arc<D>, config: MarketConfig) -> Self {
        Self {
            source,
            dominance,
            config,
            price_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Candles for the last `days_back` days, oldest first.
    pub async fn fetch_candles(&self, pair: &str, timeframe: &str, days_back: u32) -> Vec<Candle> {
        let end = Utc::now();
        let start = end - ChronoDuration::days(days_back as i64);
        info!(pair, timeframe, days_back, "Fetching candles");
        self.fetch_candles_between(pair, timeframe, start.timestamp_millis(), end.timestamp_millis())
            .await
    }

    /// Page forward from `start_ms` until `end_ms`, an empty page, or an error.
    ///
    /// Duplicate open times are dropped and the result is sorted ascending.
    pub async fn fetch_candles_between(
        &self,
        pair: &str,
        timeframe: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Vec<Candle> {
        let symbol = to_exchange_symbol(pair);
        let delay = Duration::from_millis(self.config.request_delay_ms);
        let mut by_time: BTreeMap<i64, Candle> = BTreeMap::new();
        let mut current = start_ms;
        let mut rate_limit_hits = 0;

        while current < end_ms {
            tokio::time::sleep(delay).await;

            match self
                .source
                .fetch_klines(&symbol, timeframe, Some(current), self.config.batch_limit)
                .await
            {
                Ok(batch) => {
                    rate_limit_hits = 0;
                    let Some(last) = batch.last() else {
                        warn!(pair, timestamp = current, "No data returned");
                        break;
                    };
                    let next = last.open_time_ms() + 1;
                    debug!(pair, count = batch.len(), "Fetched candle batch");
                    for candle in batch {
                        by_time.entry(candle.open_time_ms()).or_insert(candle);
                    }
                    if next <= current {
                        break;
                    }
                    current = next;
                }
                Err(ExchangeError::RateLimited { retry_after }) => {
                    rate_limit_hits += 1;
                    if rate_limit_hits > MAX_RATE_LIMIT_RETRIES {
                        error!(pair, "Rate limited repeatedly, giving up on pagination");
                        break;
                    }
                    let wait = retry_after.unwrap_or(self.config.rate_limit_backoff_secs);
                    warn!(pair, wait_secs = wait, "Rate limit hit, waiting");
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }
                Err(e) => {
                    error!(pair, error = %e, "Error fetching candle batch");
                    break;
                }
            }
        }

        if by_time.is_empty() {
            error!(pair, "No candle data collected");
        } else {
            info!(pair, count = by_time.len(), "Fetched candles");
        }

        by_time.into_values().collect()
    }

    /// Last price, served from a short-lived cache.
    ///
    /// A network failure falls back to the stale cached price.
    pub async fn current_price(&self, pair: &str) -> Option<Decimal> {
        let symbol = to_exchange_symbol(pair);
        let ttl = Duration::from_millis(self.config.price_cache_ttl_ms);

        if let Some((price, at)) = self.price_cache.lock().await.get(&symbol) {
            if at.elapsed() < ttl {
                return Some(*price);
            }
        }

        match self.source.ticker_price(&symbol).await {
            Ok(price) => {
                self.price_cache
                    .lock()
                    .await
                    .insert(symbol, (price, Instant::now()));
                Some(price)
            }
            Err(ExchangeError::Network(e)) => {
                error!(pair, error = %e, "Network error fetching price");
                let cached = self.price_cache.lock().await.get(&symbol).map(|(p, _)| *p);
                if cached.is_some() {
                    info!(pair, "Using cached price due to network error");
                }
                cached
            }
            Err(e) => {
                error!(pair, error = %e, "Exchange error fetching price");
                None
            }
        }
    }

    /// BTC market cap dominance in percent, `None` when unavailable.
    pub async fn btc_dominance(&self) -> Option<Decimal> {
        match self.dominance.btc_dominance().await {
            Ok(value) => Some(value),
            Err(e) => {
                error!(error = %e, "Failed to fetch BTC dominance");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MockDominanceSource, MockMarketDataSource};
    use chrono::TimeZone;
    use mockall::Sequence;
    use rust_decimal_macros::dec;

    fn fast_config() -> MarketConfig {
        MarketConfig {
            request_delay_ms: 0,
            rate_limit_backoff_secs: 0,
            batch_limit: 3,
            ..MarketConfig::default()
        }
    }

    fn candle_at(ms: i64, close: f64) -> Candle {
        let t = Utc.timestamp_millis_opt(ms).unwrap();
        Candle::new(t, close, close, close, close, 10.0)
    }

    fn handler(source: MockMarketDataSource) -> MarketDataHandler<MockMarketDataSource, MockDominanceSource> {
        MarketDataHandler::new(Arc::new(source), Arc::new(MockDominanceSource::new()), fast_config())
    }

    #[tokio::test]
    async fn test_pagination_dedups_and_sorts() {
        let mut source = MockMarketDataSource::new();
        let mut seq = Sequence::new();
        source
            .expect_fetch_klines()
            .withf(|s, _, start, limit| s == "SOLUSDT" && *start == Some(0) && *limit == 3)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(vec![candle_at(0, 1.0), candle_at(2000, 3.0), candle_at(1000, 2.0)]));
        source
            .expect_fetch_klines()
            .withf(|_, _, start, _| *start == Some(1001))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(vec![candle_at(2000, 3.0), candle_at(3000, 4.0)]));
        source
            .expect_fetch_klines()
            .withf(|_, _, start, _| *start == Some(3001))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(vec![]));

        let candles = handler(source)
            .fetch_candles_between("SOL/USDT", "15m", 0, 10_000)
            .await;

        let times: Vec<i64> = candles.iter().map(Candle::open_time_ms).collect();
        assert_eq!(times, vec![0, 1000, 2000, 3000]);
    }

    #[tokio::test]
    async fn test_rate_limit_retries_same_page() {
        let mut source = MockMarketDataSource::new();
        let mut seq = Sequence::new();
        source
            .expect_fetch_klines()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Err(ExchangeError::RateLimited { retry_after: Some(0) }));
        source
            .expect_fetch_klines()
            .withf(|_, _, start, _| *start == Some(0))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(vec![candle_at(0, 1.0)]));
        source
            .expect_fetch_klines()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Err(ExchangeError::Network("reset".to_string())));

        let candles = handler(source)
            .fetch_candles_between("SOL/USDT", "15m", 0, 10_000)
            .await;
        assert_eq!(candles.len(), 1);
    }

    #[tokio::test]
    async fn test_no_data_is_empty_not_error() {
        let mut source = MockMarketDataSource::new();
        source
            .expect_fetch_klines()
            .returning(|_, _, _, _| Err(ExchangeError::Api {
                status: 400,
                code: -1121,
                msg: "Invalid symbol.".to_string(),
            }));

        let candles = handler(source)
            .fetch_candles_between("NOPE/USDT", "15m", 0, 10_000)
            .await;
        assert!(candles.is_empty());
    }

    #[tokio::test]
    async fn test_price_is_cached() {
        let mut source = MockMarketDataSource::new();
        source
            .expect_ticker_price()
            .times(1)
            .returning(|_| Ok(dec!(150.5)));

        let mut config = fast_config();
        config.price_cache_ttl_ms = 60_000;
        let handler = MarketDataHandler::new(
            Arc::new(source),
            Arc::new(MockDominanceSource::new()),
            config,
        );

        assert_eq!(handler.current_price("SOL/USDT").await, Some(dec!(150.5)));
        assert_eq!(handler.current_price("SOL/USDT").await, Some(dec!(150.5)));
    }

    #[tokio::test]
    async fn test_network_error_uses_stale_price() {
        let mut source = MockMarketDataSource::new();
        let mut seq = Sequence::new();
        source
            .expect_ticker_price()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(dec!(150)));
        source
            .expect_ticker_price()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(ExchangeError::Network("timeout".to_string())));
        source
            .expect_ticker_price()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(ExchangeError::Parse("bad".to_string())));

        let mut config = fast_config();
        config.price_cache_ttl_ms = 0;
        let handler = MarketDataHandler::new(
            Arc::new(source),
            Arc::new(MockDominanceSource::new()),
            config,
        );

        assert_eq!(handler.current_price("SOL/USDT").await, Some(dec!(150)));
        assert_eq!(handler.current_price("SOL/USDT").await, Some(dec!(150)));
        assert_eq!(handler.current_price("SOL/USDT").await, None);
    }

    #[tokio::test]
    async fn test_dominance_failure_is_none() {
        let mut dominance = MockDominanceSource::new();
        dominance
            .expect_btc_dominance()
            .returning(|| Err(ExchangeError::Network("down".to_string())));

        let handler = MarketDataHandler::new(
            Arc::new(MockMarketDataSource::new()),
            Arc::new(dominance),
            fast_config(),
        );
        assert_eq!(handler.btc_dominance().await, None);
    }
}
