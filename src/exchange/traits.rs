//! Seams between the trading logic and the outside world.
//!
//! The bot, the market data handler and the executor only ever talk to
//! these traits, so live Binance, the paper exchange and test mocks are
//! interchangeable.

use crate::exchange::types::{Candle, ExchangeError, NewOrder, OrderResponse};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Source of candles and spot prices.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Fetch up to `limit` candles of `interval` starting at `start_ms`.
    ///
    /// `symbol` is in exchange form (`SOLUSDT`).
    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Latest traded price.
    async fn ticker_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;
}

/// Anything that accepts orders.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(&self, order: &NewOrder) -> Result<OrderResponse, ExchangeError>;

    /// Current state of a previously placed order.
    async fn query_order(&self, symbol: &str, order_id: i64) -> Result<OrderResponse, ExchangeError>;

    /// Cancel whatever remains of an order. The response carries the final executed quantity.
    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<OrderResponse, ExchangeError>;
}

/// Provider of BTC market cap dominance, in percent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DominanceSource: Send + Sync {
    async fn btc_dominance(&self) -> Result<Decimal, ExchangeError>;
}
