//! Paper exchange for simulated trading and tests.
//!
//! Market orders fill immediately at the last known price; limit orders
//! rest on the book and are reported as `NEW` with nothing executed until
//! cancelled.

use super::traits::{MarketDataSource, OrderGateway};
use super::types::*;
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Simulated account state.
#[derive(Debug, Clone, Default)]
pub struct PaperState {
    /// Quote currency balance
    pub quote_balance: Decimal,
    /// Base asset holdings by exchange symbol
    pub holdings: HashMap<String, Decimal>,
    pub total_fees: Decimal,
    pub order_count: u64,
    /// Limit orders that have not filled
    pub open_orders: Vec<OrderResponse>,
}

/// In-memory exchange that fills orders against known prices.
pub struct PaperExchange {
    state: Arc<RwLock<PaperState>>,
    order_id_counter: AtomicU64,
    prices: Arc<RwLock<HashMap<String, Decimal>>>,
    candles: Arc<RwLock<HashMap<String, Vec<Candle>>>>,
    /// Live feed used when no local price is set
    price_feed: Option<Arc<dyn MarketDataSource>>,
    fee_rate: Decimal,
}

impl PaperExchange {
    pub fn new(initial_balance: Decimal, fee_rate: Decimal) -> Self {
        let state = PaperState {
            quote_balance: initial_balance,
            ..Default::default()
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            order_id_counter: AtomicU64::new(1),
            prices: Arc::new(RwLock::new(HashMap::new())),
            candles: Arc::new(RwLock::new(HashMap::new())),
            price_feed: None,
            fee_rate,
        }
    }

    /// Fill market orders at prices from a live source.
    pub fn with_price_feed(mut self, feed: Arc<dyn MarketDataSource>) -> Self {
        self.price_feed = Some(feed);
        self
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }

    /// Load candles served by `fetch_klines`; the last close becomes the price.
    pub async fn load_candles(&self, symbol: &str, mut candles: Vec<Candle>) {
        candles.sort_by_key(|c| c.open_time);
        if let Some(last) = candles.last() {
            if let Ok(price) = Decimal::try_from(last.close) {
                self.set_price(symbol, price).await;
            }
        }
        self.candles.write().await.insert(symbol.to_string(), candles);
    }

    /// Reset the account to a known balance and holdings, e.g. from a saved book.
    pub async fn restore_state(&self, quote_balance: Decimal, holdings: HashMap<String, Decimal>) {
        let mut state = self.state.write().await;
        state.quote_balance = quote_balance;
        state.holdings = holdings;
        state.open_orders.clear();
        info!(
            balance = %quote_balance,
            holdings = state.holdings.len(),
            "Paper account restored"
        );
    }

    pub async fn get_state(&self) -> PaperState {
        self.state.read().await.clone()
    }

    fn next_order_id(&self) -> u64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    async fn fill_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        if let Some(price) = self.prices.read().await.get(symbol).copied() {
            return Ok(price);
        }
        match &self.price_feed {
            Some(feed) => feed.ticker_price(symbol).await,
            None => Err(ExchangeError::Rejected(format!("no price for {symbol}"))),
        }
    }
}

#[async_trait]
impl OrderGateway for PaperExchange {
    async fn place_order(&self, order: &NewOrder) -> Result<OrderResponse, ExchangeError> {
        if order.quantity <= Decimal::ZERO {
            return Err(ExchangeError::Rejected("quantity must be positive".to_string()));
        }

        let order_id = self.next_order_id() as i64;
        let now_ms = Utc::now().timestamp_millis();

        if order.order_type == OrderType::Limit {
            let price = order
                .price
                .ok_or_else(|| ExchangeError::Rejected("limit order requires a price".to_string()))?;

            let response = OrderResponse {
                symbol: order.symbol.clone(),
                order_id,
                client_order_id: order.new_client_order_id.clone().unwrap_or_default(),
                transact_time: now_ms,
                price,
                orig_qty: order.quantity,
                executed_qty: Decimal::ZERO,
                cummulative_quote_qty: Decimal::ZERO,
                status: OrderStatus::New,
                order_type: OrderType::Limit,
                side: order.side,
            };

            let mut state = self.state.write().await;
            state.order_count += 1;
            state.open_orders.push(response.clone());
            debug!(order_id, symbol = %order.symbol, price = %price, "Paper limit order resting");
            return Ok(response);
        }

        let price = self.fill_price(&order.symbol).await?;
        let quantity = order.quantity;
        let notional = quantity * price;
        let fee = notional * self.fee_rate;

        let mut state = self.state.write().await;
        match order.side {
            OrderSide::Buy => {
                if notional + fee > state.quote_balance {
                    return Err(ExchangeError::Rejected(format!(
                        "insufficient balance: need {}, have {}",
                        notional + fee,
                        state.quote_balance
                    )));
                }
                state.quote_balance -= notional + fee;
                *state.holdings.entry(order.symbol.clone()).or_default() += quantity;
            }
            OrderSide::Sell => {
                let held = state.holdings.get(&order.symbol).copied().unwrap_or_default();
                if quantity > held {
                    return Err(ExchangeError::Rejected(format!(
                        "insufficient {} holdings: need {}, have {}",
                        order.symbol, quantity, held
                    )));
                }
                state.holdings.insert(order.symbol.clone(), held - quantity);
                state.quote_balance += notional - fee;
            }
        }
        state.total_fees += fee;
        state.order_count += 1;

        info!(
            order_id,
            symbol = %order.symbol,
            side = ?order.side,
            quantity = %quantity,
            price = %price,
            fee = %fee,
            "Paper market order filled"
        );

        Ok(OrderResponse {
            symbol: order.symbol.clone(),
            order_id,
            client_order_id: order.new_client_order_id.clone().unwrap_or_default(),
            transact_time: now_ms,
            price: Decimal::ZERO,
            orig_qty: quantity,
            executed_qty: quantity,
            cummulative_quote_qty: notional,
            status: OrderStatus::Filled,
            order_type: OrderType::Market,
            side: order.side,
        })
    }

    async fn query_order(&self, symbol: &str, order_id: i64) -> Result<OrderResponse, ExchangeError> {
        let state = self.state.read().await;
        state
            .open_orders
            .iter()
            .find(|o| o.symbol == symbol && o.order_id == order_id)
            .cloned()
            .ok_or_else(|| unknown_order(order_id))
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<OrderResponse, ExchangeError> {
        let mut state = self.state.write().await;
        let index = state
            .open_orders
            .iter()
            .position(|o| o.symbol == symbol && o.order_id == order_id)
            .ok_or_else(|| unknown_order(order_id))?;

        let mut cancelled = state.open_orders.remove(index);
        cancelled.status = OrderStatus::Canceled;
        debug!(order_id, symbol, "Paper limit order cancelled");
        Ok(cancelled)
    }
}

fn unknown_order(order_id: i64) -> ExchangeError {
    ExchangeError::Api {
        status: 400,
        code: -2013,
        msg: format!("Order {order_id} does not exist."),
    }
}

#[async_trait]
impl MarketDataSource for PaperExchange {
    async fn fetch_klines(
        &self,
        symbol: &str,
        _interval: &str,
        start_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let candles = self.candles.read().await;
        let series = candles.get(symbol).map(Vec::as_slice).unwrap_or_default();
        let start = start_ms.unwrap_or(i64::MIN);

        Ok(series
            .iter()
            .filter(|c| c.open_time_ms() >= start)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn ticker_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.fill_price(symbol).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn candles(n: usize) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let close = 100.0 + i as f64;
                Candle::new(
                    start + Duration::minutes(15 * i as i64),
                    close,
                    close + 1.0,
                    close - 1.0,
                    close,
                    1000.0,
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_market_buy_then_sell() {
        let exchange = PaperExchange::new(dec!(1000), dec!(0.001));
        exchange.set_price("SOLUSDT", dec!(100)).await;

        let buy = exchange
            .place_order(&NewOrder::market("SOLUSDT", OrderSide::Buy, dec!(2)))
            .await
            .unwrap();
        assert_eq!(buy.status, OrderStatus::Filled);
        assert_eq!(buy.avg_fill_price(), Some(dec!(100)));

        let state = exchange.get_state().await;
        assert_eq!(state.quote_balance, dec!(799.8));
        assert_eq!(state.holdings["SOLUSDT"], dec!(2));

        exchange.set_price("SOLUSDT", dec!(110)).await;
        exchange
            .place_order(&NewOrder::market("SOLUSDT", OrderSide::Sell, dec!(2)))
            .await
            .unwrap();

        let state = exchange.get_state().await;
        assert_eq!(state.quote_balance, dec!(1019.58));
        assert_eq!(state.total_fees, dec!(0.42));
        assert_eq!(state.order_count, 2);
    }

    #[tokio::test]
    async fn test_limit_order_rests() {
        let exchange = PaperExchange::new(dec!(1000), dec!(0.001));
        let response = exchange
            .place_order(&NewOrder::limit("SOLUSDT", OrderSide::Buy, dec!(1), dec!(99.97)))
            .await
            .unwrap();

        assert_eq!(response.status, OrderStatus::New);
        assert_eq!(response.executed_qty, Decimal::ZERO);
        assert_eq!(exchange.get_state().await.open_orders.len(), 1);

        let queried = exchange.query_order("SOLUSDT", response.order_id).await.unwrap();
        assert_eq!(queried.status, OrderStatus::New);

        let cancelled = exchange.cancel_order("SOLUSDT", response.order_id).await.unwrap();
        assert_eq!(cancelled.status, OrderStatus::Canceled);
        assert!(exchange.get_state().await.open_orders.is_empty());
        assert!(exchange.cancel_order("SOLUSDT", response.order_id).await.is_err());
    }

    #[tokio::test]
    async fn test_restore_state_allows_selling_restored_holdings() {
        let exchange = PaperExchange::new(dec!(1000), dec!(0.001));
        exchange.set_price("SOLUSDT", dec!(100)).await;
        let sell = NewOrder::market("SOLUSDT", OrderSide::Sell, dec!(0.5));
        assert!(exchange.place_order(&sell).await.is_err());

        exchange
            .restore_state(dec!(900), HashMap::from([("SOLUSDT".to_string(), dec!(0.5))]))
            .await;
        exchange.place_order(&sell).await.unwrap();

        let state = exchange.get_state().await;
        assert_eq!(state.holdings["SOLUSDT"], Decimal::ZERO);
        // 900 + 50 - 0.05
        assert_eq!(state.quote_balance, dec!(949.95));
    }

    #[tokio::test]
    async fn test_rejects_without_price_or_funds() {
        let exchange = PaperExchange::new(dec!(10), dec!(0.001));
        let order = NewOrder::market("SOLUSDT", OrderSide::Buy, dec!(1));
        assert!(matches!(
            exchange.place_order(&order).await,
            Err(ExchangeError::Rejected(_))
        ));

        exchange.set_price("SOLUSDT", dec!(100)).await;
        assert!(matches!(
            exchange.place_order(&order).await,
            Err(ExchangeError::Rejected(_))
        ));

        let sell = NewOrder::market("SOLUSDT", OrderSide::Sell, dec!(1));
        assert!(exchange.place_order(&sell).await.is_err());
    }

    #[tokio::test]
    async fn test_serves_loaded_candles() {
        let exchange = PaperExchange::new(dec!(1000), dec!(0.001));
        let series = candles(10);
        let start = series[4].open_time_ms();
        exchange.load_candles("SOLUSDT", series).await;

        let page = exchange
            .fetch_klines("SOLUSDT", "15m", Some(start), 3)
            .await
            .unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].close, 104.0);
        assert_eq!(exchange.ticker_price("SOLUSDT").await.unwrap(), dec!(109));

        assert!(exchange
            .fetch_klines("ETHUSDT", "15m", None, 500)
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_order_ids_increment() {
        let exchange = PaperExchange::new(dec!(1000), dec!(0.001));
        assert_eq!(exchange.next_order_id(), 1);
        assert_eq!(exchange.next_order_id(), 2);
    }
}
