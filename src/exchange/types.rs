//! Type definitions for Binance spot and CoinGecko responses.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failures talking to an exchange or data provider.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    /// HTTP 429/418; wait before retrying
    #[error("rate limit exceeded (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },
    /// Transport-level failure (timeout, DNS, connection reset)
    #[error("network error: {0}")]
    Network(String),
    /// The exchange answered with an error payload
    #[error("exchange error {code} (HTTP {status}): {msg}")]
    Api { status: u16, code: i64, msg: String },
    /// Response body did not match the expected shape
    #[error("unexpected response: {0}")]
    Parse(String),
    /// Request rejected locally before being sent
    #[error("order rejected: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        ExchangeError::Network(err.to_string())
    }
}

/// Binance error payload (`{"code": -1121, "msg": "Invalid symbol."}`).
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

/// Convert `SOL/USDT` into Binance's `SOLUSDT`.
pub fn to_exchange_symbol(pair: &str) -> String {
    pair.replace('/', "").to_uppercase()
}

/// One OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(open_time: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Open time in epoch milliseconds.
    pub fn open_time_ms(&self) -> i64 {
        self.open_time.timestamp_millis()
    }

    /// Parse a raw Binance kline array.
    ///
    /// `[openTime, "open", "high", "low", "close", "volume", closeTime, ...]`
    pub fn from_kline_row(row: &[Value]) -> Result<Self, ExchangeError> {
        if row.len() < 6 {
            return Err(ExchangeError::Parse(format!(
                "kline has {} fields, expected at least 6",
                row.len()
            )));
        }

        let open_ms = row[0]
            .as_i64()
            .ok_or_else(|| ExchangeError::Parse(format!("bad kline open time: {}", row[0])))?;
        let open_time = Utc
            .timestamp_millis_opt(open_ms)
            .single()
            .ok_or_else(|| ExchangeError::Parse(format!("kline open time out of range: {open_ms}")))?;

        Ok(Self {
            open_time,
            open: kline_number(&row[1])?,
            high: kline_number(&row[2])?,
            low: kline_number(&row[3])?,
            close: kline_number(&row[4])?,
            volume: kline_number(&row[5])?,
        })
    }
}

fn kline_number(value: &Value) -> Result<f64, ExchangeError> {
    match value {
        Value::String(s) => s
            .parse()
            .map_err(|_| ExchangeError::Parse(format!("bad kline number: {s}"))),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ExchangeError::Parse(format!("bad kline number: {n}"))),
        other => Err(ExchangeError::Parse(format!("bad kline number: {other}"))),
    }
}

/// Latest price for a symbol.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
}

/// `/api/v3/exchangeInfo` response, reduced to the symbol filters.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        #[serde(with = "rust_decimal::serde::str")]
        step_size: Decimal,
    },
    #[serde(other)]
    Other,
}

impl SymbolInfo {
    /// Quantity step from the LOT_SIZE filter.
    pub fn lot_step(&self) -> Option<Decimal> {
        self.filters.iter().find_map(|f| match f {
            SymbolFilter::LotSize { step_size } if *step_size > Decimal::ZERO => Some(*step_size),
            _ => None,
        })
    }
}

/// Round `quantity` down to a whole number of `step`s.
pub fn floor_to_step(quantity: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return quantity;
    }
    ((quantity / step).floor() * step).normalize()
}

/// CoinGecko `/global` response.
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalMarketResponse {
    pub data: GlobalMarketData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalMarketData {
    pub market_cap_percentage: std::collections::HashMap<String, f64>,
}

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
        }
    }
}

/// Time in force for limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc, // Good Till Cancel
    Ioc, // Immediate or Cancel
    Fok, // Fill or Kill
}

/// Order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    PendingCancel,
    Rejected,
    Expired,
    ExpiredInMatch,
}

impl OrderStatus {
    /// Still working on the book and able to fill further.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            OrderStatus::New | OrderStatus::PartiallyFilled | OrderStatus::PendingCancel
        )
    }
}

/// New spot order request.
#[derive(Debug, Clone, Serialize)]
pub struct NewOrder {
    /// Exchange symbol (`SOLUSDT`)
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Base asset quantity
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    pub new_client_order_id: Option<String>,
}

impl NewOrder {
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            time_in_force: None,
            new_client_order_id: None,
        }
    }

    pub fn limit(symbol: impl Into<String>, side: OrderSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            time_in_force: Some(TimeInForce::Gtc),
            new_client_order_id: None,
        }
    }

    /// Query parameters in Binance's expected order.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("symbol".to_string(), self.symbol.clone()),
            ("side".to_string(), self.side.as_str().to_string()),
            ("type".to_string(), self.order_type.as_str().to_string()),
            ("quantity".to_string(), self.quantity.normalize().to_string()),
        ];

        if let Some(price) = &self.price {
            params.push(("price".to_string(), price.normalize().to_string()));
        }

        if let Some(tif) = &self.time_in_force {
            params.push(("timeInForce".to_string(), format!("{:?}", tif).to_uppercase()));
        }

        if let Some(client_id) = &self.new_client_order_id {
            params.push(("newClientOrderId".to_string(), client_id.clone()));
        }

        params
    }
}

/// Spot order response (RESULT/FULL response types).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub symbol: String,
    pub order_id: i64,
    #[serde(default)]
    pub client_order_id: String,
    #[serde(default)]
    pub transact_time: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub orig_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub cummulative_quote_qty: Decimal,
    pub status: OrderStatus,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub side: OrderSide,
}

impl OrderResponse {
    /// Average fill price, if anything executed.
    pub fn avg_fill_price(&self) -> Option<Decimal> {
        if self.executed_qty > Decimal::ZERO {
            Some(self.cummulative_quote_qty / self.executed_qty)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_symbol_conversion() {
        assert_eq!(to_exchange_symbol("SOL/USDT"), "SOLUSDT");
        assert_eq!(to_exchange_symbol("eth/usdt"), "ETHUSDT");
    }

    #[test]
    fn test_lot_size_filter() {
        let info: ExchangeInfo = serde_json::from_value(json!({
            "timezone": "UTC",
            "symbols": [{
                "symbol": "SOLUSDT",
                "status": "TRADING",
                "filters": [
                    {"filterType": "PRICE_FILTER", "minPrice": "0.01", "maxPrice": "10000", "tickSize": "0.01"},
                    {"filterType": "LOT_SIZE", "minQty": "0.001", "maxQty": "9000", "stepSize": "0.001"}
                ]
            }]
        }))
        .unwrap();

        assert_eq!(info.symbols[0].lot_step(), Some(dec!(0.001)));
        assert_eq!(floor_to_step(dec!(0.12345679), dec!(0.001)), dec!(0.123));
        assert_eq!(floor_to_step(dec!(0.0009), dec!(0.001)), Decimal::ZERO);
        assert_eq!(floor_to_step(dec!(1.5), Decimal::ZERO), dec!(1.5));
    }

    #[test]
    fn test_open_statuses() {
        assert!(OrderStatus::New.is_open());
        assert!(OrderStatus::PartiallyFilled.is_open());
        assert!(!OrderStatus::Filled.is_open());
        assert!(!OrderStatus::Canceled.is_open());
    }

    #[test]
    fn test_kline_row_parsing() {
        let row = json!([
            1499040000000i64,
            "0.01634790",
            "0.80000000",
            "0.01575800",
            "0.01577100",
            "148976.11427815",
            1499644799999i64,
            "2434.19055334",
            308,
            "1756.87402397",
            "28.46694368",
            "0"
        ]);
        let candle = Candle::from_kline_row(row.as_array().unwrap()).unwrap();

        assert_eq!(candle.open_time_ms(), 1499040000000);
        assert_eq!(candle.high, 0.8);
        assert_eq!(candle.close, 0.015771);
        assert_eq!(candle.volume, 148976.11427815);
    }

    #[test]
    fn test_kline_row_rejects_short_rows() {
        let row = json!([1499040000000i64, "1.0"]);
        assert!(matches!(
            Candle::from_kline_row(row.as_array().unwrap()),
            Err(ExchangeError::Parse(_))
        ));
    }

    #[test]
    fn test_order_params() {
        let order = NewOrder::limit("SOLUSDT", OrderSide::Buy, dec!(0.50000000), dec!(149.955));
        let params = order.to_params();

        assert!(params.contains(&("type".to_string(), "LIMIT".to_string())));
        assert!(params.contains(&("quantity".to_string(), "0.5".to_string())));
        assert!(params.contains(&("price".to_string(), "149.955".to_string())));
        assert!(params.contains(&("timeInForce".to_string(), "GTC".to_string())));
    }

    #[test]
    fn test_order_response_parsing() {
        let body = json!({
            "symbol": "SOLUSDT",
            "orderId": 28,
            "clientOrderId": "6gCrw2kRUAF9CvJDGP16IP",
            "transactTime": 1507725176595i64,
            "price": "0.00000000",
            "origQty": "2.00000000",
            "executedQty": "2.00000000",
            "cummulativeQuoteQty": "300.00000000",
            "status": "FILLED",
            "timeInForce": "GTC",
            "type": "MARKET",
            "side": "BUY"
        });
        let response: OrderResponse = serde_json::from_value(body).unwrap();

        assert_eq!(response.status, OrderStatus::Filled);
        assert_eq!(response.avg_fill_price(), Some(dec!(150)));
    }
}
