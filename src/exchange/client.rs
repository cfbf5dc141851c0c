//! Binance spot REST API client.

use crate::config::BinanceConfig;
use crate::exchange::traits::{MarketDataSource, OrderGateway};
use crate::exchange::types::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

const SPOT_BASE_URL: &str = "https://api.binance.com";
const SPOT_TESTNET_URL: &str = "https://testnet.binance.vision";
const RECV_WINDOW_MS: u64 = 5000;

/// Binance API client for the spot market.
pub struct BinanceClient {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
    /// LOT_SIZE step per symbol, fetched once
    lot_steps: RwLock<HashMap<String, Decimal>>,
}

impl BinanceClient {
    /// Create a new Binance client from configuration.
    pub fn new(config: &BinanceConfig) -> Result<Self> {
        let base_url = if config.testnet {
            SPOT_TESTNET_URL
        } else {
            SPOT_BASE_URL
        };
        Self::with_base_url(config, base_url)
    }

    /// Create a client against an explicit base URL.
    pub fn with_base_url(config: &BinanceConfig, base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            lot_steps: RwLock::new(HashMap::new()),
        })
    }

    /// Whether signed endpoints can be used.
    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.secret_key.is_empty()
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Get current timestamp in milliseconds.
    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }

    /// Map an HTTP response onto a typed result.
    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ExchangeError> {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::IM_A_TEAPOT {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(ExchangeError::RateLimited { retry_after });
        }

        let body = response.text().await?;

        if !status.is_success() {
            let (code, msg) = match serde_json::from_str::<ApiErrorBody>(&body) {
                Ok(err) => (err.code, err.msg),
                Err(_) => (-1, body),
            };
            return Err(ExchangeError::Api {
                status: status.as_u16(),
                code,
                msg,
            });
        }

        serde_json::from_str(&body).map_err(|e| ExchangeError::Parse(e.to_string()))
    }

    // ==================== Market Data (Public) ====================

    /// Get klines starting at `start_ms` (inclusive).
    #[instrument(skip(self))]
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let mut url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        if let Some(start) = start_ms {
            url.push_str(&format!("&startTime={}", start));
        }

        let response = self.http.get(&url).send().await?;
        let rows: Vec<Vec<Value>> = Self::decode(response).await?;

        rows.iter().map(|row| Candle::from_kline_row(row)).collect()
    }

    /// Get the latest traded price for a symbol.
    #[instrument(skip(self))]
    pub async fn get_ticker_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol);
        let response = self.http.get(&url).send().await?;
        let ticker: TickerPrice = Self::decode(response).await?;
        Ok(ticker.price)
    }

    /// Quantity step for `symbol`, cached after the first lookup.
    #[instrument(skip(self))]
    pub async fn lot_step(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError> {
        if let Some(step) = self.lot_steps.read().await.get(symbol) {
            return Ok(Some(*step));
        }

        let url = format!("{}/api/v3/exchangeInfo?symbol={}", self.base_url, symbol);
        let response = self.http.get(&url).send().await?;
        let info: ExchangeInfo = Self::decode(response).await?;

        let step = info
            .symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .and_then(SymbolInfo::lot_step);
        if let Some(step) = step {
            info!(symbol, step = %step, "Loaded lot size");
            self.lot_steps.write().await.insert(symbol.to_string(), step);
        }
        Ok(step)
    }

    // ==================== Orders (Authenticated) ====================

    /// Send a signed request to `/api/v3/order`.
    async fn signed_order_request<T: DeserializeOwned>(
        &self,
        method: Method,
        mut params: Vec<(String, String)>,
    ) -> Result<T, ExchangeError> {
        if !self.has_credentials() {
            return Err(ExchangeError::Rejected(
                "API credentials are required for order endpoints".to_string(),
            ));
        }

        params.push(("recvWindow".to_string(), RECV_WINDOW_MS.to_string()));
        params.push(("timestamp".to_string(), Self::timestamp().to_string()));

        let query_string: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let signature = self.sign(&query_string);
        let url = format!(
            "{}/api/v3/order?{}&signature={}",
            self.base_url, query_string, signature
        );

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;

        Self::decode(response).await
    }

    /// Place a new spot order, quantity rounded down to the symbol's lot step.
    #[instrument(skip(self))]
    pub async fn place_spot_order(&self, order: &NewOrder) -> Result<OrderResponse, ExchangeError> {
        if !self.has_credentials() {
            return Err(ExchangeError::Rejected(
                "API credentials are required to place orders".to_string(),
            ));
        }
        if order.order_type == OrderType::Limit && order.price.is_none() {
            return Err(ExchangeError::Rejected("limit order requires a price".to_string()));
        }

        let mut order = order.clone();
        if let Some(step) = self.lot_step(&order.symbol).await? {
            order.quantity = floor_to_step(order.quantity, step);
        }
        if order.quantity <= Decimal::ZERO {
            return Err(ExchangeError::Rejected(format!(
                "quantity below the {} lot size",
                order.symbol
            )));
        }

        debug!("Placing spot order: {:?}", order);

        let mut params = order.to_params();
        params.push(("newOrderRespType".to_string(), "RESULT".to_string()));
        self.signed_order_request(Method::POST, params).await
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, symbol: &str, order_id: i64) -> Result<OrderResponse, ExchangeError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), order_id.to_string()),
        ];
        self.signed_order_request(Method::GET, params).await
    }

    #[instrument(skip(self))]
    pub async fn cancel_spot_order(&self, symbol: &str, order_id: i64) -> Result<OrderResponse, ExchangeError> {
        let params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("orderId".to_string(), order_id.to_string()),
        ];
        self.signed_order_request(Method::DELETE, params).await
    }
}

#[async_trait]
impl MarketDataSource for BinanceClient {
    async fn fetch_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        self.get_klines(symbol, interval, start_ms, limit).await
    }

    async fn ticker_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.get_ticker_price(symbol).await
    }
}

#[async_trait]
impl OrderGateway for BinanceClient {
    async fn place_order(&self, order: &NewOrder) -> Result<OrderResponse, ExchangeError> {
        self.place_spot_order(order).await
    }

    async fn query_order(&self, symbol: &str, order_id: i64) -> Result<OrderResponse, ExchangeError> {
        self.get_order(symbol, order_id).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<OrderResponse, ExchangeError> {
        self.cancel_spot_order(symbol, order_id).await
    }
}
