//! CoinGecko global market data.

use crate::exchange::traits::DominanceSource;
use crate::exchange::types::{ExchangeError, GlobalMarketResponse};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use tracing::instrument;

/// Read-only client for CoinGecko's `/global` endpoint.
pub struct CoinGeckoClient {
    http: Client,
    base_url: String,
}

impl CoinGeckoClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Bitcoin's share of total crypto market cap, in percent.
    #[instrument(skip(self))]
    pub async fn get_btc_dominance(&self) -> Result<Decimal, ExchangeError> {
        let url = format!("{}/global", self.base_url);
        let response = self.http.get(&url).send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ExchangeError::RateLimited { retry_after: None });
        }
        if !status.is_success() {
            return Err(ExchangeError::Api {
                status: status.as_u16(),
                code: -1,
                msg: response.text().await.unwrap_or_default(),
            });
        }

        let body: GlobalMarketResponse = response
            .json()
            .await
            .map_err(|e| ExchangeError::Parse(e.to_string()))?;

        let btc = body
            .data
            .market_cap_percentage
            .get("btc")
            .copied()
            .ok_or_else(|| ExchangeError::Parse("market_cap_percentage.btc missing".to_string()))?;

        Decimal::try_from(btc).map_err(|e| ExchangeError::Parse(e.to_string()))
    }
}

#[async_trait]
impl DominanceSource for CoinGeckoClient {
    async fn btc_dominance(&self) -> Result<Decimal, ExchangeError> {
        self.get_btc_dominance().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_btc_dominance() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/global"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "active_cryptocurrencies": 10000,
                    "market_cap_percentage": {"btc": 52.5, "eth": 17.25}
                }
            })))
            .mount(&server)
            .await;

        let client = CoinGeckoClient::new(&server.uri()).unwrap();
        assert_eq!(client.get_btc_dominance().await.unwrap(), dec!(52.5));
    }

    #[tokio::test]
    async fn test_missing_btc_share_is_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/global"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"market_cap_percentage": {"eth": 17.0}}
            })))
            .mount(&server)
            .await;

        let client = CoinGeckoClient::new(&server.uri()).unwrap();
        assert!(matches!(
            client.get_btc_dominance().await,
            Err(ExchangeError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/global"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = CoinGeckoClient::new(&server.uri()).unwrap();
        assert!(matches!(
            client.get_btc_dominance().await,
            Err(ExchangeError::Api { status: 503, .. })
        ));
    }
}
