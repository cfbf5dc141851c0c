//! Exchange integrations.
//!
//! ## Binance
//! Spot REST API for candles, last prices and order placement.
//!
//! ## CoinGecko
//! Global market data, used for Bitcoin dominance.
//!
//! ## Paper
//! In-memory exchange that fills market orders at the last price.

mod client;
mod coingecko;
pub mod mock;
pub mod traits;
mod types;

pub use client::BinanceClient;
pub use coingecko::CoinGeckoClient;
pub use mock::PaperExchange;
pub use traits::{DominanceSource, MarketDataSource, OrderGateway};
pub use types::*;

#[cfg(test)]
pub use traits::{MockDominanceSource, MockMarketDataSource, MockOrderGateway};
