//! Order placement.

use crate::config::{ExecutionConfig, ExecutionStyle};
use crate::exchange::{
    to_exchange_symbol, ExchangeError, NewOrder, OrderGateway, OrderResponse, OrderSide, OrderType,
};
use crate::utils::normalize_decimal;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Places orders through an [`OrderGateway`], logging every outcome.
pub struct TradeExecutor<O> {
    gateway: Arc<O>,
    config: ExecutionConfig,
}

impl<O: OrderGateway> TradeExecutor<O> {
    pub fn new(gateway: Arc<O>, config: ExecutionConfig) -> Self {
        Self { gateway, config }
    }

    /// Place a market or limit order for `pair` (`BASE/QUOTE`).
    pub async fn place_order(
        &self,
        pair: &str,
        order_type: OrderType,
        side: OrderSide,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Result<OrderResponse, ExchangeError> {
        let symbol = to_exchange_symbol(pair);
        let quantity = normalize_decimal(quantity);

        let order = match (order_type, price) {
            (OrderType::Market, _) => NewOrder::market(symbol, side, quantity),
            (OrderType::Limit, Some(price)) => NewOrder::limit(symbol, side, quantity, normalize_decimal(price)),
            (OrderType::Limit, None) => {
                let err = ExchangeError::Rejected("limit order requires a price".to_string());
                error!(pair, error = %err, "Error placing order");
                return Err(err);
            }
        };

        match self.gateway.place_order(&order).await {
            Ok(response) => {
                info!(
                    pair,
                    side = side.as_str(),
                    order_type = order_type.as_str(),
                    order_id = response.order_id,
                    status = ?response.status,
                    executed = %response.executed_qty,
                    "Placed order"
                );
                Ok(response)
            }
            Err(e) => {
                error!(pair, side = side.as_str(), error = %e, "Error placing order");
                Err(e)
            }
        }
    }

    /// Limit order offset from `reference_price`: below it to buy, above it to sell.
    pub async fn place_limit_order(
        &self,
        pair: &str,
        side: OrderSide,
        quantity: Decimal,
        reference_price: Decimal,
    ) -> Result<OrderResponse, ExchangeError> {
        let limit_price = limit_price(side, reference_price, self.config.limit_offset);
        info!(pair, side = side.as_str(), price = %limit_price, "Placing limit order");
        self.place_order(pair, OrderType::Limit, side, quantity, Some(limit_price))
            .await
    }

    /// Place an order using the configured execution style and wait for it to settle.
    ///
    /// The returned response is final: anything still open after the order
    /// timeout is cancelled, so `executed_qty` is all that will ever fill.
    pub async fn execute(
        &self,
        pair: &str,
        side: OrderSide,
        quantity: Decimal,
        reference_price: Decimal,
    ) -> Result<OrderResponse, ExchangeError> {
        let response = match self.config.style {
            ExecutionStyle::Market => {
                self.place_order(pair, OrderType::Market, side, quantity, None)
                    .await?
            }
            ExecutionStyle::Limit => {
                self.place_limit_order(pair, side, quantity, reference_price)
                    .await?
            }
        };

        if !response.status.is_open() {
            return Ok(response);
        }
        self.settle(pair, response).await
    }

    /// Poll an open order until it completes or times out, then cancel the rest.
    async fn settle(&self, pair: &str, mut order: OrderResponse) -> Result<OrderResponse, ExchangeError> {
        let deadline = Instant::now() + Duration::from_secs(self.config.order_timeout_secs);

        while order.status.is_open() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(ORDER_POLL_INTERVAL.min(deadline - now)).await;
            order = self.gateway.query_order(&order.symbol, order.order_id).await?;
            debug!(pair, order_id = order.order_id, status = ?order.status, executed = %order.executed_qty, "Polled order");
        }
        if !order.status.is_open() {
            return Ok(order);
        }

        match self.gateway.cancel_order(&order.symbol, order.order_id).await {
            Ok(cancelled) => {
                info!(
                    pair,
                    order_id = cancelled.order_id,
                    executed = %cancelled.executed_qty,
                    requested = %cancelled.orig_qty,
                    "Cancelled unfilled order remainder"
                );
                Ok(cancelled)
            }
            Err(e) => {
                // Usually means it filled in the meantime
                warn!(pair, order_id = order.order_id, error = %e, "Cancel failed, re-checking order");
                self.gateway.query_order(&order.symbol, order.order_id).await
            }
        }
    }
}

/// Offset limit price, normalized to 8 decimals.
pub fn limit_price(side: OrderSide, reference: Decimal, offset: Decimal) -> Decimal {
    let factor = match side {
        OrderSide::Buy => Decimal::ONE - offset,
        OrderSide::Sell => Decimal::ONE + offset,
    };
    normalize_decimal(reference * factor)
}
