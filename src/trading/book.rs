//! Portfolio state: balance, open positions and closed trades.
//!
//! The book decides what to do with a signal (open, close or hold) and
//! applies fills. Deciding and applying are separate so live trading can
//! place an order in between and only touch the book once it fills.

use crate::config::RiskConfig;
use crate::risk::{DrawdownTracker, ExitReason, Position, PositionError, RiskManager, StopLevels};
use crate::strategy::Signal;
use crate::utils::{normalize_decimal, safe_div};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// A closed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub pair: String,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    /// Quote amount committed at entry
    pub usdt_size: Decimal,
    pub quantity: Decimal,
    pub pnl: Decimal,
    pub fees: Decimal,
    pub exit_reason: ExitReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// What the book wants done for a pair.
#[derive(Debug, Clone, PartialEq)]
pub enum TradeAction {
    Open { size: Decimal, levels: StopLevels },
    Close { reason: ExitReason },
    Hold,
}

/// Aggregate trade statistics.
#[derive(Debug, Clone, Default)]
pub struct BookSummary {
    pub initial_balance: Decimal,
    pub balance: Decimal,
    pub open_positions: usize,
    pub trades: usize,
    pub wins: usize,
    /// Percent of trades with positive PnL
    pub win_rate: Decimal,
    pub total_pnl: Decimal,
    pub total_fees: Decimal,
    pub avg_pnl: Decimal,
    pub max_drawdown: Decimal,
    pub exit_reasons: BTreeMap<ExitReason, usize>,
}

/// Trades closed on one calendar day.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DailyStats {
    pub trades: usize,
    pub pnl: Decimal,
    pub win_rate: Decimal,
}

pub struct TradeBook {
    initial_balance: Decimal,
    balance: Decimal,
    positions: BTreeMap<String, Position>,
    history: Vec<TradeRecord>,
    risk: RiskManager,
    drawdown: DrawdownTracker,
}

impl TradeBook {
    pub fn new(initial_balance: Decimal, risk_config: RiskConfig, started_at: DateTime<Utc>) -> Self {
        let initial_balance = normalize_decimal(initial_balance);
        let drawdown = DrawdownTracker::new(risk_config.max_drawdown_alert, initial_balance, started_at);
        Self {
            initial_balance,
            balance: initial_balance,
            positions: BTreeMap::new(),
            history: Vec::new(),
            risk: RiskManager::new(risk_config),
            drawdown,
        }
    }

    /// Rebuild from persisted state.
    pub fn restore(
        &mut self,
        initial_balance: Decimal,
        balance: Decimal,
        positions: Vec<Position>,
        history: Vec<TradeRecord>,
    ) {
        self.initial_balance = normalize_decimal(initial_balance);
        self.balance = normalize_decimal(balance);
        self.positions = positions.into_iter().map(|p| (p.pair.clone(), p)).collect();
        self.history = history;
        info!(
            balance = %self.balance,
            positions = self.positions.len(),
            trades = self.history.len(),
            "Trade book restored"
        );
    }

    /// Resume drawdown tracking from a saved peak. A peak below the current
    /// cost-basis equity is ignored.
    pub fn restore_drawdown(&mut self, peak_equity: Decimal, max_drawdown: Decimal, at: DateTime<Utc>) {
        let peak = peak_equity.max(self.balance + self.exposure());
        self.drawdown.restore(peak, max_drawdown, at);
    }

    pub fn initial_balance(&self) -> Decimal {
        self.initial_balance
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn positions(&self) -> &BTreeMap<String, Position> {
        &self.positions
    }

    pub fn position(&self, pair: &str) -> Option<&Position> {
        self.positions.get(pair)
    }

    pub fn in_position(&self, pair: &str) -> bool {
        self.positions.contains_key(pair)
    }

    pub fn history(&self) -> &[TradeRecord] {
        &self.history
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub fn risk_mut(&mut self) -> &mut RiskManager {
        &mut self.risk
    }

    pub fn drawdown(&self) -> &DrawdownTracker {
        &self.drawdown
    }

    /// Quote amount tied up in open positions, at cost.
    pub fn exposure(&self) -> Decimal {
        self.positions.values().map(|p| p.entry_cost).sum()
    }

    /// Balance plus the net liquidation value of open positions.
    ///
    /// Pairs missing from `prices` are valued at their entry price.
    pub fn equity(&self, prices: &HashMap<String, Decimal>) -> Decimal {
        let open_value: Decimal = self
            .positions
            .values()
            .map(|p| {
                let price = prices.get(&p.pair).copied().unwrap_or(p.entry_price);
                p.current_value(price).net_value
            })
            .sum();
        normalize_decimal(self.balance + open_value)
    }

    pub fn record_equity(&mut self, equity: Decimal, at: DateTime<Utc>) {
        self.drawdown.update(equity, at);
    }

    /// Decide the action for `pair` at `price`.
    ///
    /// An open position has its trailing stop raised first, then stops and
    /// targets are checked before the signal. `atr` is in price units.
    pub fn decide(
        &mut self,
        pair: &str,
        signal: Signal,
        price: Decimal,
        atr: Decimal,
        now: DateTime<Utc>,
    ) -> TradeAction {
        self.risk.roll_day(now.date_naive());

        if let Some(position) = self.positions.get_mut(pair) {
            if let Some(new_stop) = self.risk.trailing_stop(position, price) {
                info!(pair, stop = %new_stop, "Updated trailing stop");
                position.current_stop = Some(new_stop);
            }

            if let Some(reason) = self.risk.evaluate_exit(position, price) {
                return TradeAction::Close { reason };
            }
            if signal == Signal::Sell {
                return TradeAction::Close {
                    reason: ExitReason::Signal,
                };
            }
            return TradeAction::Hold;
        }

        if signal != Signal::Buy {
            return TradeAction::Hold;
        }

        if !self.risk.can_trade(self.balance, now.date_naive()) {
            info!(pair, daily_pnl = %self.risk.daily_pnl(), "Daily limits reached, no new trades");
            return TradeAction::Hold;
        }

        let max_open = self.risk.config().max_open_positions;
        if self.positions.len() >= max_open {
            info!(pair, max_open, "Maximum open positions reached");
            return TradeAction::Hold;
        }

        let volatility = safe_div(atr, price);
        let mut size = self.risk.position_size(self.balance, volatility);

        let headroom = self
            .risk
            .allocation_headroom(self.balance + self.exposure(), self.exposure());
        let cap = headroom.min(self.balance);
        if size > cap {
            debug!(pair, size = %size, cap = %cap, "Position size capped");
            size = cap;
        }

        let min_trade = self.risk.config().min_trade_amount;
        if size < min_trade {
            info!(
                pair,
                size = %size,
                min = %min_trade,
                balance = %self.balance,
                "Trade rejected: size below minimum"
            );
            return TradeAction::Hold;
        }

        let levels = self.risk.stop_levels(price, atr);
        debug!(
            pair,
            price = %price,
            atr = %levels.atr,
            size = %size,
            balance = %self.balance,
            "Trade evaluation: executing buy"
        );
        TradeAction::Open { size, levels }
    }

    /// Open a position filled at `price` for `size` quote.
    pub fn open(
        &mut self,
        pair: &str,
        price: Decimal,
        size: Decimal,
        levels: &StopLevels,
        now: DateTime<Utc>,
    ) -> Result<&Position, PositionError> {
        let fee_rate = self.risk.config().fee_rate;
        let mut position = Position::open(pair, price, size, fee_rate, now)?;
        levels.apply_to(&mut position);

        self.balance = normalize_decimal(self.balance - position.entry_cost);

        info!(
            pair,
            size = %position.usdt_size,
            entry = %position.entry_price,
            quantity = %position.quantity,
            stop = ?position.current_stop,
            target = ?position.take_profit,
            "Opened position"
        );

        Ok(self.positions.entry(pair.to_string()).or_insert(position))
    }

    /// Close the position in `pair` at `price`.
    pub fn close(
        &mut self,
        pair: &str,
        price: Decimal,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Option<TradeRecord> {
        let position = self.positions.remove(pair)?;
        let result = position.close(price);

        self.balance = normalize_decimal(self.balance + result.net_value);
        self.risk.record_trade(result.realized_pnl);

        let record = TradeRecord {
            pair: pair.to_string(),
            entry_price: position.entry_price,
            exit_price: normalize_decimal(price),
            usdt_size: position.usdt_size,
            quantity: position.quantity,
            pnl: result.realized_pnl,
            fees: result.total_fees,
            exit_reason: reason,
            opened_at: position.opened_at,
            closed_at: now,
        };

        info!(
            pair,
            exit = %record.exit_price,
            pnl = %record.pnl,
            reason = %reason,
            "Closed position"
        );

        self.track_drawdown(now);
        self.history.push(record.clone());
        Some(record)
    }

    /// Close `ratio` of the position in `pair` at `price`, keeping the rest open.
    ///
    /// A ratio of one closes the whole position.
    pub fn close_partial(
        &mut self,
        pair: &str,
        price: Decimal,
        ratio: Decimal,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<Option<TradeRecord>, PositionError> {
        if ratio == Decimal::ONE {
            return Ok(self.close(pair, price, reason, now));
        }
        let Some(position) = self.positions.get_mut(pair) else {
            return Ok(None);
        };

        let before = position.quantity;
        let closed_size = normalize_decimal(position.usdt_size * ratio);
        let result = position.close_partial(price, ratio)?;
        position.usdt_size = normalize_decimal(position.usdt_size - closed_size);

        let record = TradeRecord {
            pair: pair.to_string(),
            entry_price: position.entry_price,
            exit_price: normalize_decimal(price),
            usdt_size: closed_size,
            quantity: normalize_decimal(before - result.remaining_quantity),
            pnl: result.realized_pnl,
            fees: result.total_fees,
            exit_reason: reason,
            opened_at: position.opened_at,
            closed_at: now,
        };

        self.balance = normalize_decimal(self.balance + result.net_value);
        self.risk.record_trade(result.realized_pnl);

        info!(
            pair,
            exit = %record.exit_price,
            quantity = %record.quantity,
            remaining = %result.remaining_quantity,
            pnl = %record.pnl,
            reason = %reason,
            "Partially closed position"
        );

        self.track_drawdown(now);
        self.history.push(record.clone());
        Ok(Some(record))
    }

    fn track_drawdown(&mut self, now: DateTime<Utc>) {
        let equity = self.balance + self.exposure();
        if self.drawdown.update(equity, now) {
            warn!(drawdown = %self.drawdown.current_drawdown().round_dp(4), "Drawdown above alert level");
        }
    }

    /// Statistics for trades closed on `date`.
    pub fn daily_stats(&self, date: NaiveDate) -> DailyStats {
        let trades: Vec<&TradeRecord> = self
            .history
            .iter()
            .filter(|t| t.closed_at.date_naive() == date)
            .collect();
        let wins = trades.iter().filter(|t| t.pnl > Decimal::ZERO).count();

        DailyStats {
            trades: trades.len(),
            pnl: trades.iter().map(|t| t.pnl).sum(),
            win_rate: win_rate(wins, trades.len()),
        }
    }

    pub fn summary(&self) -> BookSummary {
        let trades = self.history.len();
        let wins = self.history.iter().filter(|t| t.pnl > Decimal::ZERO).count();
        let total_pnl: Decimal = self.history.iter().map(|t| t.pnl).sum();
        let total_fees: Decimal = self.history.iter().map(|t| t.fees).sum();

        let mut exit_reasons = BTreeMap::new();
        for trade in &self.history {
            *exit_reasons.entry(trade.exit_reason).or_insert(0) += 1;
        }

        BookSummary {
            initial_balance: self.initial_balance,
            balance: self.balance,
            open_positions: self.positions.len(),
            trades,
            wins,
            win_rate: win_rate(wins, trades),
            total_pnl,
            total_fees,
            avg_pnl: if trades > 0 {
                normalize_decimal(total_pnl / Decimal::from(trades))
            } else {
                Decimal::ZERO
            },
            max_drawdown: self.drawdown.max_drawdown(),
            exit_reasons,
        }
    }
}

fn win_rate(wins: usize, total: usize) -> Decimal {
    if total == 0 {
        return Decimal::ZERO;
    }
    (Decimal::from(wins) * Decimal::ONE_HUNDRED / Decimal::from(total)).round_dp(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn book(balance: Decimal) -> TradeBook {
        TradeBook::new(balance, RiskConfig::default(), t0())
    }

    fn open_sol(book: &mut TradeBook, price: Decimal, atr: Decimal) -> Decimal {
        match book.decide("SOL/USDT", Signal::Buy, price, atr, t0()) {
            TradeAction::Open { size, levels } => {
                book.open("SOL/USDT", price, size, &levels, t0()).unwrap();
                size
            }
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[test]
    fn test_buy_opens_and_debits_balance() {
        let mut book = book(dec!(1000));
        let size = open_sol(&mut book, dec!(100), Decimal::ZERO);

        assert_eq!(size, dec!(100));
        assert_eq!(book.balance(), dec!(900));
        assert!(book.in_position("SOL/USDT"));
        assert_eq!(book.exposure(), dec!(100));
        assert_eq!(book.balance().scale(), 8);
    }

    #[test]
    fn test_hold_and_sell_without_position() {
        let mut book = book(dec!(1000));
        assert_eq!(book.decide("SOL/USDT", Signal::Hold, dec!(100), dec!(1), t0()), TradeAction::Hold);
        assert_eq!(book.decide("SOL/USDT", Signal::Sell, dec!(100), dec!(1), t0()), TradeAction::Hold);
    }

    #[test]
    fn test_sell_signal_closes() {
        let mut book = book(dec!(1000));
        open_sol(&mut book, dec!(100), Decimal::ZERO);

        let action = book.decide("SOL/USDT", Signal::Sell, dec!(100.005), Decimal::ZERO, t0());
        assert_eq!(action, TradeAction::Close { reason: ExitReason::Signal });

        let record = book
            .close("SOL/USDT", dec!(100.005), ExitReason::Signal, t0() + Duration::hours(1))
            .unwrap();
        // 0.999 * 100.005 = 99.904995, fee 0.099904995 -> 0.09990500
        assert_eq!(record.pnl, dec!(-0.19491));
        assert_eq!(record.fees, dec!(0.199905));
        assert_eq!(book.balance(), dec!(999.80509));
        assert!(!book.in_position("SOL/USDT"));
    }

    #[test]
    fn test_stop_loss_checked_on_hold() {
        let mut book = book(dec!(1000));
        open_sol(&mut book, dec!(100), dec!(2));

        let action = book.decide("SOL/USDT", Signal::Hold, dec!(96.5), dec!(2), t0());
        assert_eq!(action, TradeAction::Close { reason: ExitReason::StopLoss });
    }

    #[test]
    fn test_trailing_stop_raised_then_hit() {
        let mut book = book(dec!(1000));
        open_sol(&mut book, dec!(100), dec!(2));

        // Past the 104 activation: stop becomes 105 - 4
        assert_eq!(book.decide("SOL/USDT", Signal::Hold, dec!(105), dec!(2), t0()), TradeAction::Hold);
        assert_eq!(book.position("SOL/USDT").unwrap().current_stop, Some(dec!(101)));

        let action = book.decide("SOL/USDT", Signal::Hold, dec!(100.5), dec!(2), t0());
        assert_eq!(action, TradeAction::Close { reason: ExitReason::TrailingStop });
    }

    #[test]
    fn test_take_profit() {
        let mut book = book(dec!(1000));
        open_sol(&mut book, dec!(100), dec!(2));
        // Trailing moves the stop to 102 but the target at 106 wins
        let action = book.decide("SOL/USDT", Signal::Hold, dec!(106), dec!(2), t0());
        assert_eq!(action, TradeAction::Close { reason: ExitReason::TakeProfit });
    }

    #[test]
    fn test_small_balance_rejected() {
        let mut book = book(dec!(5));
        assert_eq!(book.decide("SOL/USDT", Signal::Buy, dec!(100), dec!(1), t0()), TradeAction::Hold);
    }

    #[test]
    fn test_min_trade_capped_by_allocation() {
        // 10% of 100 is the 10 USDT minimum; 50% allocation allows 50
        let mut book = book(dec!(100));
        for pair in ["SOL/USDT", "ETH/USDT", "ADA/USDT", "DOT/USDT", "XRP/USDT"] {
            match book.decide(pair, Signal::Buy, dec!(10), Decimal::ZERO, t0()) {
                TradeAction::Open { size, levels } => {
                    book.open(pair, dec!(10), size, &levels, t0()).unwrap();
                }
                other => panic!("expected open for {pair}, got {other:?}"),
            }
        }
        assert_eq!(book.exposure(), dec!(50));
        assert_eq!(book.decide("LINK/USDT", Signal::Buy, dec!(10), Decimal::ZERO, t0()), TradeAction::Hold);
    }

    #[test]
    fn test_daily_loss_blocks_entries_until_next_day() {
        let mut book = book(dec!(100));
        open_sol(&mut book, dec!(100), dec!(2));
        book.close("SOL/USDT", dec!(70), ExitReason::StopLoss, t0());
        assert!(book.risk().daily_pnl() < dec!(-2));

        assert_eq!(book.decide("SOL/USDT", Signal::Buy, dec!(100), dec!(2), t0()), TradeAction::Hold);
        let tomorrow = t0() + Duration::days(1);
        assert!(matches!(
            book.decide("SOL/USDT", Signal::Buy, dec!(100), dec!(2), tomorrow),
            TradeAction::Open { .. }
        ));
    }

    #[test]
    fn test_summary() {
        let mut book = book(dec!(1000));
        open_sol(&mut book, dec!(100), dec!(2));
        book.close("SOL/USDT", dec!(110), ExitReason::TakeProfit, t0());
        open_sol(&mut book, dec!(100), dec!(2));
        book.close("SOL/USDT", dec!(95), ExitReason::StopLoss, t0());

        let summary = book.summary();
        assert_eq!(summary.trades, 2);
        assert_eq!(summary.wins, 1);
        assert_eq!(summary.win_rate, dec!(50));
        assert_eq!(summary.exit_reasons[&ExitReason::TakeProfit], 1);
        assert_eq!(summary.total_pnl, book.balance() - dec!(1000));

        let today = book.daily_stats(t0().date_naive());
        assert_eq!(today.trades, 2);
        assert_eq!(today.pnl, summary.total_pnl);
    }

    #[test]
    fn test_partial_close_keeps_remainder_open() {
        let mut book = book(dec!(1000));
        open_sol(&mut book, dec!(100), Decimal::ZERO);

        let record = book
            .close_partial("SOL/USDT", dec!(100), dec!(0.5), ExitReason::Signal, t0())
            .unwrap()
            .unwrap();
        assert_eq!(record.quantity, dec!(0.4995));
        assert_eq!(record.usdt_size, dec!(50));

        let position = book.position("SOL/USDT").unwrap();
        assert_eq!(position.quantity, dec!(0.4995));
        assert_eq!(position.usdt_size, dec!(50));
        assert_eq!(position.entry_cost, dec!(50));
        // 0.4995 * 100 = 49.95, fee 0.04995
        assert_eq!(book.balance(), dec!(949.90005));
        assert_eq!(book.history().len(), 1);

        let last = book
            .close_partial("SOL/USDT", dec!(100), Decimal::ONE, ExitReason::Signal, t0())
            .unwrap();
        assert!(last.is_some());
        assert!(!book.in_position("SOL/USDT"));
        assert!(book.close_partial("SOL/USDT", dec!(100), dec!(0.5), ExitReason::Signal, t0()).unwrap().is_none());
    }

    #[test]
    fn test_restore_keeps_initial_balance_and_peak() {
        let mut book = book(dec!(1000));
        let position = Position::open("SOL/USDT", dec!(100), dec!(100), dec!(0.001), t0()).unwrap();
        book.restore(dec!(500), dec!(400), vec![position], Vec::new());
        book.restore_drawdown(dec!(800), dec!(0.1), t0());

        assert_eq!(book.initial_balance(), dec!(500));
        assert_eq!(book.summary().initial_balance, dec!(500));
        assert_eq!(book.drawdown().peak_equity(), dec!(800));
        assert_eq!(book.summary().max_drawdown, dec!(0.1));

        // A stale peak below current equity is lifted
        book.restore_drawdown(dec!(300), dec!(0), t0());
        assert_eq!(book.drawdown().peak_equity(), dec!(500));
    }

    #[test]
    fn test_equity_marks_to_market() {
        let mut book = book(dec!(1000));
        open_sol(&mut book, dec!(100), Decimal::ZERO);

        let prices = HashMap::from([("SOL/USDT".to_string(), dec!(110))]);
        // 0.999 * 110 = 109.89, fee 0.10989
        assert_eq!(book.equity(&prices), dec!(1009.78011));
        assert_eq!(book.equity(&HashMap::new()), dec!(999.8001));
    }
}
