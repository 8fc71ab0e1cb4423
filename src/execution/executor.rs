use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::ExecError;
use crate::exchange::{ExchangeGateway, GatewayRegistry, OrderKind, OrderReceipt};
use crate::ledger::{CloseTrade, PositionLedger};
use crate::models::{
    ExecutionRequest, LogLevel, NewTrade, Side, TradeAction, TradingMode, UserSettings,
};
use crate::notify::NotificationDispatcher;
use crate::vault::CredentialVault;

/// Fee estimate for live executions: 0.1% of notional
pub const FEE_RATE: f64 = 0.001;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_secs(60),
        }
    }
}

/// Structured result of one execute_order job
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub order_id: Option<String>,
    pub trade_id: Option<Uuid>,
    pub message: String,
    pub error: Option<String>,
    pub is_paper_trade: bool,
}

/// Structured result of one close_position job
#[derive(Debug, Clone, Serialize)]
pub struct CloseReport {
    pub success: bool,
    pub closed_orders: usize,
    pub message: String,
    pub error: Option<String>,
}

/// The order-execution state machine: validates an intent against the
/// ledger, executes it (paper or live), and commits the resulting trade
/// and position transition.
///
/// Transient faults (gateway, database) are retried with exponential
/// backoff and jitter; business-rule rejections are terminal and leave no
/// trade behind. No lock is held across a backoff sleep -- every attempt
/// re-reads settings and position state from scratch.
pub struct OrderExecutor {
    ledger: Arc<PositionLedger>,
    vault: CredentialVault,
    registry: Arc<GatewayRegistry>,
    notifier: NotificationDispatcher,
    config: ExecutorConfig,
}

impl OrderExecutor {
    pub fn new(
        ledger: Arc<PositionLedger>,
        registry: Arc<GatewayRegistry>,
        notifier: NotificationDispatcher,
        config: ExecutorConfig,
    ) -> Self {
        let vault = CredentialVault::new(ledger.pool().clone());
        Self {
            ledger,
            vault,
            registry,
            notifier,
            config,
        }
    }

    /// Process one execution intent to completion: success, terminal
    /// rejection, or retry exhaustion.
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionReport {
        let mut attempt = 0u32;
        loop {
            match self.try_execute(request).await {
                Ok(report) => return report,
                Err(err) if err.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = retry_delay(self.config.retry_base_delay, attempt);
                    tracing::warn!(
                        "Execution attempt {}/{} for {} {} failed: {} (retrying in {:.0}s)",
                        attempt,
                        self.config.max_retries,
                        request.side,
                        request.symbol,
                        err,
                        delay.as_secs_f64(),
                    );
                    let _ = self
                        .ledger
                        .append_log(
                            request.user_id,
                            LogLevel::Error,
                            &format!("Order attempt {attempt} failed: {err}"),
                            Some(json!({"symbol": request.symbol, "side": request.side})),
                        )
                        .await;
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_transient() => return self.fail(request, err).await,
                Err(err) => return self.reject(request, err).await,
            }
        }
    }

    /// One attempt. Preconditions re-run on every retry so settings
    /// toggles and concurrent position changes are observed.
    async fn try_execute(&self, request: &ExecutionRequest) -> Result<ExecutionReport, ExecError> {
        if !self.ledger.user_exists(request.user_id).await? {
            return Err(ExecError::UserNotFound(request.user_id));
        }

        let settings = self.ledger.settings(request.user_id).await?;

        let size = request.size.unwrap_or(settings.default_position_size);
        if size <= 0.0 || !size.is_finite() {
            return Err(ExecError::InvalidSize(size));
        }

        // Alternation rule: buy opens, sell closes, strictly alternating
        let open = self.ledger.get_open(request.user_id, &request.symbol).await?;
        match request.side {
            Side::Buy if open.is_some() => {
                return Err(ExecError::DuplicatePosition(request.symbol.clone()))
            }
            Side::Sell if open.is_none() => {
                return Err(ExecError::NoPosition(request.symbol.clone()))
            }
            _ => {}
        }

        if settings.paper_trading_enabled {
            self.execute_paper(request, &settings, size).await
        } else {
            self.execute_live(request, &settings, size).await
        }
    }

    /// Paper mode: no exchange call, the supplied price is the fill.
    async fn execute_paper(
        &self,
        request: &ExecutionRequest,
        settings: &UserSettings,
        size: f64,
    ) -> Result<ExecutionReport, ExecError> {
        let price = request.price.ok_or(ExecError::InvalidPaperPrice)?;

        let (trade_id, pnl) = match request.side {
            Side::Buy => {
                let trade = NewTrade {
                    user_id: request.user_id,
                    action: TradeAction::Buy,
                    symbol: request.symbol.clone(),
                    price,
                    size,
                    exchange: request.exchange.clone(),
                    result: format!("PAPER TRADE - Simulated: buy {size} {}", request.symbol),
                    order_id: None,
                    pnl: 0.0,
                    fees: 0.0,
                    is_paper_trade: true,
                };
                let (_, trade_id) = self
                    .ledger
                    .open_or_grow(
                        request.user_id,
                        &request.symbol,
                        &request.exchange,
                        price,
                        size,
                        false,
                        &trade,
                    )
                    .await?;
                (trade_id, 0.0)
            }
            Side::Sell => {
                let meta = CloseTrade {
                    action: TradeAction::Sell,
                    exchange: request.exchange.clone(),
                    result: format!("PAPER TRADE - Simulated: sell {size} {}", request.symbol),
                    order_id: None,
                    fees: 0.0,
                    is_paper_trade: true,
                };
                let outcome = self
                    .ledger
                    .reduce_or_close(request.user_id, &request.symbol, price, size, &meta)
                    .await?;
                (outcome.trade_id, outcome.pnl)
            }
        };

        let _ = self
            .ledger
            .append_log(
                request.user_id,
                LogLevel::Info,
                &format!(
                    "PAPER TRADE - Order simulated: {} {size} {} at {price}",
                    request.side, request.symbol
                ),
                Some(json!({"simulated_price": price, "pnl": pnl})),
            )
            .await;

        self.notifier
            .dispatch(settings, request.side.as_str(), &request.symbol, price, size, true);

        Ok(ExecutionReport {
            success: true,
            order_id: Some(format!("paper-{trade_id}")),
            trade_id: Some(trade_id),
            message: format!(
                "Successfully simulated {} order for {} (PAPER TRADE)",
                request.side, request.symbol
            ),
            error: None,
            is_paper_trade: true,
        })
    }

    /// Live mode: resolve credentials, submit to the venue, then commit
    /// the trade and position transition.
    async fn execute_live(
        &self,
        request: &ExecutionRequest,
        settings: &UserSettings,
        size: f64,
    ) -> Result<ExecutionReport, ExecError> {
        let credentials = self.vault.resolve(request.user_id, &request.exchange).await?;
        let gateway = self.registry.connect(&request.exchange, &credentials)?;

        let (receipt, reference_price) =
            self.submit_order(gateway.as_ref(), request, settings, size).await?;

        let executed_price = receipt.executed_price.unwrap_or(reference_price);
        let fees = executed_price * size * FEE_RATE;

        let trade_id = match request.side {
            Side::Buy => {
                let trade = NewTrade {
                    user_id: request.user_id,
                    action: TradeAction::Buy,
                    symbol: request.symbol.clone(),
                    price: executed_price,
                    size,
                    exchange: request.exchange.clone(),
                    result: format!("Success: {}", receipt.order_id),
                    order_id: Some(receipt.order_id.clone()),
                    pnl: 0.0,
                    fees,
                    is_paper_trade: false,
                };
                let (_, trade_id) = self
                    .ledger
                    .open_or_grow(
                        request.user_id,
                        &request.symbol,
                        &request.exchange,
                        executed_price,
                        size,
                        false,
                        &trade,
                    )
                    .await?;
                trade_id
            }
            Side::Sell => {
                let meta = CloseTrade {
                    action: TradeAction::Sell,
                    exchange: request.exchange.clone(),
                    result: format!("Success: {}", receipt.order_id),
                    order_id: Some(receipt.order_id.clone()),
                    fees,
                    is_paper_trade: false,
                };
                let outcome = self
                    .ledger
                    .reduce_or_close(request.user_id, &request.symbol, executed_price, size, &meta)
                    .await?;
                outcome.trade_id
            }
        };

        let _ = self
            .ledger
            .append_log(
                request.user_id,
                LogLevel::Info,
                &format!(
                    "Order executed: {} {size} {} at {executed_price}",
                    request.side, request.symbol
                ),
                Some(json!({"order_id": receipt.order_id})),
            )
            .await;

        self.notifier.dispatch(
            settings,
            request.side.as_str(),
            &request.symbol,
            executed_price,
            size,
            false,
        );

        Ok(ExecutionReport {
            success: true,
            order_id: Some(receipt.order_id),
            trade_id: Some(trade_id),
            message: format!(
                "Successfully executed {} order for {}",
                request.side, request.symbol
            ),
            error: None,
            is_paper_trade: false,
        })
    }

    /// Venue submission. A supplied price always selects a limit order at
    /// that price; otherwise the user's trading mode decides. Returns the
    /// receipt plus a reference price for bookkeeping when the venue does
    /// not report a fill price.
    async fn submit_order(
        &self,
        gateway: &dyn ExchangeGateway,
        request: &ExecutionRequest,
        settings: &UserSettings,
        size: f64,
    ) -> Result<(OrderReceipt, f64), ExecError> {
        if let Some(price) = request.price {
            let receipt = gateway
                .create_order(&request.symbol, OrderKind::Limit, request.side, size, Some(price))
                .await?;
            return Ok((receipt, price));
        }

        match settings.trading_mode {
            TradingMode::Market => {
                let receipt = gateway
                    .create_order(&request.symbol, OrderKind::Market, request.side, size, None)
                    .await?;
                let reference = match receipt.executed_price {
                    Some(p) => p,
                    None => gateway.ticker(&request.symbol).await?.last,
                };
                Ok((receipt, reference))
            }
            TradingMode::Limit => {
                let ticker = gateway.ticker(&request.symbol).await?;
                let limit = limit_price_with_slippage(ticker.last, request.side, settings.slippage);
                let receipt = gateway
                    .create_order(&request.symbol, OrderKind::Limit, request.side, size, Some(limit))
                    .await?;
                Ok((receipt, limit))
            }
            TradingMode::MarketLimitFallback => {
                match gateway
                    .create_order(&request.symbol, OrderKind::Market, request.side, size, None)
                    .await
                {
                    Ok(receipt) => {
                        let reference = match receipt.executed_price {
                            Some(p) => p,
                            None => gateway.ticker(&request.symbol).await?.last,
                        };
                        Ok((receipt, reference))
                    }
                    Err(market_err) => {
                        tracing::warn!(
                            "Market order for {} failed ({market_err}), falling back to limit",
                            request.symbol
                        );
                        let ticker = gateway.ticker(&request.symbol).await?;
                        let limit =
                            limit_price_with_slippage(ticker.last, request.side, settings.slippage);
                        let receipt = gateway
                            .create_order(
                                &request.symbol,
                                OrderKind::Limit,
                                request.side,
                                size,
                                Some(limit),
                            )
                            .await?;
                        Ok((receipt, limit))
                    }
                }
            }
        }
    }

    /// Terminal rejection: a warning log entry, no trade row, no retry.
    async fn reject(&self, request: &ExecutionRequest, err: ExecError) -> ExecutionReport {
        let message = match &err {
            ExecError::DuplicatePosition(symbol) => format!(
                "Buy signal rejected - already holding {symbol}. Must sell first."
            ),
            ExecError::NoPosition(symbol) => format!(
                "Sell signal rejected - no position to sell for {symbol}. Must buy first."
            ),
            other => other.to_string(),
        };

        tracing::warn!(
            "REJECTED: {} signal ignored for {} - {}",
            request.side,
            request.symbol,
            err
        );

        // A missing user has no log trail to write to
        if !matches!(err, ExecError::UserNotFound(_)) {
            let _ = self
                .ledger
                .append_log(
                    request.user_id,
                    err.log_level(),
                    &format!("REJECTED: {} signal ignored - {err}", request.side),
                    Some(json!({"symbol": request.symbol, "side": request.side})),
                )
                .await;
        }

        ExecutionReport {
            success: false,
            order_id: None,
            trade_id: None,
            message,
            error: Some(err.to_string()),
            is_paper_trade: false,
        }
    }

    /// Retry exhaustion: exactly one FAILED trade row, an error log entry.
    async fn fail(&self, request: &ExecutionRequest, err: ExecError) -> ExecutionReport {
        let trade = NewTrade {
            user_id: request.user_id,
            action: match request.side {
                Side::Buy => TradeAction::Buy,
                Side::Sell => TradeAction::Sell,
            },
            symbol: request.symbol.clone(),
            price: request.price.unwrap_or(0.0),
            size: request.size.unwrap_or(0.0),
            exchange: request.exchange.clone(),
            result: format!("FAILED: {err}"),
            order_id: None,
            pnl: 0.0,
            fees: 0.0,
            is_paper_trade: false,
        };
        let trade_id = self.ledger.record_trade(&trade).await.ok();

        let _ = self
            .ledger
            .append_log(
                request.user_id,
                LogLevel::Error,
                &format!("Failed to execute order: {err}"),
                Some(json!({
                    "symbol": request.symbol,
                    "side": request.side,
                    "retries": self.config.max_retries,
                })),
            )
            .await;

        ExecutionReport {
            success: false,
            order_id: None,
            trade_id,
            message: format!(
                "Failed to execute {} order for {} after {} retries",
                request.side, request.symbol, self.config.max_retries
            ),
            error: Some(err.to_string()),
            is_paper_trade: false,
        }
    }

    /// Offset every non-zero venue-side position matching the symbol with
    /// a market order and reconcile the local ledger.
    pub async fn close_position(
        &self,
        user_id: Uuid,
        symbol: &str,
        exchange: &str,
    ) -> CloseReport {
        let mut attempt = 0u32;
        loop {
            match self.try_close(user_id, symbol, exchange).await {
                Ok(report) => return report,
                Err(err) if err.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = retry_delay(self.config.retry_base_delay, attempt);
                    tracing::warn!(
                        "Close attempt {}/{} for {symbol} failed: {err} (retrying in {:.0}s)",
                        attempt,
                        self.config.max_retries,
                        delay.as_secs_f64(),
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_transient() => {
                    let trade = NewTrade {
                        user_id,
                        action: TradeAction::Close,
                        symbol: symbol.to_string(),
                        price: 0.0,
                        size: 0.0,
                        exchange: exchange.to_string(),
                        result: format!("FAILED: {err}"),
                        order_id: None,
                        pnl: 0.0,
                        fees: 0.0,
                        is_paper_trade: false,
                    };
                    let _ = self.ledger.record_trade(&trade).await;
                    let _ = self
                        .ledger
                        .append_log(
                            user_id,
                            LogLevel::Error,
                            &format!("Failed to close position: {err}"),
                            Some(json!({"symbol": symbol})),
                        )
                        .await;
                    return CloseReport {
                        success: false,
                        closed_orders: 0,
                        message: format!(
                            "Failed to close position for {symbol} after {} retries",
                            self.config.max_retries
                        ),
                        error: Some(err.to_string()),
                    };
                }
                Err(err) => {
                    tracing::warn!("Close rejected for {symbol}: {err}");
                    if !matches!(err, ExecError::UserNotFound(_)) {
                        let _ = self
                            .ledger
                            .append_log(
                                user_id,
                                err.log_level(),
                                &format!("Close rejected: {err}"),
                                Some(json!({"symbol": symbol})),
                            )
                            .await;
                    }
                    return CloseReport {
                        success: false,
                        closed_orders: 0,
                        message: err.to_string(),
                        error: Some(err.to_string()),
                    };
                }
            }
        }
    }

    async fn try_close(
        &self,
        user_id: Uuid,
        symbol: &str,
        exchange: &str,
    ) -> Result<CloseReport, ExecError> {
        if !self.ledger.user_exists(user_id).await? {
            return Err(ExecError::UserNotFound(user_id));
        }

        let credentials = self.vault.resolve(user_id, exchange).await?;
        let gateway = self.registry.connect(exchange, &credentials)?;

        let balances = gateway.position_balances().await?;
        let mut closed_orders = 0usize;

        for entry in balances {
            if !symbols_match(&entry.symbol, symbol) || entry.amount == 0.0 {
                continue;
            }

            // Positive exposure is offset by a sell, negative by a buy
            let side = if entry.amount > 0.0 { Side::Sell } else { Side::Buy };
            let amount = entry.amount.abs();

            let receipt = gateway
                .create_order(symbol, OrderKind::Market, side, amount, None)
                .await?;
            let price = match receipt.executed_price {
                Some(p) => p,
                None => gateway.ticker(symbol).await?.last,
            };
            let fees = price * amount * FEE_RATE;

            let meta = CloseTrade {
                action: TradeAction::Close,
                exchange: exchange.to_string(),
                result: format!("Closed: {}", receipt.order_id),
                order_id: Some(receipt.order_id.clone()),
                fees,
                is_paper_trade: false,
            };
            match self
                .ledger
                .reduce_or_close(user_id, symbol, price, amount, &meta)
                .await
            {
                Ok(_) => {}
                // Venue exposure without a local position still gets its
                // audit row
                Err(ExecError::NoPosition(_)) => {
                    let trade = NewTrade {
                        user_id,
                        action: TradeAction::Close,
                        symbol: symbol.to_string(),
                        price,
                        size: amount,
                        exchange: exchange.to_string(),
                        result: format!("Closed: {}", receipt.order_id),
                        order_id: Some(receipt.order_id),
                        pnl: 0.0,
                        fees,
                        is_paper_trade: false,
                    };
                    self.ledger.record_trade(&trade).await?;
                }
                Err(e) => return Err(e),
            }

            closed_orders += 1;
        }

        let _ = self
            .ledger
            .append_log(
                user_id,
                LogLevel::Info,
                &format!("Position closed for {symbol}"),
                Some(json!({"closed_orders": closed_orders})),
            )
            .await;

        Ok(CloseReport {
            success: true,
            closed_orders,
            message: format!("Successfully closed position for {symbol}"),
            error: None,
        })
    }
}

/// Exponential backoff with multiplicative jitter: attempt 1 sleeps
/// base*[0.5,1.0), attempt 2 twice that, and so on.
pub(crate) fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let exponential = base.as_secs_f64() * 2f64.powi(attempt.saturating_sub(1) as i32);
    let jitter = rand::thread_rng().gen_range(0.5..1.0);
    Duration::from_secs_f64(exponential * jitter)
}

/// Slippage-adjusted limit price: buys bid under the reference, sells
/// offer above it.
pub(crate) fn limit_price_with_slippage(reference: f64, side: Side, slippage_pct: f64) -> f64 {
    match side {
        Side::Buy => reference * (1.0 - slippage_pct / 100.0),
        Side::Sell => reference * (1.0 + slippage_pct / 100.0),
    }
}

/// Venues spell symbols without the separator; compare normalized.
pub(crate) fn symbols_match(venue_symbol: &str, symbol: &str) -> bool {
    venue_symbol.replace('/', "") == symbol.replace('/', "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_bounds() {
        let base = Duration::from_secs(60);

        for _ in 0..20 {
            let d1 = retry_delay(base, 1).as_secs_f64();
            assert!((30.0..60.0).contains(&d1), "attempt 1 delay {d1} out of range");

            let d2 = retry_delay(base, 2).as_secs_f64();
            assert!((60.0..120.0).contains(&d2), "attempt 2 delay {d2} out of range");

            let d3 = retry_delay(base, 3).as_secs_f64();
            assert!((120.0..240.0).contains(&d3), "attempt 3 delay {d3} out of range");
        }
    }

    #[test]
    fn test_limit_price_slippage() {
        // Buys bid 0.5% under the reference price
        assert!((limit_price_with_slippage(100.0, Side::Buy, 0.5) - 99.5).abs() < 1e-9);
        // Sells offer 0.5% above
        assert!((limit_price_with_slippage(100.0, Side::Sell, 0.5) - 100.5).abs() < 1e-9);
        // Zero slippage is a no-op
        assert_eq!(limit_price_with_slippage(100.0, Side::Buy, 0.0), 100.0);
    }

    #[test]
    fn test_symbols_match_normalizes_separator() {
        assert!(symbols_match("BTCUSDT", "BTC/USDT"));
        assert!(symbols_match("BTC/USDT", "BTC/USDT"));
        assert!(!symbols_match("ETHUSDT", "BTC/USDT"));
    }
}
