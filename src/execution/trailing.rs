use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use super::executor::FEE_RATE;
use crate::error::ExecError;
use crate::exchange::GatewayRegistry;
use crate::ledger::{CloseTrade, PositionLedger};
use crate::models::{LogLevel, Position, PositionSide, TradeAction, UserSettings};

const DEFAULT_TICK_TIMEOUT_SECS: u64 = 10;

/// Venue-offset request dispatched to the worker when a live trailing
/// stop fires. Fire-and-forget: the scan never waits for it.
#[derive(Debug, Clone)]
pub struct CloseDispatch {
    pub user_id: Uuid,
    pub symbol: String,
    pub exchange: String,
}

/// Result of one monitor pass
#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub status: String,
    pub users_monitored: usize,
    pub message: Option<String>,
}

/// Periodic re-pricing of every trailing-stop position: ratchets the
/// high-water mark, recomputes the stop, and closes breached positions.
pub struct TrailingStopMonitor {
    ledger: Arc<PositionLedger>,
    registry: Arc<GatewayRegistry>,
    close_tx: mpsc::Sender<CloseDispatch>,
    tick_timeout: Duration,
}

impl TrailingStopMonitor {
    pub fn new(
        ledger: Arc<PositionLedger>,
        registry: Arc<GatewayRegistry>,
        close_tx: mpsc::Sender<CloseDispatch>,
    ) -> Self {
        Self {
            ledger,
            registry,
            close_tx,
            tick_timeout: Duration::from_secs(DEFAULT_TICK_TIMEOUT_SECS),
        }
    }

    pub fn with_tick_timeout(mut self, tick_timeout: Duration) -> Self {
        self.tick_timeout = tick_timeout;
        self
    }

    /// One monitor pass over every user with trailing stops enabled.
    /// Per-position failures are logged and skipped; they never abort the
    /// rest of the scan.
    pub async fn scan(&self) -> MonitorReport {
        let users = match self.ledger.users_with_trailing_enabled().await {
            Ok(users) => users,
            Err(e) => {
                tracing::error!("Trailing stop scan failed to list users: {}", e);
                return MonitorReport {
                    status: "error".to_string(),
                    users_monitored: 0,
                    message: Some(e.to_string()),
                };
            }
        };

        tracing::info!("Monitoring trailing stops for {} users", users.len());

        for user_id in &users {
            let settings = match self.ledger.settings(*user_id).await {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!("Skipping user {}: settings fetch failed: {}", user_id, e);
                    continue;
                }
            };
            // Re-checked per pass: a toggle takes effect on the next scan
            if !settings.trailing_stop_enabled {
                continue;
            }

            let positions = match self.ledger.open_positions_for_user(*user_id).await {
                Ok(positions) => positions,
                Err(e) => {
                    tracing::warn!("Skipping user {}: position fetch failed: {}", user_id, e);
                    continue;
                }
            };

            for position in positions {
                if let Err(e) = self.tick(&settings, &position).await {
                    tracing::error!(
                        "Error monitoring trailing stop for {}: {}",
                        position.symbol,
                        e
                    );
                    let _ = self
                        .ledger
                        .append_log(
                            *user_id,
                            LogLevel::Error,
                            &format!("Trailing stop check failed for {}: {e}", position.symbol),
                            Some(json!({"position_id": position.id})),
                        )
                        .await;
                }
            }
        }

        MonitorReport {
            status: "success".to_string(),
            users_monitored: users.len(),
            message: None,
        }
    }

    /// Re-price one position and close it when the stop is breached.
    async fn tick(&self, settings: &UserSettings, position: &Position) -> Result<(), ExecError> {
        // Only LONG ratchets are tracked; the symmetric SHORT logic
        // (lowest-price ratchet, stop above) is an extension point.
        if position.side == PositionSide::Short {
            tracing::debug!("Skipping SHORT position {} (no trailing logic)", position.id);
            return Ok(());
        }

        let gateway = self.registry.public(&position.exchange)?;
        let ticker = timeout(self.tick_timeout, gateway.ticker(&position.symbol))
            .await
            .map_err(|_| {
                ExecError::Internal(format!("ticker fetch timed out for {}", position.symbol))
            })??;
        let current_price = ticker.last;

        let highest = position.highest_price.max(current_price);
        if highest > position.highest_price {
            tracing::info!("Updated highest price for {}: {}", position.symbol, highest);
        }
        let stop = trailing_stop_price(highest, settings.trailing_stop_percent);
        self.ledger.update_trailing(position.id, highest, stop).await?;

        if current_price > stop {
            return Ok(());
        }

        tracing::info!(
            "Trailing stop hit for {} at {} (stop {:.4})",
            position.symbol,
            current_price,
            stop
        );

        let fees = if settings.paper_trading_enabled {
            0.0
        } else {
            current_price * position.size * FEE_RATE
        };
        let meta = CloseTrade {
            action: TradeAction::Sell,
            exchange: position.exchange.clone(),
            result: format!("Trailing stop-loss triggered at {current_price}"),
            order_id: None,
            fees,
            is_paper_trade: settings.paper_trading_enabled,
        };

        match self
            .ledger
            .reduce_or_close(
                position.user_id,
                &position.symbol,
                current_price,
                position.size,
                &meta,
            )
            .await
        {
            Ok(outcome) => {
                let _ = self
                    .ledger
                    .append_log(
                        position.user_id,
                        LogLevel::Info,
                        &format!(
                            "Trailing stop closed {} at {current_price} (PnL: ${:.2})",
                            position.symbol, outcome.pnl
                        ),
                        Some(json!({"position_id": position.id, "stop": stop})),
                    )
                    .await;

                // Live positions also need the venue-side offset; the
                // worker picks this up asynchronously.
                if !settings.paper_trading_enabled {
                    let dispatch = CloseDispatch {
                        user_id: position.user_id,
                        symbol: position.symbol.clone(),
                        exchange: position.exchange.clone(),
                    };
                    if let Err(e) = self.close_tx.try_send(dispatch) {
                        tracing::warn!(
                            "Failed to dispatch close for {}: {}",
                            position.symbol,
                            e
                        );
                    }
                }
            }
            // A concurrent worker already closed it; nothing left to do
            Err(ExecError::NoPosition(_)) => {}
            Err(e) => return Err(e),
        }

        Ok(())
    }
}

/// Stop level: a configured percentage below the high-water mark.
pub(crate) fn trailing_stop_price(highest_price: f64, trailing_percent: f64) -> f64 {
    highest_price * (1.0 - trailing_percent / 100.0)
}
