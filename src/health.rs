use std::sync::Arc;

use serde::Serialize;

use crate::error::ExecError;
use crate::ledger::PositionLedger;

/// Aggregate platform metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub active_users: i64,
    pub trades_24h: i64,
    pub open_positions: i64,
}

/// Periodic aggregate-metrics job. Pure observation: it reads counters,
/// records a snapshot row, and has no influence on trading.
pub struct HealthReporter {
    ledger: Arc<PositionLedger>,
}

impl HealthReporter {
    pub fn new(ledger: Arc<PositionLedger>) -> Self {
        Self { ledger }
    }

    pub async fn report(&self) -> HealthReport {
        match self.collect().await {
            Ok(report) => {
                tracing::info!(
                    "System health check: {} active users, {} trades (24h), {} open positions",
                    report.active_users,
                    report.trades_24h,
                    report.open_positions
                );
                report
            }
            Err(e) => {
                tracing::error!("Health check failed: {}", e);
                HealthReport {
                    status: "error".to_string(),
                    active_users: 0,
                    trades_24h: 0,
                    open_positions: 0,
                }
            }
        }
    }

    async fn collect(&self) -> Result<HealthReport, ExecError> {
        let active_users = self.ledger.active_users_24h().await?;
        let trades_24h = self.ledger.trades_24h().await?;
        let open_positions = self.ledger.open_position_count().await?;

        self.ledger
            .record_health(active_users, trades_24h, open_positions)
            .await?;

        Ok(HealthReport {
            status: "success".to_string(),
            active_users,
            trades_24h,
            open_positions,
        })
    }
}
