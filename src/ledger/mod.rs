use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{map_position_insert_err, ExecError};
use crate::models::{
    LogLevel, NewTrade, Position, PositionSide, Trade, TradeAction, TradingMode, UserSettings,
};

/// Metadata for the trade row accompanying a closing leg. The realized
/// pnl is only known inside the transaction, so the ledger finalizes the
/// row: pnl is filled in and appended to the result text.
#[derive(Debug, Clone)]
pub struct CloseTrade {
    pub action: TradeAction,
    pub exchange: String,
    pub result: String,
    pub order_id: Option<String>,
    pub fees: f64,
    pub is_paper_trade: bool,
}

/// Outcome of a reduce-or-close transition
#[derive(Debug, Clone)]
pub struct CloseOutcome {
    pub closed: bool,
    pub pnl: f64,
    pub remaining_size: f64,
    pub trade_id: Uuid,
}

/// Authoritative record of positions, trades, settings and logs.
///
/// Every position transition commits together with its trade row in one
/// transaction; the open-position row is taken `FOR UPDATE` so concurrent
/// workers serialize on the (user, symbol) pair.
pub struct PositionLedger {
    pool: PgPool,
}

impl PositionLedger {
    /// Connect to Postgres and run migrations.
    pub async fn connect(database_url: &str) -> crate::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres at {}", database_url);

        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests, shared pools).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ==================== USERS ====================

    pub async fn user_exists(&self, user_id: Uuid) -> Result<bool, ExecError> {
        let row = sqlx::query("SELECT 1 AS one FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Provision a user row. The registration flow lives in the API
    /// layer; this exists for provisioning tools and tests.
    pub async fn create_user(&self, username: &str) -> Result<Uuid, ExecError> {
        let row = sqlx::query("INSERT INTO users (username) VALUES ($1) RETURNING id")
            .bind(username)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("id"))
    }

    /// Remove a user and all dependent rows (cascade). Test cleanup.
    pub async fn delete_user(&self, user_id: Uuid) -> Result<(), ExecError> {
        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== SETTINGS ====================

    /// Fetch the user's settings, creating the default row on first read.
    /// Callers re-read at every decision point; nothing is cached.
    pub async fn settings(&self, user_id: Uuid) -> Result<UserSettings, ExecError> {
        if let Some(row) = self.fetch_settings_row(user_id).await? {
            return Ok(settings_from_row(&row));
        }

        sqlx::query("INSERT INTO settings (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        let row = self
            .fetch_settings_row(user_id)
            .await?
            .ok_or_else(|| ExecError::Internal("settings row missing after insert".to_string()))?;
        Ok(settings_from_row(&row))
    }

    async fn fetch_settings_row(&self, user_id: Uuid) -> Result<Option<PgRow>, ExecError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, auto_trading_enabled, trading_mode, slippage,
                   default_position_size, total_pnl, paper_trading_enabled,
                   trailing_stop_enabled, trailing_stop_percent,
                   enable_notifications, notification_email,
                   tiered_tp_enabled, tiered_tp_levels
            FROM settings
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Persist a full settings update (explicit user action).
    pub async fn update_settings(&self, settings: &UserSettings) -> Result<(), ExecError> {
        let mode = match settings.trading_mode {
            TradingMode::Market => "market",
            TradingMode::Limit => "limit",
            TradingMode::MarketLimitFallback => "market_limit_fallback",
        };

        sqlx::query(
            r#"
            UPDATE settings SET
                auto_trading_enabled = $2,
                trading_mode = $3,
                slippage = $4,
                default_position_size = $5,
                paper_trading_enabled = $6,
                trailing_stop_enabled = $7,
                trailing_stop_percent = $8,
                enable_notifications = $9,
                notification_email = $10,
                tiered_tp_enabled = $11,
                tiered_tp_levels = $12
            WHERE user_id = $1
            "#,
        )
        .bind(settings.user_id)
        .bind(settings.auto_trading_enabled)
        .bind(mode)
        .bind(settings.slippage)
        .bind(settings.default_position_size)
        .bind(settings.paper_trading_enabled)
        .bind(settings.trailing_stop_enabled)
        .bind(settings.trailing_stop_percent)
        .bind(settings.enable_notifications)
        .bind(settings.notification_email.as_deref())
        .bind(settings.tiered_tp_enabled)
        .bind(settings.tiered_tp_levels.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== POSITIONS ====================

    /// Current open position for (user, symbol), if any.
    pub async fn get_open(
        &self,
        user_id: Uuid,
        symbol: &str,
    ) -> Result<Option<Position>, ExecError> {
        let row = sqlx::query(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE user_id = $1 AND symbol = $2 AND is_open"
        ))
        .bind(user_id)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| position_from_row(&r)).transpose()
    }

    pub async fn get_position(&self, position_id: Uuid) -> Result<Option<Position>, ExecError> {
        let row = sqlx::query(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE id = $1"
        ))
        .bind(position_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| position_from_row(&r)).transpose()
    }

    /// Open a position, or grow an existing open one at the
    /// weighted-average entry price. The accompanying trade row commits in
    /// the same transaction. Concurrent opens for the same (user, symbol)
    /// serialize here: the loser of the insert race observes
    /// `DuplicatePosition`.
    ///
    /// `allow_growth` gates the pyramiding path. The executor passes
    /// false so the alternation rule holds even when another buy commits
    /// between its precheck and this call.
    pub async fn open_or_grow(
        &self,
        user_id: Uuid,
        symbol: &str,
        exchange: &str,
        price: f64,
        size: f64,
        allow_growth: bool,
        trade: &NewTrade,
    ) -> Result<(Position, Uuid), ExecError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions \
             WHERE user_id = $1 AND symbol = $2 AND is_open FOR UPDATE"
        ))
        .bind(user_id)
        .bind(symbol)
        .fetch_optional(&mut *tx)
        .await?;

        let position = match existing {
            Some(_) if !allow_growth => {
                return Err(ExecError::DuplicatePosition(symbol.to_string()));
            }
            Some(row) => {
                // Pyramiding: average the entry, extend the size
                let current = position_from_row(&row)?;
                let new_size = current.size + size;
                let new_entry =
                    (current.entry_price * current.size + price * size) / new_size;
                let new_highest = current.highest_price.max(price);

                sqlx::query(
                    r#"
                    UPDATE positions
                    SET entry_price = $2, size = $3, highest_price = $4, updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(current.id)
                .bind(new_entry)
                .bind(new_size)
                .bind(new_highest)
                .execute(&mut *tx)
                .await?;

                tracing::info!(
                    "Grew position {} for {}: avg entry ${:.4}, size {:.6}",
                    current.id,
                    symbol,
                    new_entry,
                    new_size
                );

                Position {
                    entry_price: new_entry,
                    size: new_size,
                    highest_price: new_highest,
                    ..current
                }
            }
            None => {
                let row = sqlx::query(&format!(
                    "INSERT INTO positions \
                         (user_id, symbol, exchange, side, entry_price, size, initial_size, highest_price) \
                     VALUES ($1, $2, $3, 'LONG', $4, $5, $5, $4) \
                     RETURNING {POSITION_COLUMNS}"
                ))
                .bind(user_id)
                .bind(symbol)
                .bind(exchange)
                .bind(price)
                .bind(size)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_position_insert_err(e, symbol))?;

                position_from_row(&row)?
            }
        };

        let trade_id = insert_trade(&mut tx, trade).await?;
        tx.commit().await?;

        Ok((position, trade_id))
    }

    /// Reduce an open position, closing it when the requested size covers
    /// the remainder. Realized pnl follows the position side; the trade
    /// row and the `settings.total_pnl` accumulator commit in the same
    /// transaction.
    pub async fn reduce_or_close(
        &self,
        user_id: Uuid,
        symbol: &str,
        price: f64,
        size: f64,
        meta: &CloseTrade,
    ) -> Result<CloseOutcome, ExecError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions \
             WHERE user_id = $1 AND symbol = $2 AND is_open FOR UPDATE"
        ))
        .bind(user_id)
        .bind(symbol)
        .fetch_optional(&mut *tx)
        .await?;

        let position = match row {
            Some(row) => position_from_row(&row)?,
            None => return Err(ExecError::NoPosition(symbol.to_string())),
        };

        let effective_size = size.min(position.size);
        let pnl = match position.side {
            PositionSide::Long => (price - position.entry_price) * effective_size,
            PositionSide::Short => (position.entry_price - price) * effective_size,
        };
        let closed = size >= position.size;

        if closed {
            sqlx::query(
                r#"
                UPDATE positions
                SET is_open = FALSE, exit_price = $2, pnl = $3,
                    closed_at = NOW(), updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(position.id)
            .bind(price)
            .bind(pnl)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query("UPDATE positions SET size = size - $2, updated_at = NOW() WHERE id = $1")
                .bind(position.id)
                .bind(effective_size)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("UPDATE settings SET total_pnl = total_pnl + $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(pnl)
            .execute(&mut *tx)
            .await?;

        let trade = NewTrade {
            user_id,
            action: meta.action,
            symbol: symbol.to_string(),
            price,
            size: effective_size,
            exchange: meta.exchange.clone(),
            result: format!("{} (PnL: ${:.2})", meta.result, pnl),
            order_id: meta.order_id.clone(),
            pnl,
            fees: meta.fees,
            is_paper_trade: meta.is_paper_trade,
        };
        let trade_id = insert_trade(&mut tx, &trade).await?;

        tx.commit().await?;

        Ok(CloseOutcome {
            closed,
            pnl,
            remaining_size: position.size - effective_size,
            trade_id,
        })
    }

    /// High-water mark and trailing stop update from the monitor.
    pub async fn update_trailing(
        &self,
        position_id: Uuid,
        highest_price: f64,
        trailing_stop_price: f64,
    ) -> Result<(), ExecError> {
        sqlx::query(
            r#"
            UPDATE positions
            SET highest_price = $2, trailing_stop_price = $3, updated_at = NOW()
            WHERE id = $1 AND is_open
            "#,
        )
        .bind(position_id)
        .bind(highest_price)
        .bind(trailing_stop_price)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn open_positions_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<Position>, ExecError> {
        let rows = sqlx::query(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions \
             WHERE user_id = $1 AND is_open ORDER BY opened_at ASC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(position_from_row).collect()
    }

    /// Users whose settings enable trailing-stop monitoring.
    pub async fn users_with_trailing_enabled(&self) -> Result<Vec<Uuid>, ExecError> {
        let rows = sqlx::query(
            r#"
            SELECT u.id
            FROM users u
            JOIN settings s ON s.user_id = u.id
            WHERE s.trailing_stop_enabled
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    // ==================== TRADES & LOGS ====================

    /// Append a standalone trade row (failure records, venue close legs
    /// with no matching local position).
    pub async fn record_trade(&self, trade: &NewTrade) -> Result<Uuid, ExecError> {
        let mut tx = self.pool.begin().await?;
        let id = insert_trade(&mut tx, trade).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Trades for a user, oldest first. Audit/UI surface.
    pub async fn trades_for_user(&self, user_id: Uuid) -> Result<Vec<Trade>, ExecError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, timestamp, action, symbol, price, size,
                   exchange, result, order_id, pnl, fees, is_paper_trade
            FROM trades
            WHERE user_id = $1
            ORDER BY timestamp ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(trade_from_row).collect()
    }

    /// Write-only diagnostic trail; the core never reads these back.
    pub async fn append_log(
        &self,
        user_id: Uuid,
        level: LogLevel,
        message: &str,
        data: Option<serde_json::Value>,
    ) -> Result<(), ExecError> {
        sqlx::query("INSERT INTO logs (user_id, level, message, data) VALUES ($1, $2, $3, $4)")
            .bind(user_id)
            .bind(level.as_str())
            .bind(message)
            .bind(data.map(|d| d.to_string()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== HEALTH AGGREGATES ====================

    /// Distinct users with trades in the last 24 hours.
    pub async fn active_users_24h(&self) -> Result<i64, ExecError> {
        let row = sqlx::query(
            "SELECT COUNT(DISTINCT user_id) AS count FROM trades \
             WHERE timestamp >= NOW() - INTERVAL '24 hours'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("count"))
    }

    pub async fn trades_24h(&self) -> Result<i64, ExecError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM trades \
             WHERE timestamp >= NOW() - INTERVAL '24 hours'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("count"))
    }

    pub async fn open_position_count(&self) -> Result<i64, ExecError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM positions WHERE is_open")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("count"))
    }

    pub async fn record_health(
        &self,
        active_users: i64,
        trades_24h: i64,
        open_positions: i64,
    ) -> Result<(), ExecError> {
        sqlx::query(
            "INSERT INTO system_health (active_users, trades_24h, open_positions) \
             VALUES ($1, $2, $3)",
        )
        .bind(active_users)
        .bind(trades_24h)
        .bind(open_positions)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

const POSITION_COLUMNS: &str = "id, user_id, symbol, exchange, side, entry_price, size, \
     initial_size, highest_price, trailing_stop_price, is_open, exit_price, pnl, \
     opened_at, closed_at";

async fn insert_trade(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    trade: &NewTrade,
) -> Result<Uuid, ExecError> {
    let row = sqlx::query(
        r#"
        INSERT INTO trades
            (user_id, action, symbol, price, size, exchange, result,
             order_id, pnl, fees, is_paper_trade)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING id
        "#,
    )
    .bind(trade.user_id)
    .bind(trade.action.as_str())
    .bind(&trade.symbol)
    .bind(trade.price)
    .bind(trade.size)
    .bind(&trade.exchange)
    .bind(&trade.result)
    .bind(trade.order_id.as_deref())
    .bind(trade.pnl)
    .bind(trade.fees)
    .bind(trade.is_paper_trade)
    .fetch_one(&mut **tx)
    .await?;

    Ok(row.get("id"))
}

fn position_from_row(row: &PgRow) -> Result<Position, ExecError> {
    let side_str: String = row.get("side");
    let side = PositionSide::parse(&side_str)
        .ok_or_else(|| ExecError::Internal(format!("invalid position side: {side_str}")))?;

    Ok(Position {
        id: row.get("id"),
        user_id: row.get("user_id"),
        symbol: row.get("symbol"),
        exchange: row.get("exchange"),
        side,
        entry_price: row.get("entry_price"),
        size: row.get("size"),
        initial_size: row.get("initial_size"),
        highest_price: row.get("highest_price"),
        trailing_stop_price: row.get("trailing_stop_price"),
        is_open: row.get("is_open"),
        exit_price: row.get("exit_price"),
        pnl: row.get("pnl"),
        opened_at: row.get("opened_at"),
        closed_at: row.get("closed_at"),
    })
}

fn trade_from_row(row: &PgRow) -> Result<Trade, ExecError> {
    let action_str: String = row.get("action");
    let action = match action_str.as_str() {
        "BUY" => TradeAction::Buy,
        "SELL" => TradeAction::Sell,
        "CLOSE" => TradeAction::Close,
        other => return Err(ExecError::Internal(format!("invalid trade action: {other}"))),
    };

    let timestamp: DateTime<Utc> = row.get("timestamp");

    Ok(Trade {
        id: row.get("id"),
        user_id: row.get("user_id"),
        timestamp,
        action,
        symbol: row.get("symbol"),
        price: row.get("price"),
        size: row.get("size"),
        exchange: row.get("exchange"),
        result: row.get("result"),
        order_id: row.get("order_id"),
        pnl: row.get("pnl"),
        fees: row.get("fees"),
        is_paper_trade: row.get("is_paper_trade"),
    })
}

fn settings_from_row(row: &PgRow) -> UserSettings {
    let mode: String = row.get("trading_mode");

    UserSettings {
        user_id: row.get("user_id"),
        auto_trading_enabled: row.get("auto_trading_enabled"),
        trading_mode: TradingMode::parse(&mode),
        slippage: row.get("slippage"),
        default_position_size: row.get("default_position_size"),
        total_pnl: row.get("total_pnl"),
        paper_trading_enabled: row.get("paper_trading_enabled"),
        trailing_stop_enabled: row.get("trailing_stop_enabled"),
        trailing_stop_percent: row.get("trailing_stop_percent"),
        enable_notifications: row.get("enable_notifications"),
        notification_email: row.get("notification_email"),
        tiered_tp_enabled: row.get("tiered_tp_enabled"),
        tiered_tp_levels: row.get("tiered_tp_levels"),
    }
}
