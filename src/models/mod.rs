use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of a trade intent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exposure direction of an open position
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LONG" => Some(PositionSide::Long),
            "SHORT" => Some(PositionSide::Short),
            _ => None,
        }
    }
}

/// Action recorded on a trade row
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TradeAction {
    Buy,
    Sell,
    Close,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
            TradeAction::Close => "CLOSE",
        }
    }
}

/// Severity of a per-user log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// Order submission style when no explicit price accompanies a live intent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingMode {
    Market,
    Limit,
    MarketLimitFallback,
}

impl TradingMode {
    /// Parse the settings string; anything unrecognized falls back to market.
    pub fn parse(s: &str) -> Self {
        match s {
            "limit" => TradingMode::Limit,
            "market_limit_fallback" => TradingMode::MarketLimitFallback,
            _ => TradingMode::Market,
        }
    }
}

/// One open-or-closed stance per (user, symbol)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub user_id: Uuid,
    pub symbol: String,
    pub exchange: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub size: f64,
    pub initial_size: f64,
    pub highest_price: f64,
    pub trailing_stop_price: Option<f64>,
    pub is_open: bool,
    pub exit_price: Option<f64>,
    pub pnl: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Immutable audit record of one completed or failed order leg
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub user_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: TradeAction,
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    pub exchange: String,
    pub result: String,
    pub order_id: Option<String>,
    pub pnl: f64,
    pub fees: f64,
    pub is_paper_trade: bool,
}

/// Insert payload for a trade row
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub user_id: Uuid,
    pub action: TradeAction,
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    pub exchange: String,
    pub result: String,
    pub order_id: Option<String>,
    pub pnl: f64,
    pub fees: f64,
    pub is_paper_trade: bool,
}

/// One tier of the tiered take-profit ladder
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TieredTpLevel {
    pub percent: f64,
    pub size_percent: f64,
}

/// Per-user configuration, re-read at every decision point
#[derive(Debug, Clone)]
pub struct UserSettings {
    pub user_id: Uuid,
    pub auto_trading_enabled: bool,
    pub trading_mode: TradingMode,
    pub slippage: f64,
    pub default_position_size: f64,
    pub total_pnl: f64,
    pub paper_trading_enabled: bool,
    pub trailing_stop_enabled: bool,
    pub trailing_stop_percent: f64,
    pub enable_notifications: bool,
    pub notification_email: Option<String>,
    pub tiered_tp_enabled: bool,
    pub tiered_tp_levels: Option<String>,
}

impl UserSettings {
    /// Parse the tiered take-profit ladder from its stored JSON form.
    /// Malformed JSON is treated as no ladder.
    pub fn tiered_levels(&self) -> Vec<TieredTpLevel> {
        self.tiered_tp_levels
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

/// Inbound order-execution intent, as carried on the job queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub user_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub size: Option<f64>,
    pub price: Option<f64>,
    pub exchange: String,
}
