//! End-to-end lifecycle tests against a live Postgres.
//!
//! Run with: DATABASE_URL=postgres://localhost/signaltrader_test cargo test -- --ignored

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use signaltrader::exchange::{
    ExchangeGateway, GatewayError, GatewayRegistry, GatewayResult, OrderKind, OrderReceipt,
    PositionBalance, Ticker,
};
use signaltrader::execution::{ExecutorConfig, OrderExecutor, TrailingStopMonitor};
use signaltrader::ledger::PositionLedger;
use signaltrader::models::{ExecutionRequest, NewTrade, Side, TradeAction};
use signaltrader::notify::NotificationDispatcher;
use signaltrader::vault::CredentialVault;

/// Scripted venue: ticker prices play back in order (last one repeats),
/// orders fill at a fixed price or echo the limit price.
struct ScriptedGateway {
    ticker_prices: Mutex<VecDeque<f64>>,
    last_price: Mutex<f64>,
    fill_price: Option<f64>,
    balances: Vec<PositionBalance>,
    order_calls: AtomicU32,
    fail_orders: bool,
}

impl ScriptedGateway {
    fn new(prices: &[f64], fill_price: Option<f64>) -> Arc<Self> {
        Arc::new(Self {
            ticker_prices: Mutex::new(prices.iter().copied().collect()),
            last_price: Mutex::new(prices.first().copied().unwrap_or(100.0)),
            fill_price,
            balances: Vec::new(),
            order_calls: AtomicU32::new(0),
            fail_orders: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            ticker_prices: Mutex::new(VecDeque::new()),
            last_price: Mutex::new(100.0),
            fill_price: None,
            balances: Vec::new(),
            order_calls: AtomicU32::new(0),
            fail_orders: true,
        })
    }

    fn with_balances(balances: Vec<PositionBalance>, fill_price: f64) -> Arc<Self> {
        Arc::new(Self {
            ticker_prices: Mutex::new(VecDeque::new()),
            last_price: Mutex::new(fill_price),
            fill_price: Some(fill_price),
            balances,
            order_calls: AtomicU32::new(0),
            fail_orders: false,
        })
    }

    fn order_calls(&self) -> u32 {
        self.order_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExchangeGateway for ScriptedGateway {
    fn name(&self) -> &str {
        "mockex"
    }

    async fn ticker(&self, symbol: &str) -> GatewayResult<Ticker> {
        let mut prices = self.ticker_prices.lock().unwrap();
        let last = match prices.pop_front() {
            Some(price) => {
                *self.last_price.lock().unwrap() = price;
                price
            }
            None => *self.last_price.lock().unwrap(),
        };
        Ok(Ticker {
            symbol: symbol.to_string(),
            last,
        })
    }

    async fn create_order(
        &self,
        _symbol: &str,
        _kind: OrderKind,
        _side: Side,
        _amount: f64,
        price: Option<f64>,
    ) -> GatewayResult<OrderReceipt> {
        let call = self.order_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_orders {
            return Err(GatewayError::Network("connection refused".to_string()));
        }
        Ok(OrderReceipt {
            order_id: format!("mock-{call}"),
            // Limit orders fill at their limit; market orders at the
            // scripted price
            executed_price: price.or(self.fill_price),
        })
    }

    async fn position_balances(&self) -> GatewayResult<Vec<PositionBalance>> {
        if self.fail_orders {
            return Err(GatewayError::Network("connection refused".to_string()));
        }
        Ok(self.balances.clone())
    }
}

struct Harness {
    ledger: Arc<PositionLedger>,
    executor: Arc<OrderExecutor>,
    registry: Arc<GatewayRegistry>,
    user_id: Uuid,
}

async fn setup(tag: &str, gateway: Option<Arc<ScriptedGateway>>) -> Harness {
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/signaltrader_test".to_string());
    let ledger = Arc::new(
        PositionLedger::connect(&database_url)
            .await
            .expect("Failed to connect to test database"),
    );

    let mut registry = GatewayRegistry::new();
    if let Some(gateway) = gateway {
        registry.register("mockex", move |_| gateway.clone() as Arc<dyn ExchangeGateway>);
    }
    let registry = Arc::new(registry);

    let executor = Arc::new(OrderExecutor::new(
        ledger.clone(),
        registry.clone(),
        NotificationDispatcher::disabled(),
        ExecutorConfig {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(10),
        },
    ));

    let username = format!("{tag}-{}", Uuid::new_v4().simple());
    let user_id = ledger.create_user(&username).await.unwrap();
    ledger.settings(user_id).await.unwrap();

    Harness {
        ledger,
        executor,
        registry,
        user_id,
    }
}

async fn enable_paper(h: &Harness) {
    let mut settings = h.ledger.settings(h.user_id).await.unwrap();
    settings.paper_trading_enabled = true;
    h.ledger.update_settings(&settings).await.unwrap();
}

fn request(h: &Harness, side: Side, size: f64, price: Option<f64>) -> ExecutionRequest {
    ExecutionRequest {
        user_id: h.user_id,
        symbol: "BTC/USDT".to_string(),
        side,
        size: Some(size),
        price,
        exchange: "mockex".to_string(),
    }
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_paper_trade_lifecycle() {
    let h = setup("paper-cycle", None).await;
    enable_paper(&h).await;

    // Buy 2 @ 100
    let report = h.executor.execute(&request(&h, Side::Buy, 2.0, Some(100.0))).await;
    assert!(report.success, "{}", report.message);
    assert!(report.is_paper_trade);
    assert!(report.order_id.unwrap().starts_with("paper-"));

    let position = h.ledger.get_open(h.user_id, "BTC/USDT").await.unwrap().unwrap();
    assert_eq!(position.entry_price, 100.0);
    assert_eq!(position.size, 2.0);
    assert_eq!(position.highest_price, 100.0);

    // Duplicate buy is rejected without a trade row
    let report = h.executor.execute(&request(&h, Side::Buy, 2.0, Some(105.0))).await;
    assert!(!report.success);
    assert!(report.error.unwrap().contains("already have open position"));
    assert_eq!(h.ledger.trades_for_user(h.user_id).await.unwrap().len(), 1);

    // Rejection is idempotent
    let report = h.executor.execute(&request(&h, Side::Buy, 2.0, Some(105.0))).await;
    assert!(!report.success);
    assert_eq!(h.ledger.trades_for_user(h.user_id).await.unwrap().len(), 1);

    // Sell 2 @ 110 realizes (110 - 100) * 2 = 20
    let report = h.executor.execute(&request(&h, Side::Sell, 2.0, Some(110.0))).await;
    assert!(report.success, "{}", report.message);

    assert!(h.ledger.get_open(h.user_id, "BTC/USDT").await.unwrap().is_none());
    let trades = h.ledger.trades_for_user(h.user_id).await.unwrap();
    assert_eq!(trades.len(), 2);
    assert_eq!(trades[1].action, TradeAction::Sell);
    assert_eq!(trades[1].pnl, 20.0);
    assert_eq!(trades[1].fees, 0.0);
    assert!(trades[1].is_paper_trade);

    let settings = h.ledger.settings(h.user_id).await.unwrap();
    assert_eq!(settings.total_pnl, 20.0);

    // Sell again: no position left
    let report = h.executor.execute(&request(&h, Side::Sell, 2.0, Some(110.0))).await;
    assert!(!report.success);
    assert!(report.error.unwrap().contains("no open position"));
    assert_eq!(h.ledger.trades_for_user(h.user_id).await.unwrap().len(), 2);

    h.ledger.delete_user(h.user_id).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_paper_buy_without_price_is_terminal() {
    let h = setup("paper-noprice", None).await;
    enable_paper(&h).await;

    let report = h.executor.execute(&request(&h, Side::Buy, 1.0, None)).await;
    assert!(!report.success);
    assert!(report.error.unwrap().contains("paper trading"));

    // Validation failures leave neither a trade nor a position
    assert!(h.ledger.trades_for_user(h.user_id).await.unwrap().is_empty());
    assert!(h.ledger.get_open(h.user_id, "BTC/USDT").await.unwrap().is_none());

    h.ledger.delete_user(h.user_id).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_live_trade_with_fees() {
    let gateway = ScriptedGateway::new(&[100.0], Some(100.0));
    let h = setup("live-cycle", Some(gateway.clone())).await;

    let vault = CredentialVault::new(h.ledger.pool().clone());
    vault.store(h.user_id, "mockex", "k", "s").await.unwrap();

    // Market buy (no price, default market mode)
    let report = h.executor.execute(&request(&h, Side::Buy, 2.0, None)).await;
    assert!(report.success, "{}", report.message);
    assert!(!report.is_paper_trade);
    assert_eq!(report.order_id.as_deref(), Some("mock-1"));

    let trades = h.ledger.trades_for_user(h.user_id).await.unwrap();
    assert_eq!(trades.len(), 1);
    // 0.1% of 100 * 2
    assert_eq!(trades[0].fees, 0.2);
    assert!(!trades[0].is_paper_trade);

    // Limit sell at an explicit price
    let report = h.executor.execute(&request(&h, Side::Sell, 2.0, Some(110.0))).await;
    assert!(report.success, "{}", report.message);

    let trades = h.ledger.trades_for_user(h.user_id).await.unwrap();
    assert_eq!(trades.len(), 2);
    assert_eq!(trades[1].pnl, 20.0);
    assert!(trades[1].result.contains("PnL: $20.00"));
    assert_eq!(gateway.order_calls(), 2);

    h.ledger.delete_user(h.user_id).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_live_without_credentials_is_terminal() {
    let gateway = ScriptedGateway::new(&[100.0], Some(100.0));
    let h = setup("live-nocreds", Some(gateway.clone())).await;

    let report = h.executor.execute(&request(&h, Side::Buy, 1.0, None)).await;
    assert!(!report.success);
    assert!(report.error.unwrap().contains("credentials"));

    // Never reached the venue, never wrote a trade
    assert_eq!(gateway.order_calls(), 0);
    assert!(h.ledger.trades_for_user(h.user_id).await.unwrap().is_empty());

    h.ledger.delete_user(h.user_id).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_unknown_exchange_is_terminal() {
    let h = setup("live-unknown", None).await;

    let vault = CredentialVault::new(h.ledger.pool().clone());
    vault.store(h.user_id, "mtgox", "k", "s").await.unwrap();

    let mut req = request(&h, Side::Buy, 1.0, None);
    req.exchange = "mtgox".to_string();

    let report = h.executor.execute(&req).await;
    assert!(!report.success);
    assert!(report.error.unwrap().contains("unknown exchange"));
    assert!(h.ledger.trades_for_user(h.user_id).await.unwrap().is_empty());

    h.ledger.delete_user(h.user_id).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_retry_exhaustion_writes_one_failed_trade() {
    let gateway = ScriptedGateway::failing();
    let h = setup("live-retry", Some(gateway.clone())).await;

    let vault = CredentialVault::new(h.ledger.pool().clone());
    vault.store(h.user_id, "mockex", "k", "s").await.unwrap();

    let report = h.executor.execute(&request(&h, Side::Buy, 1.0, None)).await;
    assert!(!report.success);
    assert!(report.message.contains("after 3 retries"));

    // Initial attempt + 3 retries
    assert_eq!(gateway.order_calls(), 4);

    // Exactly one FAILED trade row
    let trades = h.ledger.trades_for_user(h.user_id).await.unwrap();
    assert_eq!(trades.len(), 1);
    assert!(trades[0].result.starts_with("FAILED:"));
    assert_eq!(trades[0].order_id, None);

    // No position came out of it
    assert!(h.ledger.get_open(h.user_id, "BTC/USDT").await.unwrap().is_none());

    h.ledger.delete_user(h.user_id).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_concurrent_paper_buys_one_wins() {
    let h = setup("paper-race", None).await;
    enable_paper(&h).await;

    let a = {
        let executor = h.executor.clone();
        let req = request(&h, Side::Buy, 1.0, Some(100.0));
        tokio::spawn(async move { executor.execute(&req).await })
    };
    let b = {
        let executor = h.executor.clone();
        let req = request(&h, Side::Buy, 1.0, Some(101.0));
        tokio::spawn(async move { executor.execute(&req).await })
    };

    let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
    let successes = [&ra, &rb].iter().filter(|r| r.success).count();
    assert_eq!(successes, 1, "exactly one buy must win the race");

    let loser = if ra.success { &rb } else { &ra };
    assert!(loser.error.as_ref().unwrap().contains("already have open position"));

    // One position, one trade
    assert_eq!(h.ledger.open_positions_for_user(h.user_id).await.unwrap().len(), 1);
    assert_eq!(h.ledger.trades_for_user(h.user_id).await.unwrap().len(), 1);

    h.ledger.delete_user(h.user_id).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_trailing_stop_scenario() {
    // Price path: 120 ratchets the stop to 114, then 113 breaches it
    let gateway = ScriptedGateway::new(&[120.0, 113.0], None);
    let h = setup("trailing", Some(gateway.clone())).await;

    let mut settings = h.ledger.settings(h.user_id).await.unwrap();
    settings.paper_trading_enabled = true;
    settings.trailing_stop_enabled = true;
    settings.trailing_stop_percent = 5.0;
    h.ledger.update_settings(&settings).await.unwrap();

    // Open LONG entry=100, highest=100
    let report = h.executor.execute(&request(&h, Side::Buy, 1.0, Some(100.0))).await;
    assert!(report.success, "{}", report.message);

    let (close_tx, mut close_rx) = mpsc::channel(8);
    let monitor = TrailingStopMonitor::new(h.ledger.clone(), h.registry.clone(), close_tx);

    // Scan 1: price 120 -> highest 120, stop 114, still open
    let report = monitor.scan().await;
    assert_eq!(report.status, "success");
    assert!(report.users_monitored >= 1);

    let position = h.ledger.get_open(h.user_id, "BTC/USDT").await.unwrap().unwrap();
    assert_eq!(position.highest_price, 120.0);
    assert_eq!(position.trailing_stop_price, Some(114.0));

    // Scan 2: price 113 <= 114 -> close triggered
    monitor.scan().await;

    assert!(h.ledger.get_open(h.user_id, "BTC/USDT").await.unwrap().is_none());

    let trades = h.ledger.trades_for_user(h.user_id).await.unwrap();
    assert_eq!(trades.len(), 2);
    assert_eq!(trades[1].action, TradeAction::Sell);
    assert!(trades[1].result.contains("Trailing stop-loss triggered at 113"));
    assert_eq!(trades[1].pnl, 13.0); // (113 - 100) * 1

    // Paper position: no venue offset dispatched
    assert!(close_rx.try_recv().is_err());

    h.ledger.delete_user(h.user_id).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_close_position_offsets_venue_balance() {
    let gateway = ScriptedGateway::with_balances(
        vec![PositionBalance {
            symbol: "BTCUSDT".to_string(),
            amount: 0.25,
        }],
        105.0,
    );
    let h = setup("close-scan", Some(gateway.clone())).await;

    let vault = CredentialVault::new(h.ledger.pool().clone());
    vault.store(h.user_id, "mockex", "k", "s").await.unwrap();

    // Local open position matching the venue exposure
    h.ledger
        .open_or_grow(
            h.user_id,
            "BTC/USDT",
            "mockex",
            100.0,
            0.25,
            false,
            &NewTrade {
                user_id: h.user_id,
                action: TradeAction::Buy,
                symbol: "BTC/USDT".to_string(),
                price: 100.0,
                size: 0.25,
                exchange: "mockex".to_string(),
                result: "Success: seed".to_string(),
                order_id: None,
                pnl: 0.0,
                fees: 0.0,
                is_paper_trade: false,
            },
        )
        .await
        .unwrap();

    let report = h.executor.close_position(h.user_id, "BTC/USDT", "mockex").await;
    assert!(report.success, "{}", report.message);
    assert_eq!(report.closed_orders, 1);

    // One offsetting market order hit the venue
    assert_eq!(gateway.order_calls(), 1);

    // Local position reconciled closed at the fill price
    assert!(h.ledger.get_open(h.user_id, "BTC/USDT").await.unwrap().is_none());

    let trades = h.ledger.trades_for_user(h.user_id).await.unwrap();
    assert_eq!(trades.len(), 2);
    assert_eq!(trades[1].action, TradeAction::Close);
    assert!(trades[1].result.contains("Closed: mock-1"));
    assert_eq!(trades[1].pnl, 1.25); // (105 - 100) * 0.25

    h.ledger.delete_user(h.user_id).await.unwrap();
}

#[tokio::test]
#[ignore] // Requires Postgres running
async fn test_close_position_with_no_venue_exposure() {
    let gateway = ScriptedGateway::with_balances(Vec::new(), 100.0);
    let h = setup("close-empty", Some(gateway.clone())).await;

    let vault = CredentialVault::new(h.ledger.pool().clone());
    vault.store(h.user_id, "mockex", "k", "s").await.unwrap();

    let report = h.executor.close_position(h.user_id, "BTC/USDT", "mockex").await;
    assert!(report.success);
    assert_eq!(report.closed_orders, 0);
    assert_eq!(gateway.order_calls(), 0);

    h.ledger.delete_user(h.user_id).await.unwrap();
}
