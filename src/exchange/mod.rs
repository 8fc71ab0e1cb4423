// Exchange gateway abstraction and venue registry
pub mod binance;

pub use binance::BinanceGateway;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::ExecError;
use crate::models::Side;
use crate::vault::ApiCredentials;

/// Common result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors raised by a trading venue. All of them are transient from the
/// executor's point of view: the venue may recover on the next attempt.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("exchange rejected request: {0}")]
    Rejected(String),

    #[error("malformed exchange response: {0}")]
    MalformedResponse(String),
}

/// Order submission style
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Market,
    Limit,
}

/// Last-traded price for a symbol
#[derive(Debug, Clone)]
pub struct Ticker {
    pub symbol: String,
    pub last: f64,
}

/// Acknowledgement returned by the venue for a submitted order
#[derive(Debug, Clone)]
pub struct OrderReceipt {
    pub order_id: String,
    /// Fill price when the venue reports one; market orders on some
    /// venues acknowledge before the fill price is known.
    pub executed_price: Option<f64>,
}

/// One venue-side position as reported by the balance scan.
/// Positive amounts are long exposure, negative are short.
#[derive(Debug, Clone)]
pub struct PositionBalance {
    pub symbol: String,
    pub amount: f64,
}

/// Abstract trading venue: ticker lookup, order placement, balance scan.
///
/// Implementations own their transport, authentication and rate limiting;
/// callers treat every error as retryable.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    fn name(&self) -> &str;

    /// Current market price. Public data, works without credentials.
    async fn ticker(&self, symbol: &str) -> GatewayResult<Ticker>;

    /// Submit an order. `price` is required for limit orders and ignored
    /// for market orders.
    async fn create_order(
        &self,
        symbol: &str,
        kind: OrderKind,
        side: Side,
        amount: f64,
        price: Option<f64>,
    ) -> GatewayResult<OrderReceipt>;

    /// Non-zero venue-side positions for the authenticated account.
    async fn position_balances(&self) -> GatewayResult<Vec<PositionBalance>>;
}

type GatewayFactory = Arc<dyn Fn(Option<&ApiCredentials>) -> Arc<dyn ExchangeGateway> + Send + Sync>;

/// Maps exchange-name strings to gateway factories.
///
/// Replaces runtime attribute dispatch on the venue name with an explicit
/// registry; unknown names fail with a typed error instead of a lookup
/// panic.
pub struct GatewayRegistry {
    factories: HashMap<String, GatewayFactory>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the venues this build ships with.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("binance", |creds| {
            Arc::new(BinanceGateway::new(creds)) as Arc<dyn ExchangeGateway>
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(Option<&ApiCredentials>) -> Arc<dyn ExchangeGateway> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Authenticated gateway for order placement and balance scans.
    pub fn connect(
        &self,
        name: &str,
        credentials: &ApiCredentials,
    ) -> Result<Arc<dyn ExchangeGateway>, ExecError> {
        self.build(name, Some(credentials))
    }

    /// Credential-free gateway, good for ticker data only.
    pub fn public(&self, name: &str) -> Result<Arc<dyn ExchangeGateway>, ExecError> {
        self.build(name, None)
    }

    fn build(
        &self,
        name: &str,
        credentials: Option<&ApiCredentials>,
    ) -> Result<Arc<dyn ExchangeGateway>, ExecError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ExecError::UnknownExchange(name.to_string()))?;
        Ok(factory(credentials))
    }
}

impl Default for GatewayRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubGateway;

    #[async_trait]
    impl ExchangeGateway for StubGateway {
        fn name(&self) -> &str {
            "stub"
        }

        async fn ticker(&self, symbol: &str) -> GatewayResult<Ticker> {
            Ok(Ticker {
                symbol: symbol.to_string(),
                last: 100.0,
            })
        }

        async fn create_order(
            &self,
            _symbol: &str,
            _kind: OrderKind,
            _side: Side,
            _amount: f64,
            _price: Option<f64>,
        ) -> GatewayResult<OrderReceipt> {
            Ok(OrderReceipt {
                order_id: "stub-1".to_string(),
                executed_price: Some(100.0),
            })
        }

        async fn position_balances(&self) -> GatewayResult<Vec<PositionBalance>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_unknown_exchange_is_typed_error() {
        let registry = GatewayRegistry::with_defaults();
        let err = match registry.public("mtgox") {
            Ok(_) => panic!("expected UnknownExchange error"),
            Err(e) => e,
        };
        assert!(matches!(err, ExecError::UnknownExchange(ref name) if name == "mtgox"));
    }

    #[test]
    fn test_default_registry_knows_binance() {
        let registry = GatewayRegistry::with_defaults();
        assert!(registry.public("binance").is_ok());
    }

    #[tokio::test]
    async fn test_registered_factory_is_used() {
        let mut registry = GatewayRegistry::new();
        registry.register("stub", |_| Arc::new(StubGateway) as Arc<dyn ExchangeGateway>);

        let gateway = registry.public("stub").unwrap();
        assert_eq!(gateway.name(), "stub");

        let ticker = gateway.ticker("BTC/USDT").await.unwrap();
        assert_eq!(ticker.last, 100.0);
    }
}
