use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use sha2::Sha256;
use uuid::Uuid;

use super::{
    ExchangeGateway, GatewayError, GatewayResult, OrderKind, OrderReceipt, PositionBalance, Ticker,
};
use crate::models::Side;
use crate::vault::ApiCredentials;

const BINANCE_API_BASE: &str = "https://fapi.binance.com";
const REQUEST_TIMEOUT_SECS: u64 = 30;
const RATE_LIMIT_RPS: u32 = 8;

// Type alias for the rate limiter to simplify signatures
type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Binance gateway over the futures REST API.
///
/// Single-shot client: the order executor owns retries, so failed requests
/// surface immediately as `GatewayError`.
pub struct BinanceGateway {
    client: Client,
    base_url: String,
    credentials: Option<ApiCredentials>,
    rate_limiter: Arc<BinanceRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    symbol: String,
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    #[serde(default)]
    avg_price: Option<String>,
    #[serde(default)]
    price: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRiskEntry {
    symbol: String,
    position_amt: String,
}

impl BinanceGateway {
    pub fn new(credentials: Option<&ApiCredentials>) -> Self {
        let base_url =
            std::env::var("BINANCE_API_BASE").unwrap_or_else(|_| BINANCE_API_BASE.to_string());
        Self::with_base_url(base_url, credentials)
    }

    /// Construct against an explicit base URL (tests point this at a mock
    /// server).
    pub fn with_base_url(base_url: impl Into<String>, credentials: Option<&ApiCredentials>) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        let quota = Quota::per_second(NonZeroU32::new(RATE_LIMIT_RPS).unwrap());

        Self {
            client,
            base_url: base_url.into(),
            credentials: credentials.cloned(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// Binance spells symbols without the separator: BTC/USDT -> BTCUSDT
    fn venue_symbol(symbol: &str) -> String {
        symbol.replace('/', "")
    }

    fn api_key(&self) -> GatewayResult<&str> {
        self.credentials
            .as_ref()
            .map(|c| c.api_key.as_str())
            .ok_or_else(|| GatewayError::Auth("API key required for this endpoint".to_string()))
    }

    /// HMAC-SHA256 signature over the request query string.
    fn sign(&self, query: &str) -> GatewayResult<String> {
        let secret = self
            .credentials
            .as_ref()
            .map(|c| c.api_secret.as_str())
            .ok_or_else(|| GatewayError::Auth("API secret required for this endpoint".to_string()))?;

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|e| GatewayError::Auth(e.to_string()))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn check_status(response: reqwest::Response) -> GatewayResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());

        if status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(GatewayError::RateLimited(body));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(GatewayError::Auth(body));
        }
        Err(GatewayError::Rejected(format!("{status}: {body}")))
    }

    fn parse_price(raw: Option<&str>) -> Option<f64> {
        let value: f64 = raw?.parse().ok()?;
        (value > 0.0).then_some(value)
    }
}

#[async_trait]
impl ExchangeGateway for BinanceGateway {
    fn name(&self) -> &str {
        "binance"
    }

    async fn ticker(&self, symbol: &str) -> GatewayResult<Ticker> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/fapi/v1/ticker/price", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("symbol", Self::venue_symbol(symbol))])
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        let response = Self::check_status(response).await?;
        let body: TickerResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;

        let last: f64 = body
            .price
            .parse()
            .map_err(|_| GatewayError::MalformedResponse(format!("bad price: {}", body.price)))?;

        Ok(Ticker {
            symbol: body.symbol,
            last,
        })
    }

    async fn create_order(
        &self,
        symbol: &str,
        kind: OrderKind,
        side: Side,
        amount: f64,
        price: Option<f64>,
    ) -> GatewayResult<OrderReceipt> {
        self.rate_limiter.until_ready().await;

        let side_param = match side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };

        // Fresh client order id per submission; venues that deduplicate on
        // it can absorb a retried request.
        let client_order_id = format!("st-{}", Uuid::new_v4().simple());

        let mut query = format!(
            "symbol={}&side={}&quantity={}&newClientOrderId={}",
            Self::venue_symbol(symbol),
            side_param,
            amount,
            client_order_id,
        );
        match kind {
            OrderKind::Market => query.push_str("&type=MARKET"),
            OrderKind::Limit => {
                let limit_price = price.ok_or_else(|| {
                    GatewayError::Rejected("limit order requires a price".to_string())
                })?;
                query.push_str(&format!("&type=LIMIT&timeInForce=GTC&price={limit_price}"));
            }
        }
        query.push_str(&format!("&timestamp={}", Utc::now().timestamp_millis()));

        let signature = self.sign(&query)?;
        let url = format!("{}/fapi/v1/order?{query}&signature={signature}", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("X-MBX-APIKEY", self.api_key()?)
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        let response = Self::check_status(response).await?;
        let body: OrderResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;

        let executed_price = Self::parse_price(body.avg_price.as_deref())
            .or_else(|| Self::parse_price(body.price.as_deref()));

        Ok(OrderReceipt {
            order_id: body.order_id.to_string(),
            executed_price,
        })
    }

    async fn position_balances(&self) -> GatewayResult<Vec<PositionBalance>> {
        self.rate_limiter.until_ready().await;

        let query = format!("timestamp={}", Utc::now().timestamp_millis());
        let signature = self.sign(&query)?;
        let url = format!(
            "{}/fapi/v2/positionRisk?{query}&signature={signature}",
            self.base_url
        );

        let response = self
            .client
            .get(&url)
            .header("X-MBX-APIKEY", self.api_key()?)
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        let response = Self::check_status(response).await?;
        let entries: Vec<PositionRiskEntry> = response
            .json()
            .await
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;

        let mut balances = Vec::new();
        for entry in entries {
            let amount: f64 = entry.position_amt.parse().map_err(|_| {
                GatewayError::MalformedResponse(format!("bad positionAmt: {}", entry.position_amt))
            })?;
            if amount != 0.0 {
                balances.push(PositionBalance {
                    symbol: entry.symbol,
                    amount,
                });
            }
        }

        Ok(balances)
    }
}
