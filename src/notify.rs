use reqwest::Client;
use serde::Serialize;
use uuid::Uuid;

use crate::models::UserSettings;

/// Trade event handed to the external notifier sink
#[derive(Debug, Clone, Serialize)]
pub struct TradeEvent {
    pub user_id: Uuid,
    pub email: String,
    pub action: String,
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    pub is_paper_trade: bool,
}

/// Best-effort side channel for trade notifications.
///
/// Delivery (email rendering, SMTP) is owned by the external notifier
/// service; this dispatcher only posts the event. Failures are logged and
/// swallowed: a lost notification must never fail the order.
#[derive(Clone)]
pub struct NotificationDispatcher {
    client: Client,
    sink_url: Option<String>,
}

impl NotificationDispatcher {
    pub fn new(sink_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            sink_url,
        }
    }

    /// Dispatcher with no sink configured; every dispatch is a no-op.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Fire-and-forget dispatch. Returns immediately; the send happens on
    /// a spawned task.
    pub fn dispatch(&self, settings: &UserSettings, action: &str, symbol: &str, price: f64, size: f64, is_paper_trade: bool) {
        if !settings.enable_notifications {
            return;
        }
        let Some(email) = settings.notification_email.clone() else {
            return;
        };
        let Some(url) = self.sink_url.clone() else {
            tracing::debug!("Notifier sink not configured, skipping notification");
            return;
        };

        let event = TradeEvent {
            user_id: settings.user_id,
            email,
            action: action.to_string(),
            symbol: symbol.to_string(),
            price,
            size,
            is_paper_trade,
        };
        let client = self.client.clone();

        tokio::spawn(async move {
            match client.post(&url).json(&event).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::info!(
                        "Trade notification sent for {} {} {}",
                        event.action,
                        event.symbol,
                        event.user_id
                    );
                }
                Ok(response) => {
                    tracing::warn!(
                        "Notifier sink returned {} for {} notification",
                        response.status(),
                        event.symbol
                    );
                }
                Err(e) => {
                    tracing::warn!("Failed to reach notifier sink: {}", e);
                }
            }
        });
    }
}
