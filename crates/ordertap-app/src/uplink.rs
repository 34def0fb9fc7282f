//! HTTP uplink to the order ingestion server.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use ordertap_core::{CoreError, NormalizedOrder, OrderUplink};

/// Path orders are posted to, relative to the server URL.
pub const ORDER_ENDPOINT: &str = "/api/intercept/order";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of an order submission.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderPayload<'a> {
    order_id: &'a str,
    source: &'a str,
    restaurant_name: &'a str,
    status: &'a str,
    eta: Option<&'a str>,
    total_amount: Option<f64>,
    raw_data: &'a str,
}

impl<'a> From<&'a NormalizedOrder> for OrderPayload<'a> {
    fn from(order: &'a NormalizedOrder) -> Self {
        Self {
            order_id: &order.order_id,
            source: &order.source_app,
            restaurant_name: &order.restaurant_name,
            status: &order.status,
            eta: order.eta.as_deref(),
            total_amount: order.total_amount,
            raw_data: &order.raw_body,
        }
    }
}

/// Posts each order as JSON to `{server_url}/api/intercept/order`.
#[derive(Debug, Clone)]
pub struct HttpUplink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpUplink {
    /// Creates an uplink for the given server URL.
    pub fn new(server_url: &str) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("Ordertap/{}", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}{}", server_url.trim_end_matches('/'), ORDER_ENDPOINT),
        })
    }

    /// Full URL orders are posted to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl OrderUplink for HttpUplink {
    async fn submit(&self, order: NormalizedOrder) -> ordertap_core::Result<()> {
        self.client
            .post(&self.endpoint)
            .json(&OrderPayload::from(&order))
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| CoreError::Uplink(e.to_string()))?;

        tracing::debug!("Submitted order {} to {}", order.order_id, self.endpoint);
        Ok(())
    }
}
