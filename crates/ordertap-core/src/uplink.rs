//! Boundary to whatever consumes extracted orders.

use async_trait::async_trait;

use crate::error::Result;
use crate::order::NormalizedOrder;

/// Receives orders extracted by the proxy.
///
/// Implementations must tolerate concurrent calls; the proxy submits each
/// order from its own task.
#[async_trait]
pub trait OrderUplink: Send + Sync {
    /// Hands one order to the consumer.
    async fn submit(&self, order: NormalizedOrder) -> Result<()>;
}

/// Uplink that only logs orders.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingUplink;

#[async_trait]
impl OrderUplink for LoggingUplink {
    async fn submit(&self, order: NormalizedOrder) -> Result<()> {
        tracing::info!(
            "Order {} from {} ({}): {}",
            order.order_id,
            order.source_app,
            order.restaurant_name,
            order.status
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn logging_uplink_accepts_orders() {
        let uplink: Arc<dyn OrderUplink> = Arc::new(LoggingUplink);
        let order = NormalizedOrder {
            order_id: "1".into(),
            restaurant_name: "Test".into(),
            status: "preparing".into(),
            eta: None,
            source_app: "Jahez".into(),
            total_amount: None,
            raw_body: "{}".into(),
        };
        assert!(tokio_test::block_on(uplink.submit(order)).is_ok());
    }
}
