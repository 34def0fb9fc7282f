//! Order records produced from intercepted traffic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder for order fields the payload did not carry.
pub const UNKNOWN: &str = "unknown";

/// One completed request/response cycle captured by the proxy.
///
/// Transient: built per exchange, handed to the parser and dropped.
#[derive(Debug, Clone)]
pub struct InterceptedExchange {
    /// Hostname the client asked for (from CONNECT or the absolute URI).
    pub hostname: String,
    /// Request path including the query string.
    pub path: String,
    /// Request method.
    pub method: String,
    /// Request headers in wire order.
    pub request_headers: Vec<(String, String)>,
    /// Response status code.
    pub status: u16,
    /// Response headers in wire order.
    pub response_headers: Vec<(String, String)>,
    /// Decoded response body.
    pub body: Vec<u8>,
    /// When the response finished.
    pub timestamp: DateTime<Utc>,
}

impl InterceptedExchange {
    /// Returns the first response header with the given name (case-insensitive).
    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the response body as text, replacing invalid UTF-8.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Order state extracted from a delivery app payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedOrder {
    /// App-side order identifier.
    pub order_id: String,
    /// Restaurant or store name.
    pub restaurant_name: String,
    /// App-specific status string (e.g. `on_the_way`).
    pub status: String,
    /// Estimated delivery time as reported by the app.
    pub eta: Option<String>,
    /// Display name of the delivery app the payload came from.
    pub source_app: String,
    /// Order total, when the payload carried one.
    pub total_amount: Option<f64>,
    /// The JSON body the record was extracted from.
    pub raw_body: String,
}

impl NormalizedOrder {
    /// Returns true if the order id was present in the payload.
    pub fn has_order_id(&self) -> bool {
        self.order_id != UNKNOWN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_serializes_camel_case() {
        let order = NormalizedOrder {
            order_id: "42".into(),
            restaurant_name: "Test".into(),
            status: "preparing".into(),
            eta: None,
            source_app: "Jahez".into(),
            total_amount: Some(31.5),
            raw_body: "{}".into(),
        };
        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["orderId"], "42");
        assert_eq!(json["restaurantName"], "Test");
        assert_eq!(json["sourceApp"], "Jahez");
        assert_eq!(json["totalAmount"], 31.5);
        assert!(json["eta"].is_null());
    }

    #[test]
    fn response_header_is_case_insensitive() {
        let exchange = InterceptedExchange {
            hostname: "api.jahez.net".into(),
            path: "/orders".into(),
            method: "GET".into(),
            request_headers: vec![],
            status: 200,
            response_headers: vec![("content-type".into(), "application/json".into())],
            body: b"{}".to_vec(),
            timestamp: Utc::now(),
        };
        assert_eq!(
            exchange.response_header("Content-Type"),
            Some("application/json")
        );
        assert_eq!(exchange.response_header("Content-Length"), None);
    }
}
