//! Order extraction from delivery app API response bodies.
//!
//! Turns a captured JSON body into a [`NormalizedOrder`] using the field table
//! of the app that owns the hostname.

use serde_json::{Map, Value};

use crate::apps::{AppProfile, AppRegistry};
use crate::order::{InterceptedExchange, NormalizedOrder, UNKNOWN};

/// Maps captured JSON bodies to normalized order records.
#[derive(Debug, Clone, Default)]
pub struct ApplicationParser {
    registry: AppRegistry,
}

impl ApplicationParser {
    /// Creates a parser over the given registry.
    pub fn new(registry: AppRegistry) -> Self {
        Self { registry }
    }

    /// Creates a parser with the bundled apps.
    pub fn with_defaults() -> Self {
        Self::new(AppRegistry::with_defaults())
    }

    /// Returns the underlying registry.
    pub fn registry(&self) -> &AppRegistry {
        &self.registry
    }

    /// Extracts an order from a response body.
    ///
    /// Returns `None` when the host belongs to no known app, the path is not an
    /// order endpoint, the body is not a JSON object (or a non-empty array of
    /// objects), or neither the order id nor the restaurant name resolved.
    pub fn parse(&self, hostname: &str, path: &str, body: &[u8]) -> Option<NormalizedOrder> {
        let app = self.registry.lookup(hostname)?;
        if !app.is_order_path(path) {
            tracing::trace!("{}{} is not an order endpoint", hostname, path);
            return None;
        }

        let json = parse_root_object(body)?;
        let order = extract_order(app, &json, body);
        if order.is_none() {
            tracing::debug!(
                "No order fields in {} bytes from {}{}",
                body.len(),
                hostname,
                path
            );
        }
        order
    }

    /// Extracts an order from a completed exchange.
    pub fn parse_exchange(&self, exchange: &InterceptedExchange) -> Option<NormalizedOrder> {
        self.parse(&exchange.hostname, &exchange.path, &exchange.body)
    }
}

/// Parses the body and selects the object the field paths apply to.
///
/// Arrays use their first element, which must be an object.
fn parse_root_object(body: &[u8]) -> Option<Map<String, Value>> {
    let value: Value = serde_json::from_slice(body).ok()?;
    match value {
        Value::Object(map) => Some(map),
        Value::Array(items) => match items.into_iter().next()? {
            Value::Object(map) => Some(map),
            _ => None,
        },
        _ => None,
    }
}

fn extract_order(app: &AppProfile, json: &Map<String, Value>, body: &[u8]) -> Option<NormalizedOrder> {
    let fields = &app.fields;
    let order_id = first_text(json, &fields.order_id);
    let restaurant_name = first_text(json, &fields.restaurant_name);

    if order_id.is_none() && restaurant_name.is_none() {
        return None;
    }

    Some(NormalizedOrder {
        order_id: order_id.unwrap_or_else(|| UNKNOWN.to_string()),
        restaurant_name: restaurant_name.unwrap_or_else(|| UNKNOWN.to_string()),
        status: first_text(json, &fields.status).unwrap_or_else(|| UNKNOWN.to_string()),
        eta: first_text(json, &fields.eta),
        source_app: app.name.clone(),
        total_amount: first_number(json, &fields.total_amount),
        raw_body: String::from_utf8_lossy(body).into_owned(),
    })
}

/// Walks a dot-separated path through nested objects.
///
/// Every segment except the last must land on an object.
fn lookup<'a>(json: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = json.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn first_text(json: &Map<String, Value>, paths: &[String]) -> Option<String> {
    paths
        .iter()
        .find_map(|path| lookup(json, path).and_then(as_text))
}

fn first_number(json: &Map<String, Value>, paths: &[String]) -> Option<f64> {
    paths
        .iter()
        .find_map(|path| lookup(json, path).and_then(as_number))
}

/// Renders a scalar as text. Objects, arrays and null do not resolve.
fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Reads a number from a JSON number or a numeric string.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::FieldTable;

    fn parser() -> ApplicationParser {
        ApplicationParser::with_defaults()
    }

    // ==================== Jahez Tests ====================

    #[test]
    fn parse_jahez_order() {
        let body = r#"{"order_id":"12345","restaurant_name":"Test","status":"on_the_way"}"#;
        let order = parser()
            .parse("api.jahez.net", "/v1/orders/12345", body.as_bytes())
            .unwrap();

        assert_eq!(order.order_id, "12345");
        assert_eq!(order.restaurant_name, "Test");
        assert_eq!(order.status, "on_the_way");
        assert_eq!(order.source_app, "Jahez");
        assert_eq!(order.eta, None);
        assert_eq!(order.total_amount, None);
        assert_eq!(order.raw_body, body);
    }

    #[test]
    fn parse_first_candidate_wins() {
        let body = r#"{"orderId":"A1","order_id":"B2","storeName":"Shawarma House"}"#;
        let order = parser()
            .parse("api.jahez.net", "/orders/current", body.as_bytes())
            .unwrap();
        assert_eq!(order.order_id, "A1");
        assert_eq!(order.restaurant_name, "Shawarma House");
        assert_eq!(order.status, UNKNOWN);
    }

    #[test]
    fn parse_nested_path() {
        let body = r#"{"data":{"orderId":991},"status":"preparing"}"#;
        let order = parser()
            .parse("jahez.net", "/api/track", body.as_bytes())
            .unwrap();
        assert_eq!(order.order_id, "991");
        assert_eq!(order.restaurant_name, UNKNOWN);
        assert_eq!(order.status, "preparing");
    }

    // ==================== Numeric Fields ====================

    #[test]
    fn parse_amount_from_number_or_string() {
        let body = r#"{"order_id":"1","total":"45.50"}"#;
        let order = parser()
            .parse("api.hungerstation.com", "/orders/1", body.as_bytes())
            .unwrap();
        assert_eq!(order.total_amount, Some(45.5));

        let body = r#"{"order_id":"1","total":45}"#;
        let order = parser()
            .parse("api.hungerstation.com", "/orders/1", body.as_bytes())
            .unwrap();
        assert_eq!(order.total_amount, Some(45.0));
    }

    #[test]
    fn parse_amount_skips_non_numeric_candidates() {
        let body = r#"{"order_id":"1","total":"n/a","total_amount":12}"#;
        let order = parser()
            .parse("api.hungerstation.com", "/orders/1", body.as_bytes())
            .unwrap();
        assert_eq!(order.total_amount, Some(12.0));
    }

    // ==================== Body Shapes ====================

    #[test]
    fn parse_array_uses_first_object() {
        let body = r#"[{"order_id":"7","store_name":"Kudu"},{"order_id":"8"}]"#;
        let order = parser()
            .parse("api.toyou.io", "/v2/orders", body.as_bytes())
            .unwrap();
        assert_eq!(order.order_id, "7");
        assert_eq!(order.restaurant_name, "Kudu");
        assert_eq!(order.source_app, "ToYou");
    }

    #[test]
    fn parse_rejects_empty_array_and_scalars() {
        let p = parser();
        assert!(p.parse("api.toyou.io", "/orders", b"[]").is_none());
        assert!(p.parse("api.toyou.io", "/orders", b"[1,2]").is_none());
        assert!(p.parse("api.toyou.io", "/orders", b"\"text\"").is_none());
        assert!(p.parse("api.toyou.io", "/orders", b"not json").is_none());
        assert!(p.parse("api.toyou.io", "/orders", b"").is_none());
    }

    // ==================== Rejections ====================

    #[test]
    fn parse_requires_order_path() {
        let body = r#"{"order_id":"1","restaurant_name":"X"}"#;
        assert!(parser()
            .parse("api.jahez.net", "/v1/menu", body.as_bytes())
            .is_none());
    }

    #[test]
    fn parse_requires_known_host() {
        let body = r#"{"order_id":"1","restaurant_name":"X"}"#;
        assert!(parser()
            .parse("api.example.com", "/orders", body.as_bytes())
            .is_none());
    }

    #[test]
    fn parse_requires_id_or_restaurant() {
        let body = r#"{"status":"delivered","eta":"12:30"}"#;
        assert!(parser()
            .parse("api.mrsool.co", "/orders/1", body.as_bytes())
            .is_none());
    }

    #[test]
    fn parse_ignores_object_and_null_values() {
        let body = r#"{"order_id":{"value":"1"},"id":null,"request_id":"R-9"}"#;
        let order = parser()
            .parse("api.mrsool.co", "/orders/1", body.as_bytes())
            .unwrap();
        assert_eq!(order.order_id, "R-9");
    }

    #[test]
    fn parse_with_custom_registry() {
        let registry = AppRegistry::new(vec![AppProfile::new(
            "Test App",
            &["shop.test"],
            FieldTable::new(&["ref"], &["shop"], &["state"], &[], &[]),
        )]);
        let parser = ApplicationParser::new(registry);
        let order = parser
            .parse("m.shop.test", "/orders", br#"{"ref":"Z","state":"done"}"#)
            .unwrap();
        assert_eq!(order.order_id, "Z");
        assert_eq!(order.status, "done");
        assert_eq!(order.source_app, "Test App");
    }
}
