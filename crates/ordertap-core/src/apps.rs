//! Delivery app registry.
//!
//! Each supported delivery app is described by an [`AppProfile`]: the domains
//! its backend lives on, the path fragments that identify order endpoints, and
//! the candidate JSON field paths for every order field. The parser dispatches
//! on the request hostname through an [`AppRegistry`].

use serde::{Deserialize, Serialize};

// =============================================================================
// Field Table
// =============================================================================

/// Ordered candidate JSON paths for each order field.
///
/// Paths are dot-separated (`order.id`). The first path that resolves wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldTable {
    pub order_id: Vec<String>,
    pub restaurant_name: Vec<String>,
    pub status: Vec<String>,
    pub eta: Vec<String>,
    pub total_amount: Vec<String>,
}

fn paths(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl FieldTable {
    /// Creates a field table from string slices.
    pub fn new(
        order_id: &[&str],
        restaurant_name: &[&str],
        status: &[&str],
        eta: &[&str],
        total_amount: &[&str],
    ) -> Self {
        Self {
            order_id: paths(order_id),
            restaurant_name: paths(restaurant_name),
            status: paths(status),
            eta: paths(eta),
            total_amount: paths(total_amount),
        }
    }

    /// Common field names across delivery backends, for apps without a
    /// dedicated profile.
    pub fn generic() -> Self {
        Self::new(
            &["orderId", "order_id", "id", "order.id", "data.orderId"],
            &[
                "restaurantName",
                "restaurant_name",
                "restaurant.name",
                "storeName",
                "store_name",
                "vendorName",
                "vendor_name",
            ],
            &["status", "orderStatus", "order_status", "state"],
            &["eta", "estimatedTime", "estimated_time", "estimatedDeliveryTime"],
            &["total", "totalAmount", "total_amount", "totalPrice", "amount"],
        )
    }
}

// =============================================================================
// App Profile
// =============================================================================

/// Path fragments that mark an endpoint as order related.
pub const DEFAULT_ORDER_PATHS: &[&str] = &[
    "/order",
    "/orders",
    "/track",
    "/tracking",
    "/delivery",
    "/status",
    "/details",
    "/my-orders",
    "/active",
    "/current",
    "/history",
];

/// A delivery app the parser knows how to read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppProfile {
    /// Display name reported as the order's source app.
    pub name: String,
    /// Backend domains. A host matches a domain exactly or as a subdomain.
    pub domains: Vec<String>,
    /// Lowercase path fragments identifying order endpoints.
    pub order_paths: Vec<String>,
    /// Candidate field paths.
    pub fields: FieldTable,
}

impl AppProfile {
    /// Creates a profile with the default order path allow-list.
    pub fn new(name: impl Into<String>, domains: &[&str], fields: FieldTable) -> Self {
        Self {
            name: name.into(),
            domains: paths(domains),
            order_paths: paths(DEFAULT_ORDER_PATHS),
            fields,
        }
    }

    /// Replaces the order path allow-list.
    pub fn with_order_paths(mut self, order_paths: &[&str]) -> Self {
        self.order_paths = order_paths.iter().map(|p| p.to_lowercase()).collect();
        self
    }

    /// Checks if a host belongs to this app.
    pub fn matches_host(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.domains
            .iter()
            .any(|domain| domain_matches(&host, domain))
    }

    /// Checks if a request path looks like an order endpoint.
    pub fn is_order_path(&self, path: &str) -> bool {
        let path = path.to_lowercase();
        self.order_paths.iter().any(|p| path.contains(p.as_str()))
    }
}

/// Strips an optional port and lowercases a host.
///
/// Bracketed IPv6 literals lose their brackets; a bare IPv6 literal is kept.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else if host.matches(':').count() == 1 {
        host.split(':').next().unwrap_or(host)
    } else {
        host
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Returns true if `host` equals `domain` or is one of its subdomains.
///
/// `host` must already be normalized.
pub fn domain_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim_start_matches("*.").as_bytes();
    let host = host.as_bytes();
    if host.len() == domain.len() {
        return host.eq_ignore_ascii_case(domain);
    }
    host.len() > domain.len() + 1
        && host[host.len() - domain.len()..].eq_ignore_ascii_case(domain)
        && host[host.len() - domain.len() - 1] == b'.'
}

// =============================================================================
// Bundled Apps
// =============================================================================

/// Returns the bundled delivery app profiles.
pub fn bundled_apps() -> Vec<AppProfile> {
    vec![
        AppProfile::new(
            "HungerStation",
            &["hungerstation.com"],
            FieldTable::new(
                &["order_id", "orderId", "id", "order.id"],
                &[
                    "restaurant_name",
                    "restaurantName",
                    "restaurant.name",
                    "vendor_name",
                    "vendorName",
                ],
                &["status", "order_status", "orderStatus", "state"],
                &[
                    "eta",
                    "estimated_delivery_time",
                    "estimatedDeliveryTime",
                    "delivery_time",
                ],
                &["total", "total_amount", "totalAmount", "grand_total"],
            ),
        ),
        AppProfile::new(
            "Jahez",
            &["jahez.net", "jahez.com"],
            FieldTable::new(
                &["orderId", "order_id", "id", "data.orderId"],
                &["restaurantName", "restaurant_name", "storeName", "store_name"],
                &["status", "orderStatus", "order_status"],
                &["eta", "estimatedTime", "estimated_time", "deliveryTime"],
                &["total", "totalPrice", "total_price", "amount"],
            ),
        ),
        AppProfile::new(
            "ToYou",
            &["toyou.io"],
            FieldTable::new(
                &["order_id", "orderId", "id"],
                &["store_name", "storeName", "restaurant_name", "vendor"],
                &["status", "order_status", "state"],
                &["eta", "delivery_eta", "estimated_arrival"],
                &["total", "total_amount", "price"],
            ),
        ),
        AppProfile::new(
            "Mrsool",
            &["mrsool.co"],
            FieldTable::new(
                &["order_id", "orderId", "id", "request_id"],
                &["store_name", "storeName", "merchant_name", "vendor_name"],
                &["status", "order_status", "state", "delivery_status"],
                &["eta", "estimated_time", "arrival_time"],
                &["total", "total_amount", "price", "cost"],
            ),
        ),
        AppProfile::new(
            "Careem",
            &["careem.com"],
            FieldTable::new(
                &["order_id", "orderId", "id", "booking_id"],
                &["vendor_name", "vendorName", "restaurant_name", "merchant"],
                &["status", "order_status", "state", "booking_status"],
                &["eta", "estimated_arrival", "arrival_eta", "delivery_eta"],
                &["total", "total_fare", "amount", "price"],
            ),
        ),
    ]
}

// =============================================================================
// App Registry
// =============================================================================

/// Immutable lookup table from hostname to app profile.
#[derive(Debug, Clone, Default)]
pub struct AppRegistry {
    apps: Vec<AppProfile>,
}

impl AppRegistry {
    /// Creates a registry from the given profiles. Earlier profiles win ties.
    pub fn new(apps: Vec<AppProfile>) -> Self {
        Self { apps }
    }

    /// Creates a registry with the bundled apps.
    pub fn with_defaults() -> Self {
        Self::new(bundled_apps())
    }

    /// Adds a profile after the existing ones.
    pub fn with_app(mut self, app: AppProfile) -> Self {
        self.apps.push(app);
        self
    }

    /// Finds the app serving the given host.
    pub fn lookup(&self, host: &str) -> Option<&AppProfile> {
        self.apps.iter().find(|app| app.matches_host(host))
    }

    /// Returns every domain of every registered app, deduplicated.
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = Vec::new();
        for domain in self.apps.iter().flat_map(|app| app.domains.iter()) {
            if !domains.contains(domain) {
                domains.push(domain.clone());
            }
        }
        domains
    }

    /// Returns all profiles.
    pub fn apps(&self) -> &[AppProfile] {
        &self.apps
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== domain_matches Tests ====================

    #[test]
    fn domain_matches_exact_and_subdomain() {
        assert!(domain_matches("jahez.net", "jahez.net"));
        assert!(domain_matches("api.jahez.net", "jahez.net"));
        assert!(domain_matches("a.b.jahez.net", "jahez.net"));
    }

    #[test]
    fn domain_matches_rejects_lookalikes() {
        assert!(!domain_matches("notjahez.net", "jahez.net"));
        assert!(!domain_matches("jahez.net.evil.com", "jahez.net"));
        assert!(!domain_matches("net", "jahez.net"));
    }

    #[test]
    fn normalize_host_strips_port_and_case() {
        assert_eq!(normalize_host("API.Jahez.NET:443"), "api.jahez.net");
        assert_eq!(normalize_host("careem.com."), "careem.com");
        assert_eq!(normalize_host("[::1]:8443"), "::1");
        assert_eq!(normalize_host("::1"), "::1");
    }

    // ==================== Registry Tests ====================

    #[test]
    fn registry_lookup_bundled() {
        let registry = AppRegistry::with_defaults();
        assert_eq!(registry.lookup("api.jahez.net").unwrap().name, "Jahez");
        assert_eq!(
            registry.lookup("api.hungerstation.com").unwrap().name,
            "HungerStation"
        );
        assert_eq!(registry.lookup("food.careem.com").unwrap().name, "Careem");
        assert!(registry.lookup("example.com").is_none());
    }

    #[test]
    fn registry_domains_deduplicated() {
        let registry = AppRegistry::with_defaults()
            .with_app(AppProfile::new("Dup", &["jahez.net"], FieldTable::default()));
        let domains = registry.domains();
        assert_eq!(
            domains.iter().filter(|d| d.as_str() == "jahez.net").count(),
            1
        );
        assert!(domains.contains(&"toyou.io".to_string()));
    }

    #[test]
    fn order_path_case_insensitive() {
        let app = &bundled_apps()[0];
        assert!(app.is_order_path("/api/V2/Orders/55"));
        assert!(app.is_order_path("/v1/tracking?id=1"));
        assert!(!app.is_order_path("/v1/menu"));
    }

    #[test]
    fn generic_fields_cover_both_casings() {
        let fields = FieldTable::generic();
        assert!(fields.order_id.iter().any(|p| p == "orderId"));
        assert!(fields.order_id.iter().any(|p| p == "order_id"));
        assert!(fields.restaurant_name.iter().any(|p| p == "store_name"));
        assert!(!fields.total_amount.is_empty());
    }

    #[test]
    fn custom_order_paths() {
        let app = AppProfile::new("X", &["x.test"], FieldTable::default())
            .with_order_paths(&["/Shipments"]);
        assert!(app.is_order_path("/api/shipments/1"));
        assert!(!app.is_order_path("/api/orders/1"));
    }
}
