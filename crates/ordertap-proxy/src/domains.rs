//! Interception allow-list.
//!
//! Only hosts on this list are decrypted. Everything else is tunneled
//! byte-for-byte without any certificate work.

use ordertap_core::{domain_matches, normalize_host, AppRegistry};

/// Backend domains of the bundled delivery apps.
///
/// Kept for documentation and the CLI; the proxy derives its list from the
/// [`AppRegistry`] it is configured with.
pub const DELIVERY_DOMAINS: &[&str] = &[
    // HungerStation
    "hungerstation.com",
    // Jahez
    "jahez.net",
    "jahez.com",
    // ToYou
    "toyou.io",
    // Mrsool
    "mrsool.co",
    // Careem
    "careem.com",
];

/// Set of domains whose traffic is intercepted.
///
/// A host matches a domain if it is the domain itself or any subdomain of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainAllowList {
    domains: Vec<String>,
}

impl DomainAllowList {
    /// Creates an allow-list from domain names. Blank entries are ignored.
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::default();
        for domain in domains {
            list.add(domain.as_ref());
        }
        list
    }

    /// Creates an allow-list covering every app in the registry.
    pub fn from_registry(registry: &AppRegistry) -> Self {
        Self::new(registry.domains())
    }

    /// Adds a domain. Leading `*.`, ports and case are normalized away.
    pub fn add(&mut self, domain: &str) {
        let domain = normalize_host(domain.trim().trim_start_matches("*."));
        if !domain.is_empty() && !self.domains.contains(&domain) {
            self.domains.push(domain);
        }
    }

    /// Checks if the given host should be intercepted.
    ///
    /// # Examples
    ///
    /// ```
    /// use ordertap_proxy::DomainAllowList;
    ///
    /// let list = DomainAllowList::new(["jahez.net"]);
    /// assert!(list.contains("api.jahez.net"));
    /// assert!(list.contains("JAHEZ.NET:443"));
    /// assert!(!list.contains("notjahez.net"));
    /// ```
    pub fn contains(&self, host: &str) -> bool {
        let host = normalize_host(host);
        !host.is_empty() && self.domains.iter().any(|d| domain_matches(&host, d))
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_list_matches_bundled_domains() {
        let list = DomainAllowList::from_registry(&AppRegistry::with_defaults());
        for domain in DELIVERY_DOMAINS {
            assert!(list.contains(domain), "{} should be intercepted", domain);
            assert!(list.contains(&format!("api.{}", domain)));
        }
        assert_eq!(list.len(), DELIVERY_DOMAINS.len());
    }

    #[test]
    fn non_delivery_hosts_pass_through() {
        let list = DomainAllowList::new(DELIVERY_DOMAINS);
        assert!(!list.contains("google.com"));
        assert!(!list.contains("example.com"));
        assert!(!list.contains("hungerstation.com.evil.net"));
        assert!(!list.contains("fakecareem.com"));
        assert!(!list.contains(""));
    }

    #[test]
    fn add_normalizes_entries() {
        let mut list = DomainAllowList::default();
        list.add("*.Example.COM");
        list.add("example.com:443");
        list.add("  ");
        assert_eq!(list.domains(), &["example.com".to_string()]);
        assert!(list.contains("www.example.com"));
    }
}
