//! Redaction of credentials and payment data from captured JSON.
//!
//! Applied to the raw body of a [`NormalizedOrder`](crate::NormalizedOrder)
//! before it leaves the proxy. A value is replaced with [`REDACTED`] when its
//! key contains a sensitive word, when a string value matches one of the
//! token/card patterns, or when its digits pass the Luhn check.

use regex::RegexSet;
use serde_json::{Map, Value};

use crate::error::Result;

/// Replacement for redacted values.
pub const REDACTED: &str = "[REDACTED]";

/// Key fragments that mark a value as sensitive (matched against the
/// lowercased key).
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "pwd",
    "secret",
    "token",
    "api_key",
    "credit_card",
    "creditcard",
    "card_number",
    "cardnumber",
    "cvv",
    "cvc",
    "security_code",
    "securitycode",
    "expiry",
    "exp_month",
    "exp_year",
    "pin",
    "otp",
    "verification_code",
    "verificationcode",
    "ssn",
    "social_security",
    "national_id",
    "nationalid",
    "bank_account",
    "bankaccount",
    "account_number",
    "accountnumber",
    "iban",
    "swift",
    "routing_number",
    "routingnumber",
    "private_key",
    "privatekey",
    "secret_key",
    "secretkey",
    "session",
    "cookie",
    "authorization",
    "bearer",
    "jwt",
    "billing_address",
    "billingaddress",
    "payment_method",
    "paymentmethod",
    "payment_info",
    "paymentinfo",
];

/// Whole-value patterns for string values.
const SENSITIVE_PATTERNS: &[&str] = &[
    // card numbers
    r"^\d{13,19}$",
    // CVV / PIN
    r"^\d{3,4}$",
    // opaque tokens
    r"^[A-Za-z0-9_-]{20,}$",
    // JWT
    r"^eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+$",
    r"(?i)^Bearer\s+.+$",
];

/// Redacts sensitive values from JSON documents.
#[derive(Debug, Clone)]
pub struct SensitiveDataFilter {
    patterns: RegexSet,
}

impl SensitiveDataFilter {
    /// Compiles the bundled patterns.
    pub fn new() -> Result<Self> {
        Ok(Self {
            patterns: RegexSet::new(SENSITIVE_PATTERNS)?,
        })
    }

    /// Returns a redacted copy of `value`.
    pub fn sanitize(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.sanitize_object(map)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.sanitize(v)).collect()),
            Value::String(s) if self.is_sensitive_text(s) => Value::String(REDACTED.to_string()),
            other => other.clone(),
        }
    }

    /// Redacts a JSON document given as text.
    ///
    /// Text that is not valid JSON is returned unchanged.
    pub fn redact_json_text(&self, text: &str) -> String {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => {
                let sanitized = self.sanitize(&value);
                if sanitized == value {
                    text.to_string()
                } else {
                    sanitized.to_string()
                }
            }
            Err(_) => text.to_string(),
        }
    }

    fn sanitize_object(&self, map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .map(|(key, value)| {
                if is_sensitive_key(key) {
                    tracing::debug!("Redacted sensitive key: {}", key);
                    (key.clone(), Value::String(REDACTED.to_string()))
                } else {
                    (key.clone(), self.sanitize(value))
                }
            })
            .collect()
    }

    fn is_sensitive_text(&self, text: &str) -> bool {
        self.patterns.is_match(text) || looks_like_card_number(text)
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_lowercase();
    SENSITIVE_KEYS.iter().any(|k| key.contains(k))
}

/// 13 to 19 digits (ignoring separators) passing the Luhn check.
fn looks_like_card_number(text: &str) -> bool {
    let digits: Vec<u32> = text.chars().filter_map(|c| c.to_digit(10)).collect();
    (13..=19).contains(&digits.len()) && luhn(&digits)
}

fn luhn(digits: &[u32]) -> bool {
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}
