//! Ordertap Core - order model, delivery app registry and payload parsing.
//!
//! This crate knows nothing about sockets or TLS. It turns captured response
//! bodies into [`NormalizedOrder`] records and defines the [`OrderUplink`]
//! boundary those records are handed to.
//!
//! ## Modules
//!
//! - [`apps`]: bundled delivery apps and hostname dispatch
//! - [`parser`]: JSON body to order extraction
//! - [`redact`]: removal of credentials and payment data
//! - [`uplink`]: consumer trait for extracted orders

pub mod apps;
mod error;
pub mod order;
pub mod parser;
pub mod redact;
pub mod uplink;

pub use apps::{bundled_apps, domain_matches, normalize_host, AppProfile, AppRegistry, FieldTable};
pub use error::{CoreError, Result};
pub use order::{InterceptedExchange, NormalizedOrder, UNKNOWN};
pub use parser::ApplicationParser;
pub use redact::{SensitiveDataFilter, REDACTED};
pub use uplink::{LoggingUplink, OrderUplink};
