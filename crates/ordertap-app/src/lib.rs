//! Ordertap - order capture agent for delivery apps.
//!
//! This crate provides the pieces the `ordertap` binary wires together:
//!
//! - JSON configuration with command line overrides
//! - HTTP uplink to the order ingestion server
//!
//! # Usage
//!
//! ```ignore
//! use ordertap_app::{AppConfig, HttpUplink};
//!
//! let config = AppConfig::load(None)?;
//! let uplink = HttpUplink::new("http://localhost:3000")?;
//! ```

pub mod config;
pub mod uplink;

pub use config::{project_dirs, AppConfig, ConfigError, RunOverrides};
pub use uplink::{HttpUplink, ORDER_ENDPOINT};
