//! Ordertap - captures delivery app orders through a local intercepting proxy.
//!
//! Runs the proxy on 127.0.0.1, exports the root CA for installation on the
//! device, and lists the intercepted domains.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ordertap_app::{project_dirs, AppConfig, HttpUplink, RunOverrides};
use ordertap_core::{LoggingUplink, OrderUplink};
use ordertap_proxy::{CertificateAuthority, ProxyConfig, ProxyServer};

/// Ordertap - order capture agent for delivery apps
#[derive(Parser, Debug)]
#[command(name = "ordertap", version, about)]
struct Args {
    /// Config file (defaults to the user config directory)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Root CA directory
    #[arg(long, global = true, value_name = "DIR")]
    ca_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy (default)
    Run(RunOverrides),

    /// Write the root CA certificate as PEM
    ExportCa {
        /// Output file (stdout if omitted)
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },

    /// Print the intercepted domains
    Domains,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging with file rotation.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ordertap={},warn", log_level)));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("ordertap")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                // Console on stderr so `export-ca` can write PEM to stdout.
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::debug!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

fn open_authority(config: &AppConfig) -> anyhow::Result<Arc<CertificateAuthority>> {
    let ca_dir = config.ca_dir()?;
    let authority = CertificateAuthority::initialize(&ca_dir)
        .with_context(|| format!("Failed to initialize CA in {:?}", ca_dir))?;
    Ok(Arc::new(authority))
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let authority = open_authority(&config)?;
    let registry = config.registry();

    let uplink: Arc<dyn OrderUplink> = match &config.server_url {
        Some(url) => {
            let uplink = HttpUplink::new(url).context("Failed to create HTTP client")?;
            tracing::info!("Submitting orders to {}", uplink.endpoint());
            Arc::new(uplink)
        }
        None => {
            tracing::info!("No server URL configured, orders are only logged");
            Arc::new(LoggingUplink)
        }
    };

    let proxy_config = ProxyConfig::new(Arc::clone(&authority))
        .with_port(config.port)
        .with_allow_list(config.allow_list())
        .with_registry(registry)
        .with_uplink(uplink)
        .with_upstream_trust(config.upstream_trust()?)
        .with_idle_timeout(config.idle_timeout())
        .with_capture_limit(config.capture_limit)
        .with_redaction(config.redact);

    let handle = ProxyServer::new(proxy_config).start().await?;
    tracing::info!(
        "Proxy ready on {}. Install {:?} as a trusted root on the device.",
        handle.addr(),
        authority.cert_path()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    tracing::info!("Stopping proxy ({} active connections)", handle.active_connections());
    handle.stop().await;
    Ok(())
}

fn export_ca(config: &AppConfig, out: Option<PathBuf>) -> anyhow::Result<()> {
    let authority = open_authority(config)?;
    match out {
        Some(path) => {
            authority
                .export_root_pem_to(&path)
                .with_context(|| format!("Failed to write {:?}", path))?;
            tracing::info!("Root CA written to {:?}", path);
        }
        None => print!("{}", authority.export_root_pem()),
    }
    Ok(())
}

fn print_domains(config: &AppConfig) {
    for domain in config.allow_list().domains() {
        println!("{}", domain);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep the guard alive for the duration of the program
    let _log_guard = init_logging(&args);

    tracing::debug!("Args: {:?}", args);

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(dir) = &args.ca_dir {
        config.ca_dir = Some(dir.clone());
    }

    match args.command {
        None => run(config).await,
        Some(Command::Run(overrides)) => {
            config.apply(&overrides);
            run(config).await
        }
        Some(Command::ExportCa { out }) => export_ca(&config, out),
        Some(Command::Domains) => {
            print_domains(&config);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn run_is_the_default() {
        let args = Args::parse_from(["ordertap", "--debug"]);
        assert!(args.command.is_none());
        assert!(args.debug);
    }

    #[test]
    fn run_flags_parse() {
        let args = Args::parse_from([
            "ordertap",
            "run",
            "--port",
            "9000",
            "--domain",
            "a.example",
            "--domain",
            "b.example",
            "--no-redact",
        ]);
        let Some(Command::Run(overrides)) = args.command else {
            panic!("expected run");
        };
        assert_eq!(overrides.port, Some(9000));
        assert_eq!(overrides.domains, vec!["a.example", "b.example"]);
        assert!(overrides.no_redact);
    }

    #[test]
    fn global_flags_after_subcommand() {
        let args = Args::parse_from(["ordertap", "export-ca", "--ca-dir", "/tmp/ca", "--out", "ca.pem"]);
        assert_eq!(args.ca_dir, Some(PathBuf::from("/tmp/ca")));
        assert!(matches!(args.command, Some(Command::ExportCa { out: Some(_) })));
    }
}
