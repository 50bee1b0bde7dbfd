//! endpoint-guard: endpoint protection agent
//!
//! Entry point for the agent binary. Parses the CLI, loads the merged
//! configuration, sets up diagnostics and audit logging, and dispatches
//! to the requested command.
//!
//! # Logging
//!
//! - **Audit events** go to syslog through [`AuditLogger`]
//! - **Diagnostics** go to stderr through `tracing`, filtered by `-v`

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use endpoint_guard::{
    agent,
    cli::{Cli, Commands},
    config::{Config, ConfigLoader},
    network,
    os::{self, MemoryOs, OsAdapter},
    policy::normalize_domain,
    telemetry::AuditLogger,
    usb::{UsbOptions, UsbPolicyController},
};
use tracing::{debug, info, warn};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;
    debug!("Parsed CLI arguments: {:?}", cli);

    let loader = ConfigLoader::new();
    let config = loader.load(&cli).context("Failed to load configuration")?;
    debug!("Loaded configuration: {:?}", config);

    match cli.command() {
        Commands::ShowConfig => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered);
            Ok(())
        }
        Commands::CheckSite { domain } => check_site(&config, &domain),
        Commands::Restore => {
            let os = os::system(config.os_options()).context("Failed to open the OS adapter")?;
            runtime()?.block_on(agent::restore(&config, os, audit_logger(&config)));
            println!("Machine state restored.");
            Ok(())
        }
        Commands::UsbHistory => {
            let os = os::system(config.os_options()).context("Failed to open the OS adapter")?;
            let usb = UsbPolicyController::new(
                os,
                Arc::new(AuditLogger::new_null()),
                UsbOptions::from_config(&config),
            );
            let history = runtime()?
                .block_on(usb.device_history())
                .context("Failed to read USB device history")?;
            let rendered = serde_json::to_string_pretty(&history)
                .context("Failed to render USB device history")?;
            println!("{}", rendered);
            Ok(())
        }
        Commands::Run { dry_run } => {
            let os = if dry_run {
                dry_run_os(&config)
            } else {
                os::system(config.os_options()).context("Failed to open the OS adapter")?
            };
            let audit = audit_logger(&config);
            runtime()?.block_on(agent::run(&config, loader, os, audit))
        }
    }
}

fn check_site(config: &Config, raw: &str) -> Result<()> {
    let Some(domain) = normalize_domain(raw) else {
        anyhow::bail!("'{}' is not a valid domain", raw);
    };
    let blocked = config.initial_policy().effective_blocked_domains();
    if network::is_blocked(&blocked, &domain) {
        println!("{} is BLOCKED", domain);
    } else {
        println!("{} is allowed", domain);
    }
    Ok(())
}

/// An in-memory machine seeded with the current hosts file.
fn dry_run_os(config: &Config) -> Arc<dyn OsAdapter> {
    let hosts = std::fs::read_to_string(&config.os_options().hosts_path).unwrap_or_default();
    info!("Dry run: enforcing against an in-memory machine");
    Arc::new(MemoryOs::with_hosts(&hosts))
}

fn audit_logger(config: &Config) -> Arc<AuditLogger> {
    match AuditLogger::from_config(&config.telemetry) {
        Ok(logger) => Arc::new(logger),
        Err(e) => {
            warn!("Audit logging disabled: {}", e);
            Arc::new(AuditLogger::new_null())
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")
}

/// Initialize the tracing subscriber for diagnostic logging.
///
/// This is separate from the audit trail which goes to syslog.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, or warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
