//! Command-line interface definitions for endpoint-guard.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Endpoint protection agent.
///
/// endpoint-guard applies web blocking, USB device control and upload
/// lockdown policies pushed by the management server, and keeps the
/// operating system converged on them.
#[derive(Parser, Debug)]
#[command(name = "endpoint-guard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run (defaults to `run`).
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to additional config file.
    ///
    /// This config file is merged on top of the system config, giving it
    /// the highest priority after environment overrides.
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Subcommands for endpoint-guard.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the agent until interrupted.
    Run {
        /// Enforce against an in-memory machine instead of the real OS.
        #[arg(long = "dry-run")]
        dry_run: bool,
    },

    /// Report whether a domain is blocked by the local policy.
    #[command(name = "check-site")]
    CheckSite {
        /// Domain to check.
        domain: String,
    },

    /// Undo every enforcement side effect and exit.
    ///
    /// Removes the hosts block and firewall rules, re-enables USB storage
    /// and file dialogs. Use this to recover a machine after a crash.
    Restore,

    /// Print the merged configuration.
    #[command(name = "show-config")]
    ShowConfig,

    /// List every USB storage device this machine has recorded, as JSON.
    #[command(name = "usb-history")]
    UsbHistory,
}

impl Cli {
    /// The subcommand to run, `run` when none was given.
    pub fn command(&self) -> Commands {
        self.command
            .clone()
            .unwrap_or(Commands::Run { dry_run: false })
    }
}
