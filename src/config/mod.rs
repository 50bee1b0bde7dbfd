//! Configuration system for endpoint-guard.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//! Local configuration seeds the first policy snapshot and tunes the
//! enforcement loops; the management server owns policy afterwards.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults (`config/default.toml`)
//! 2. System config: `%ProgramData%\EndpointGuard\config.toml`
//! 3. Additional config file (via `--config` flag)
//! 4. Saved credentials from registration
//! 5. Environment (`ENDPOINT_GUARD_DASHBOARD_URL`, `ENDPOINT_GUARD_API_KEY`)
//!
//! # Merge Behavior
//!
//! - **Lists** (blocked_sites, whitelist, browsers) are **merged** (appended)
//! - **Scalars** (intervals, URLs, modes) are **overridden**
//!
//! ```toml
//! [network]
//! blocked_categories = ["social_media"]
//! blocking_method = "dns_proxy"
//!
//! [usb]
//! mode = "whitelist"
//! whitelist = [{ vid = "0781", pid = "5567" }]
//! ```

pub mod categories;
mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{ConfigLoader, ENV_API_KEY, ENV_DASHBOARD_URL};
pub use schema::{
    AgentConfig, Config, NetworkConfig, TelemetryConfig, UploadsConfig, UsbConfig,
    DEFAULT_CONFIG,
};
pub(crate) use loader::hostname;
pub(crate) use schema::{millis_or, secs_or};
