//! Agent lifecycle.
//!
//! Builds the controllers around one OS adapter and one policy state,
//! starts them, and on shutdown stops every one of them so that no
//! enforcement side effect outlives the process.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::{Config, ConfigLoader};
use crate::network::{NetworkOptions, NetworkPolicyController};
use crate::os::OsAdapter;
use crate::policy::PolicyState;
use crate::sync::{DashboardClient, PolicySync, Registration, SyncOptions};
use crate::telemetry::{AuditEvent, AuditLogger};
use crate::upload::{UploadOptions, UploadPolicyController};
use crate::usb::{UsbOptions, UsbPolicyController};

/// The three controllers, the shared policy, and the optional server sync.
pub struct Agent {
    machine_id: String,
    audit: Arc<AuditLogger>,
    policy: PolicyState,
    network: Arc<NetworkPolicyController>,
    usb: Arc<UsbPolicyController>,
    uploads: Arc<UploadPolicyController>,
    sync: Option<Arc<PolicySync>>,
    started_at: Instant,
}

impl Agent {
    /// Build stopped controllers for `config`. The policy starts from the
    /// local configuration.
    pub fn new(config: &Config, os: Arc<dyn OsAdapter>, audit: Arc<AuditLogger>) -> Self {
        let policy = PolicyState::new(config.initial_policy());
        Self {
            machine_id: config.agent.machine_id.clone(),
            network: Arc::new(NetworkPolicyController::new(
                os.clone(),
                audit.clone(),
                NetworkOptions::from_config(config),
            )),
            usb: Arc::new(UsbPolicyController::new(
                os.clone(),
                audit.clone(),
                UsbOptions::from_config(config),
            )),
            uploads: Arc::new(UploadPolicyController::new(
                os,
                audit.clone(),
                UploadOptions::from_config(config),
            )),
            audit,
            policy,
            sync: None,
            started_at: Instant::now(),
        }
    }

    /// Attach a management-server sync feeding this agent's policy.
    pub fn with_sync(mut self, sync: PolicySync) -> Self {
        self.sync = Some(Arc::new(sync));
        self
    }

    /// The shared policy state.
    pub fn policy(&self) -> &PolicyState {
        &self.policy
    }

    /// Network controller.
    pub fn network(&self) -> &Arc<NetworkPolicyController> {
        &self.network
    }

    /// USB controller.
    pub fn usb(&self) -> &Arc<UsbPolicyController> {
        &self.usb
    }

    /// Upload controller.
    pub fn uploads(&self) -> &Arc<UploadPolicyController> {
        &self.uploads
    }

    /// Start every controller, then the sync.
    pub async fn start(&self) {
        info!("Starting endpoint-guard agent ({})", self.machine_id);
        self.audit.log(AuditEvent::AgentStart {
            machine_id: self.machine_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
        });

        self.network.start(&self.policy).await;
        self.usb.start(&self.policy).await;
        self.uploads.start(&self.policy).await;
        if let Some(sync) = &self.sync {
            sync.start().await;
        }
    }

    /// Stop the sync, then every controller. Each controller's `stop()`
    /// runs even if `start()` never did.
    pub async fn stop(&self) {
        if let Some(sync) = &self.sync {
            sync.stop().await;
        }

        self.uploads.stop().await;
        self.usb.stop().await;
        self.network.stop().await;

        let uptime = self.started_at.elapsed().as_secs();
        self.audit.log(AuditEvent::AgentStop {
            machine_id: self.machine_id.clone(),
            uptime_sec: uptime,
        });
        info!("Agent stopped after {}s", uptime);
    }

    /// Start, wait for `shutdown`, stop.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        self.start().await;
        shutdown.await;
        info!("Shutdown requested");
        self.stop().await;
    }
}

/// Build the management-server sync, or `None` when no server is configured.
pub fn build_sync(
    config: &Config,
    loader: ConfigLoader,
    policy: &PolicyState,
    audit: Arc<AuditLogger>,
) -> Result<Option<PolicySync>> {
    if config.agent.dashboard_url.is_empty() {
        warn!("No dashboard_url configured; running on local policy only");
        return Ok(None);
    }

    let options = SyncOptions::from_config(config);
    let client = DashboardClient::new(
        &config.agent.dashboard_url,
        &config.agent.api_key,
        options.http_timeout,
    )
    .context("Failed to create management-server client")?;

    let saved_config = config.clone();
    let sync = PolicySync::new(
        client,
        policy.clone(),
        audit,
        options,
        Registration::for_machine(&config.agent.machine_id),
    )
    .with_credential_sink(Box::new(move |api_key| {
        if let Err(e) = loader.save_credentials(&saved_config, api_key) {
            warn!("Could not save credentials: {}", e);
        }
    }));
    Ok(Some(sync))
}

/// Run the agent until Ctrl+C.
pub async fn run(
    config: &Config,
    loader: ConfigLoader,
    os: Arc<dyn OsAdapter>,
    audit: Arc<AuditLogger>,
) -> Result<()> {
    let mut agent = Agent::new(config, os, audit.clone());
    if let Some(sync) = build_sync(config, loader, agent.policy(), audit)? {
        agent = agent.with_sync(sync);
    }

    agent
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;
    Ok(())
}

/// Reverse every enforcement side effect without starting anything.
pub async fn restore(config: &Config, os: Arc<dyn OsAdapter>, audit: Arc<AuditLogger>) {
    info!("Restoring machine state");
    let agent = Agent::new(config, os, audit);
    agent.uploads.stop().await;
    agent.usb.stop().await;
    agent.network.stop().await;
}
