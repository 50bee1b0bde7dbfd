//! Upload lockdown controller.
//!
//! While locked, file-selection dialogs are disabled by policy, browsers are
//! restarted so they pick the policy up, browser traffic is fenced by
//! firewall rules, and a window monitor closes any file dialog that opens
//! regardless. A temporary unlock exposes one approved file through the
//! gateway folder and re-enables dialogs until the grant lapses.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use super::dialog::{dialog_policy_in_place, is_file_dialog, set_dialog_policy};
use super::error::UnlockError;
use super::gateway::{default_gateway_dir, file_sha256, Gateway, UnlockGrant};
use super::UPLOAD_RULE_PREFIX;
use crate::config::{millis_or, secs_or, Config};
use crate::network::firewall::resolve_all;
use crate::os::{FirewallCommand, FirewallRule, OsAdapter, RuleAction, RuleTarget};
use crate::policy::{normalize_domain, normalize_hash, PolicySnapshot, PolicyState};
use crate::telemetry::{AuditEvent, AuditLogger};
use crate::workers::{shutdown_signalled, Workers};

/// Lockdown state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadLockState {
    /// Uploads are allowed.
    Unlocked,
    /// Uploads are blocked.
    Locked,
    /// Uploads are blocked, but an unlock grant is outstanding.
    TempUnlocked,
}

/// Tuning for the upload controller.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Browser executables fenced while locked.
    pub browsers: Vec<PathBuf>,
    /// Gateway folder.
    pub gateway_dir: PathBuf,
    /// Grant length when the request names none.
    pub unlock_duration: Duration,
    /// Window monitor interval.
    pub window_poll: Duration,
    /// Grant expiry check interval.
    pub expiry_check: Duration,
    /// Windows of this process are never closed.
    pub own_pid: u32,
    /// How long `stop()` waits for each task.
    pub stop_timeout: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            browsers: Vec::new(),
            gateway_dir: default_gateway_dir(),
            unlock_duration: Duration::from_secs(45),
            window_poll: Duration::from_millis(250),
            expiry_check: Duration::from_secs(1),
            own_pid: std::process::id(),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl UploadOptions {
    /// Build options from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        let uploads = &config.uploads;
        Self {
            browsers: uploads.browsers.iter().map(PathBuf::from).collect(),
            gateway_dir: if uploads.gateway_dir.is_empty() {
                defaults.gateway_dir
            } else {
                PathBuf::from(&uploads.gateway_dir)
            },
            unlock_duration: secs_or(uploads.unlock_duration_secs, defaults.unlock_duration),
            window_poll: millis_or(uploads.window_poll_ms, defaults.window_poll),
            expiry_check: millis_or(uploads.expiry_check_ms, defaults.expiry_check),
            own_pid: defaults.own_pid,
            stop_timeout: config.agent.stop_timeout(),
        }
    }
}

#[derive(Default)]
struct UploadState {
    block_all: bool,
    whitelist: BTreeSet<String>,
    approved: BTreeSet<String>,
    grant: Option<UnlockGrant>,
    /// The last dialog policy write failed and must be retried.
    dialogs_pending: bool,
}

impl UploadState {
    fn lock_state(&self, now: DateTime<Utc>) -> UploadLockState {
        if !self.block_all {
            UploadLockState::Unlocked
        } else if self.grant.as_ref().is_some_and(|g| !g.is_expired(now)) {
            UploadLockState::TempUnlocked
        } else {
            UploadLockState::Locked
        }
    }
}

/// Enforces the upload part of the policy.
pub struct UploadPolicyController {
    os: Arc<dyn OsAdapter>,
    audit: Arc<AuditLogger>,
    options: UploadOptions,
    gateway: Gateway,
    state: Mutex<UploadState>,
    workers: Mutex<Option<Workers>>,
}

impl UploadPolicyController {
    /// Create a stopped, unlocked controller.
    pub fn new(os: Arc<dyn OsAdapter>, audit: Arc<AuditLogger>, options: UploadOptions) -> Self {
        let gateway = Gateway::new(options.gateway_dir.clone());
        Self {
            os,
            audit,
            options,
            gateway,
            state: Mutex::new(UploadState::default()),
            workers: Mutex::new(None),
        }
    }

    /// Current lockdown state.
    pub async fn lock_state(&self) -> UploadLockState {
        self.state.lock().await.lock_state(Utc::now())
    }

    /// The outstanding grant, if any.
    pub async fn grant(&self) -> Option<UnlockGrant> {
        self.state.lock().await.grant.clone()
    }

    /// Gateway folder.
    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Replace the approved-hash set.
    pub async fn set_approved_hashes<I, S>(&self, hashes: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let approved: BTreeSet<String> = hashes
            .into_iter()
            .filter_map(|h| normalize_hash(h.as_ref()))
            .collect();
        let mut state = self.state.lock().await;
        if state.approved != approved {
            debug!("{} approved file hash(es)", approved.len());
            state.approved = approved;
        }
    }

    /// Update lockdown settings.
    ///
    /// Enforcement runs only when `block_all` changes, or when the whitelist
    /// changes while locked. Returns whether it ran.
    pub async fn set_config<I, S>(&self, block_all: bool, whitelist: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let whitelist: BTreeSet<String> = whitelist
            .into_iter()
            .filter_map(|d| normalize_domain(d.as_ref()))
            .collect();

        let mut state = self.state.lock().await;
        let lock_changed = state.block_all != block_all;
        let whitelist_changed = state.whitelist != whitelist;
        state.block_all = block_all;
        state.whitelist = whitelist;

        if !lock_changed && !(whitelist_changed && block_all) {
            return false;
        }

        info!(
            "Upload lockdown {} ({} whitelisted domain(s))",
            if block_all { "enabled" } else { "disabled" },
            state.whitelist.len()
        );
        self.enforce(&mut state).await;
        if !block_all {
            state.grant = None;
            if let Err(e) = self.gateway.purge().await {
                warn!("Failed to purge upload gateway: {}", e);
            }
        }
        self.audit.log(AuditEvent::UploadLockChanged {
            locked: block_all,
            whitelist_size: state.whitelist.len(),
        });
        true
    }

    /// Apply the snapshot's upload section.
    pub async fn apply_policy(&self, snapshot: &PolicySnapshot) {
        self.set_approved_hashes(&snapshot.approved_file_hashes).await;
        self.set_config(snapshot.upload_block_all, &snapshot.upload_whitelist)
            .await;
    }

    /// Expose one approved file and re-enable file dialogs for `duration`
    /// (the configured default when `None`).
    ///
    /// Returns `Ok(None)` without side effects when uploads are not locked.
    /// The hash must be approved and must match the file's content; rejected
    /// requests touch nothing on disk.
    pub async fn request_temporary_unlock(
        &self,
        file_path: &Path,
        file_hash: &str,
        duration: Option<Duration>,
    ) -> Result<Option<UnlockGrant>, UnlockError> {
        let mut state = self.state.lock().await;
        if !state.block_all {
            debug!("Uploads not locked; unlock request is a no-op");
            return Ok(None);
        }

        match self.prepare_unlock(&state, file_path, file_hash).await {
            Ok((hash, gateway_path)) => {
                self.write_dialog_policy(&mut state, true).await;
                self.refresh_policy().await;

                let duration = duration.unwrap_or(self.options.unlock_duration);
                let created_at = Utc::now();
                let expires_at = created_at
                    + chrono::Duration::from_std(duration)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                let grant = UnlockGrant {
                    file_hash: hash.clone(),
                    gateway_path,
                    created_at,
                    expires_at,
                };

                warn!(
                    "Temporary upload unlock for {} until {}",
                    grant.gateway_path.display(),
                    expires_at
                );
                self.audit.log(AuditEvent::UnlockGranted {
                    file_hash: hash,
                    expires_at,
                });
                state.grant = Some(grant.clone());
                Ok(Some(grant))
            }
            Err(e) => {
                warn!("Unlock rejected: {}", e);
                self.audit.log(AuditEvent::UnlockRejected {
                    file_hash: file_hash.to_string(),
                    reason: e.reason().to_string(),
                });
                Err(e)
            }
        }
    }

    /// End a lapsed grant: purge the gateway and disable dialogs again.
    /// Returns whether a grant ended.
    pub async fn expire_if_due(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().await;
        let due = state.grant.as_ref().is_some_and(|g| g.is_expired(now));
        if !due {
            return false;
        }
        let Some(grant) = state.grant.take() else {
            return false;
        };

        info!("Upload unlock expired; restoring lockdown");
        if let Err(e) = self.gateway.purge().await {
            error!("Failed to purge upload gateway: {}", e);
        }
        if state.block_all {
            self.write_dialog_policy(&mut state, false).await;
            self.refresh_policy().await;
        }
        self.audit.log(AuditEvent::UnlockExpired {
            file_hash: grant.file_hash,
        });
        true
    }

    /// Re-write the dialog policy when the last write failed, or when it no
    /// longer reads back as disabled while locked. Returns whether it was
    /// written.
    pub async fn reconcile_dialogs(&self) -> bool {
        let mut state = self.state.lock().await;
        let locked = state.lock_state(Utc::now()) == UploadLockState::Locked;

        if !state.dialogs_pending {
            if !locked {
                return false;
            }
            match dialog_policy_in_place(self.os.as_ref(), false).await {
                Ok(true) => return false,
                Ok(false) => warn!("File dialog policy drifted, re-applying"),
                Err(e) => debug!("Could not verify file dialog policy: {}", e),
            }
        }

        self.write_dialog_policy(&mut state, !locked).await;
        self.refresh_policy().await;
        true
    }

    /// Close every visible file dialog while locked. Returns how many were
    /// closed.
    pub async fn sweep_dialogs(&self) -> usize {
        if self.lock_state().await != UploadLockState::Locked {
            return 0;
        }

        let windows = match self.os.enumerate_windows().await {
            Ok(windows) => windows,
            Err(e) => {
                debug!("Window enumeration failed: {}", e);
                return 0;
            }
        };

        let mut closed = 0;
        for window in windows {
            if !is_file_dialog(&window, self.options.own_pid) {
                continue;
            }
            match self.os.close_window(window.handle).await {
                Ok(()) => {
                    closed += 1;
                    warn!("Blocked file dialog '{}'", window.title);
                    self.audit.log(AuditEvent::DialogBlocked {
                        title: window.title,
                        class_name: window.class_name,
                        process: window.process_name,
                    });
                }
                Err(e) => warn!("Failed to close dialog '{}': {}", window.title, e),
            }
        }
        closed
    }

    /// Start enforcing `policy` and keep following it.
    pub async fn start(self: &Arc<Self>, policy: &PolicyState) {
        let mut running = self.workers.lock().await;
        if running.is_some() {
            debug!("Upload controller already running");
            return;
        }

        self.apply_policy(&policy.current()).await;

        let mut workers = Workers::new();

        let this = self.clone();
        let shutdown_rx = workers.shutdown_rx();
        workers.spawn("upload-windows", async move {
            this.run_window_loop(shutdown_rx).await;
        });

        let this = self.clone();
        let shutdown_rx = workers.shutdown_rx();
        let policy_rx = policy.subscribe();
        workers.spawn("upload-policy", async move {
            this.run_policy_loop(policy_rx, shutdown_rx).await;
        });

        *running = Some(workers);
        info!("Upload controller started");
    }

    /// Stop the loops and fail open: dialogs enabled, upload rules removed,
    /// gateway purged. Safe to call repeatedly, and before `start()`.
    pub async fn stop(&self) {
        if let Some(workers) = self.workers.lock().await.take() {
            workers.stop(self.options.stop_timeout).await;
        }

        let mut state = self.state.lock().await;
        state.block_all = false;
        state.whitelist.clear();
        state.grant = None;
        state.dialogs_pending = false;

        if let Err(e) = set_dialog_policy(self.os.as_ref(), true).await {
            error!("Failed to re-enable file dialogs: {}", e);
        }
        self.clear_rules().await;
        self.refresh_policy().await;
        if let Err(e) = self.gateway.purge().await {
            warn!("Failed to purge upload gateway: {}", e);
        }
        info!("Upload controller stopped");
    }

    async fn prepare_unlock(
        &self,
        state: &UploadState,
        file_path: &Path,
        file_hash: &str,
    ) -> Result<(String, PathBuf), UnlockError> {
        let hash = normalize_hash(file_hash)
            .ok_or_else(|| UnlockError::InvalidHash(file_hash.to_string()))?;
        if !state.approved.contains(&hash) {
            return Err(UnlockError::NotApproved(hash));
        }

        let actual = file_sha256(file_path).await?;
        if actual != hash {
            return Err(UnlockError::HashMismatch {
                expected: hash,
                actual,
            });
        }

        let gateway_path = self.gateway.expose(file_path).await?;
        Ok((hash, gateway_path))
    }

    /// Rebuild the upload rules and set the dialog policy. An outstanding
    /// grant keeps dialogs enabled and browsers running.
    async fn enforce(&self, state: &mut UploadState) {
        self.clear_rules().await;

        if state.block_all {
            if state.lock_state(Utc::now()) == UploadLockState::Locked {
                self.kill_browsers().await;
                self.write_dialog_policy(state, false).await;
            } else {
                debug!("Unlock grant outstanding; dialogs stay enabled");
            }
            self.add_browser_rules().await;
            self.add_whitelist_rules(&state.whitelist).await;
        } else {
            self.write_dialog_policy(state, true).await;
        }

        self.refresh_policy().await;
    }

    async fn write_dialog_policy(&self, state: &mut UploadState, allowed: bool) {
        let result = set_dialog_policy(self.os.as_ref(), allowed).await;
        state.dialogs_pending = result.is_err();
        if let Err(e) = result {
            warn!(
                "Dialog policy not fully {}: {}",
                if allowed { "enabled" } else { "disabled" },
                e
            );
        }
    }

    async fn kill_browsers(&self) {
        let names: BTreeSet<String> = self
            .options
            .browsers
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_lowercase())
            .collect();
        if names.is_empty() {
            return;
        }

        let processes = match self.os.list_processes().await {
            Ok(processes) => processes,
            Err(e) => {
                warn!("Failed to list processes: {}", e);
                return;
            }
        };

        for process in processes {
            if names.contains(&process.name.to_lowercase()) {
                match self.os.kill_process(process.pid).await {
                    Ok(()) => info!("Terminated {} ({})", process.name, process.pid),
                    Err(e) => debug!(
                        "Could not terminate {} ({}): {}",
                        process.name, process.pid, e
                    ),
                }
            }
        }
    }

    async fn add_browser_rules(&self) {
        for (index, browser) in self.options.browsers.iter().enumerate() {
            let file_name = browser
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let rule = FirewallRule {
                name: format!("{}Block_{}_{}", UPLOAD_RULE_PREFIX, index, file_name),
                action: RuleAction::Block,
                target: RuleTarget::Program(browser.clone()),
            };
            if let Err(e) = self.os.run_firewall_command(&FirewallCommand::Add(rule)).await {
                warn!("Failed to fence {}: {}", browser.display(), e);
            }
        }
    }

    async fn add_whitelist_rules(&self, whitelist: &BTreeSet<String>) {
        for domain in whitelist {
            let ips = resolve_all(self.os.as_ref(), domain).await;
            if ips.is_empty() {
                warn!("Whitelisted upload domain {} did not resolve", domain);
                continue;
            }
            let rule = FirewallRule {
                name: format!("{}Allow_{}", UPLOAD_RULE_PREFIX, domain),
                action: RuleAction::Allow,
                target: RuleTarget::RemoteIps(ips),
            };
            if let Err(e) = self.os.run_firewall_command(&FirewallCommand::Add(rule)).await {
                warn!("Failed to allow uploads to {}: {}", domain, e);
            }
        }
    }

    async fn clear_rules(&self) {
        let command = FirewallCommand::DeleteByPrefix {
            prefix: UPLOAD_RULE_PREFIX.to_string(),
        };
        if let Err(e) = self.os.run_firewall_command(&command).await {
            warn!("Failed to clear upload firewall rules: {}", e);
        }
    }

    async fn refresh_policy(&self) {
        if let Err(e) = self.os.refresh_group_policy().await {
            warn!("Group policy refresh failed: {}", e);
        }
    }

    async fn run_window_loop(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut windows = tokio::time::interval(self.options.window_poll);
        windows.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut expiry = tokio::time::interval(self.options.expiry_check);
        expiry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = windows.tick() => {
                    self.sweep_dialogs().await;
                }
                _ = expiry.tick() => {
                    self.expire_if_due(Utc::now()).await;
                    self.reconcile_dialogs().await;
                }
                _ = shutdown_signalled(&mut shutdown_rx) => break,
            }
        }
    }

    async fn run_policy_loop(
        &self,
        mut policy_rx: watch::Receiver<Arc<PolicySnapshot>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = policy_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = policy_rx.borrow_and_update().clone();
                    self.apply_policy(&snapshot).await;
                }
                _ = shutdown_signalled(&mut shutdown_rx) => break,
            }
        }
    }
}
