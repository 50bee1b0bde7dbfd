//! Management-server sync.
//!
//! A heartbeat carries enforcement counters up and may bring a policy
//! document back; the approvals pull fetches the hashes of files cleared for
//! upload. Both fold their result into a new [`PolicySnapshot`] and publish
//! it through [`PolicyState`], so the controllers pick it up on their own.
//!
//! An agent without an API key registers first and keeps retrying on every
//! heartbeat tick until the server issues one.

mod client;
mod error;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

pub use client::{
    DashboardClient, HeartbeatStats, Registration, APPROVED_PATH, HEARTBEAT_PATH, REGISTER_PATH,
};
pub use error::SyncError;

use crate::config::{hostname, secs_or, Config};
use crate::policy::{PolicyDocument, PolicySnapshot, PolicyState};
use crate::telemetry::{AuditEvent, AuditLogger};
use crate::workers::{shutdown_signalled, Workers};

/// Called with a newly issued API key so it can be persisted.
pub type CredentialSink = Box<dyn Fn(&str) + Send + Sync>;

/// Sync intervals.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// Interval between approved-hash pulls.
    pub approvals_interval: Duration,
    /// Request timeout.
    pub http_timeout: Duration,
    /// How long `stop()` waits for the loop.
    pub stop_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            approvals_interval: Duration::from_secs(30),
            http_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl SyncOptions {
    /// Build options from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        let agent = &config.agent;
        Self {
            heartbeat_interval: secs_or(agent.heartbeat_interval_secs, defaults.heartbeat_interval),
            approvals_interval: secs_or(agent.approvals_interval_secs, defaults.approvals_interval),
            http_timeout: secs_or(agent.http_timeout_secs, defaults.http_timeout),
            stop_timeout: agent.stop_timeout(),
        }
    }
}

impl Registration {
    /// Registration details for this machine.
    pub fn for_machine(machine_id: &str) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            hostname: hostname(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            os_version: std::env::consts::OS.to_string(),
        }
    }
}

fn same_policy(current: &PolicySnapshot, next: &PolicySnapshot) -> bool {
    let mut next = next.clone();
    next.version = current.version;
    next == *current
}

/// Pulls policy from the management server into [`PolicyState`].
pub struct PolicySync {
    client: DashboardClient,
    policy: PolicyState,
    audit: Arc<AuditLogger>,
    options: SyncOptions,
    registration: Registration,
    credentials: Option<CredentialSink>,
    workers: Mutex<Option<Workers>>,
}

impl PolicySync {
    /// Create a stopped sync.
    pub fn new(
        client: DashboardClient,
        policy: PolicyState,
        audit: Arc<AuditLogger>,
        options: SyncOptions,
        registration: Registration,
    ) -> Self {
        Self {
            client,
            policy,
            audit,
            options,
            registration,
            credentials: None,
            workers: Mutex::new(None),
        }
    }

    /// Persist API keys issued at registration through `sink`.
    pub fn with_credential_sink(mut self, sink: CredentialSink) -> Self {
        self.credentials = Some(sink);
        self
    }

    /// Register unless an API key is already set.
    pub async fn ensure_registered(&self) -> Result<(), SyncError> {
        if self.client.is_registered().await {
            return Ok(());
        }

        info!("Registering with management server");
        let api_key = self.client.register(&self.registration).await?;
        if let Some(sink) = &self.credentials {
            sink(&api_key);
        }
        info!("Agent registered");
        Ok(())
    }

    /// Counters reported with the next heartbeat.
    pub fn stats(&self) -> HeartbeatStats {
        let snapshot = self.policy.current();
        HeartbeatStats {
            policy_version: snapshot.version,
            blocked_domains: snapshot.effective_blocked_domains().len(),
            usb_mode: snapshot.usb_mode.to_string(),
            uploads_locked: snapshot.upload_block_all,
            approved_hashes: snapshot.approved_file_hashes.len(),
        }
    }

    /// Fold a pushed policy document into the state.
    ///
    /// Returns the published version, or `None` if nothing changed.
    pub fn apply_document(&self, value: &Value) -> Option<u64> {
        let document = PolicyDocument::from_value(value);
        if !document.rejected.is_empty() {
            warn!("Rejected policy section(s): {}", document.rejected.join(", "));
        }
        if document.is_empty() {
            debug!("Pushed policy has no applicable section");
            return None;
        }

        let current = self.policy.current();
        if same_policy(&current, &current.with_document(&document)) {
            debug!("Pushed policy matches current policy");
            return None;
        }

        let published = self.policy.update(|current| current.with_document(&document));
        info!("Applied policy version {}", published.version);
        self.audit.log(AuditEvent::PolicyApplied {
            version: published.version,
            rejected: document.rejected.iter().map(|s| s.to_string()).collect(),
        });
        Some(published.version)
    }

    /// Replace the approved-hash set.
    ///
    /// Returns the published version, or `None` if nothing changed.
    pub fn apply_approved(&self, hashes: &[String]) -> Option<u64> {
        let current = self.policy.current();
        if same_policy(&current, &current.with_approved_hashes(hashes)) {
            return None;
        }

        let published = self
            .policy
            .update(|current| current.with_approved_hashes(hashes));
        info!(
            "Synced {} approved file hash(es)",
            published.approved_file_hashes.len()
        );
        Some(published.version)
    }

    /// Send one heartbeat and apply any pushed policy.
    pub async fn heartbeat_once(&self) -> Result<Option<u64>, SyncError> {
        self.ensure_registered().await?;
        match self.client.heartbeat(&self.stats()).await? {
            Some(config) => Ok(self.apply_document(&config)),
            None => Ok(None),
        }
    }

    /// Pull approved hashes once.
    pub async fn approvals_once(&self) -> Result<Option<u64>, SyncError> {
        if !self.client.is_registered().await {
            return Err(SyncError::NotRegistered);
        }
        let hashes = self.client.approved_hashes().await?;
        Ok(self.apply_approved(&hashes))
    }

    /// Start the sync loop.
    pub async fn start(self: &Arc<Self>) {
        let mut running = self.workers.lock().await;
        if running.is_some() {
            return;
        }

        let mut workers = Workers::new();
        let this = self.clone();
        let shutdown_rx = workers.shutdown_rx();
        workers.spawn("policy-sync", async move {
            this.run(shutdown_rx).await;
        });
        *running = Some(workers);
        info!("Policy sync started");
    }

    /// Stop the sync loop. Safe to call repeatedly.
    pub async fn stop(&self) {
        if let Some(workers) = self.workers.lock().await.take() {
            workers.stop(self.options.stop_timeout).await;
            info!("Policy sync stopped");
        }
    }

    async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut heartbeat = tokio::time::interval(self.options.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut approvals = tokio::time::interval(self.options.approvals_interval);
        approvals.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = self.heartbeat_once().await {
                        warn!("Heartbeat failed: {}", e);
                    }
                }
                _ = approvals.tick() => {
                    match self.approvals_once().await {
                        Ok(_) => {}
                        Err(SyncError::NotRegistered) => {
                            debug!("Skipping approvals sync; not registered")
                        }
                        Err(e) => debug!("Could not sync approvals: {}", e),
                    }
                }
                _ = shutdown_signalled(&mut shutdown_rx) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::UsbMode;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const HASH: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[derive(Debug, Clone)]
    struct Recorded {
        method: String,
        path: String,
        api_key: Option<String>,
        body: String,
    }

    /// A minimal HTTP/1.1 server answering each path with a fixed response.
    struct FakeServer {
        addr: SocketAddr,
        requests: Arc<StdMutex<Vec<Recorded>>>,
    }

    impl FakeServer {
        async fn start(routes: &[(&str, u16, &str)]) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let requests = Arc::new(StdMutex::new(Vec::new()));
            let routes: Arc<HashMap<String, (u16, String)>> = Arc::new(
                routes
                    .iter()
                    .map(|(path, status, body)| (path.to_string(), (*status, body.to_string())))
                    .collect(),
            );

            let recorded = requests.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    let routes = routes.clone();
                    let recorded = recorded.clone();
                    tokio::spawn(async move {
                        handle(stream, &routes, &recorded).await;
                    });
                }
            });

            Self { addr, requests }
        }

        fn url(&self) -> String {
            format!("http://{}", self.addr)
        }

        fn requests(&self) -> Vec<Recorded> {
            self.requests.lock().unwrap().clone()
        }
    }

    async fn handle(
        mut stream: tokio::net::TcpStream,
        routes: &HashMap<String, (u16, String)>,
        recorded: &StdMutex<Vec<Recorded>>,
    ) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let mut lines = head.lines();
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let path = parts.next().unwrap_or_default().to_string();

        let mut content_length = 0;
        let mut api_key = None;
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                let name = name.trim().to_ascii_lowercase();
                if name == "content-length" {
                    content_length = value.trim().parse().unwrap_or(0);
                } else if name == "x-api-key" {
                    api_key = Some(value.trim().to_string());
                }
            }
        }

        while buf.len() < header_end + content_length {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let body = String::from_utf8_lossy(&buf[header_end..]).to_string();

        recorded.lock().unwrap().push(Recorded {
            method,
            path: path.clone(),
            api_key,
            body,
        });

        let (status, body) = routes
            .get(&path)
            .cloned()
            .unwrap_or((404, "{}".to_string()));
        let response = format!(
            "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.shutdown().await;
    }

    fn sync(server: &FakeServer, api_key: &str, policy: &PolicyState) -> PolicySync {
        let client =
            DashboardClient::new(&server.url(), api_key, Duration::from_secs(5)).unwrap();
        PolicySync::new(
            client,
            policy.clone(),
            Arc::new(AuditLogger::new_null()),
            SyncOptions {
                heartbeat_interval: Duration::from_millis(50),
                approvals_interval: Duration::from_millis(50),
                stop_timeout: Duration::from_secs(1),
                ..Default::default()
            },
            Registration::for_machine("WS-0042-abcd1234"),
        )
    }

    #[tokio::test]
    async fn test_heartbeat_applies_pushed_policy() {
        let server = FakeServer::start(&[(
            HEARTBEAT_PATH,
            200,
            r#"{"config": {"network": {"blocked_sites": ["Facebook.com"]}, "usb": {"mode": "block"}}}"#,
        )])
        .await;
        let policy = PolicyState::new(PolicySnapshot::default());
        let sync = sync(&server, "key-1", &policy);

        assert_eq!(sync.heartbeat_once().await.unwrap(), Some(1));
        let current = policy.current();
        assert!(current.blocked_domains.contains("facebook.com"));
        assert_eq!(current.usb_mode, UsbMode::Block);

        let requests = server.requests();
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].path, HEARTBEAT_PATH);
        assert_eq!(requests[0].api_key.as_deref(), Some("key-1"));
        let body: Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(body["status"], "online");
        assert_eq!(body["stats"]["policy_version"], 0);

        // Same document again publishes nothing
        assert_eq!(sync.heartbeat_once().await.unwrap(), None);
        assert_eq!(policy.current().version, 1);
    }

    #[tokio::test]
    async fn test_empty_config_is_ignored() {
        let server = FakeServer::start(&[(HEARTBEAT_PATH, 200, r#"{"config": {}}"#)]).await;
        let policy = PolicyState::new(PolicySnapshot::default());
        let sync = sync(&server, "key-1", &policy);

        assert_eq!(sync.heartbeat_once().await.unwrap(), None);
        assert_eq!(policy.current().version, 0);
    }

    #[tokio::test]
    async fn test_rejected_section_keeps_previous() {
        let server = FakeServer::start(&[(
            HEARTBEAT_PATH,
            200,
            r#"{"config": {"usb": {"mode": "lockdown"}, "uploads": {"block_all": true}}}"#,
        )])
        .await;
        let policy = PolicyState::new(PolicySnapshot::default());
        let sync = sync(&server, "key-1", &policy);

        assert_eq!(sync.heartbeat_once().await.unwrap(), Some(1));
        let current = policy.current();
        assert_eq!(current.usb_mode, UsbMode::Monitor);
        assert!(current.upload_block_all);
    }

    #[tokio::test]
    async fn test_registers_before_first_heartbeat() {
        let server = FakeServer::start(&[
            (REGISTER_PATH, 201, r#"{"api_key": "issued-key"}"#),
            (HEARTBEAT_PATH, 200, r#"{}"#),
        ])
        .await;
        let policy = PolicyState::new(PolicySnapshot::default());
        let saved = Arc::new(StdMutex::new(None));
        let sink_saved = saved.clone();
        let sync = sync(&server, "", &policy).with_credential_sink(Box::new(move |key| {
            *sink_saved.lock().unwrap() = Some(key.to_string());
        }));

        assert_eq!(sync.heartbeat_once().await.unwrap(), None);
        assert_eq!(saved.lock().unwrap().as_deref(), Some("issued-key"));

        let requests = server.requests();
        assert_eq!(requests[0].path, REGISTER_PATH);
        let body: Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(body["machine_id"], "WS-0042-abcd1234");
        assert_eq!(requests[1].api_key.as_deref(), Some("issued-key"));
    }

    #[tokio::test]
    async fn test_approvals_sync() {
        let body = format!(r#"{{"approved_hashes": ["{}", "not-a-hash"]}}"#, HASH.to_uppercase());
        let server = FakeServer::start(&[(APPROVED_PATH, 200, body.as_str())]).await;
        let policy = PolicyState::new(PolicySnapshot::default());
        let sync = sync(&server, "key-1", &policy);

        assert_eq!(sync.approvals_once().await.unwrap(), Some(1));
        assert!(policy.current().is_hash_approved(HASH));
        assert_eq!(policy.current().approved_file_hashes.len(), 1);
        assert_eq!(sync.approvals_once().await.unwrap(), None);
        assert_eq!(server.requests()[0].method, "GET");
    }

    #[tokio::test]
    async fn test_approvals_require_registration() {
        let server = FakeServer::start(&[]).await;
        let policy = PolicyState::new(PolicySnapshot::default());
        let sync = sync(&server, "", &policy);

        assert!(matches!(
            sync.approvals_once().await,
            Err(SyncError::NotRegistered)
        ));
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn test_server_error_surfaces_status() {
        let server = FakeServer::start(&[(HEARTBEAT_PATH, 500, r#"{"detail": "boom"}"#)]).await;
        let policy = PolicyState::new(PolicySnapshot::default());
        let sync = sync(&server, "key-1", &policy);

        match sync.heartbeat_once().await {
            Err(SyncError::Status { status, body, .. }) => {
                assert_eq!(status, 500);
                assert!(body.contains("boom"));
            }
            other => panic!("expected status error, got {:?}", other),
        }
        assert_eq!(policy.current().version, 0);
    }

    #[tokio::test]
    async fn test_loop_publishes_and_stops() {
        let server = FakeServer::start(&[
            (
                HEARTBEAT_PATH,
                200,
                r#"{"config": {"uploads": {"block_all": true}}}"#,
            ),
            (APPROVED_PATH, 200, r#"{"approved_hashes": []}"#),
        ])
        .await;
        let policy = PolicyState::new(PolicySnapshot::default());
        let sync = Arc::new(sync(&server, "key-1", &policy));

        sync.start().await;
        for _ in 0..50 {
            if policy.current().upload_block_all {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(policy.current().upload_block_all);

        sync.stop().await;
        sync.stop().await;
    }

    #[test]
    fn test_options_from_config() {
        let options = SyncOptions::from_config(&Config::embedded().unwrap());
        assert_eq!(options.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(options.approvals_interval, Duration::from_secs(30));
        assert_eq!(options.http_timeout, Duration::from_secs(10));
    }
}
