//! HTTP client for the management server.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use super::error::SyncError;

/// Heartbeat path.
pub const HEARTBEAT_PATH: &str = "/api/v1/agent/heartbeat";
/// Approved upload hashes path.
pub const APPROVED_PATH: &str = "/api/v1/agent/uploads/approved";
/// Registration path.
pub const REGISTER_PATH: &str = "/api/v1/endpoints/register";

const API_KEY_HEADER: &str = "X-API-Key";
const MAX_ERROR_BODY: usize = 512;

/// Enforcement counters reported with every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HeartbeatStats {
    /// Version of the applied policy.
    pub policy_version: u64,
    /// Number of effectively blocked domains.
    pub blocked_domains: usize,
    /// Current USB mode.
    pub usb_mode: String,
    /// Whether uploads are locked down.
    pub uploads_locked: bool,
    /// Number of approved upload hashes.
    pub approved_hashes: usize,
}

#[derive(Serialize)]
struct HeartbeatRequest<'a> {
    status: &'static str,
    stats: &'a HeartbeatStats,
}

#[derive(Deserialize)]
struct HeartbeatResponse {
    #[serde(default)]
    config: Option<Value>,
}

#[derive(Deserialize)]
struct ApprovedResponse {
    #[serde(default)]
    approved_hashes: Vec<String>,
}

/// Registration details sent once per machine.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    /// Stable machine identifier.
    pub machine_id: String,
    /// Host name.
    pub hostname: String,
    /// Agent version.
    pub agent_version: String,
    /// Operating system.
    pub os_version: String,
}

#[derive(Deserialize)]
struct RegistrationResponse {
    api_key: Option<String>,
}

/// Client for the agent endpoints of the management server.
pub struct DashboardClient {
    http: reqwest::Client,
    base_url: String,
    api_key: RwLock<String>,
}

impl DashboardClient {
    /// Create a client for `base_url`. An empty `api_key` means the agent
    /// has not registered yet.
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: RwLock::new(api_key.to_string()),
        })
    }

    /// Whether an API key is set.
    pub async fn is_registered(&self) -> bool {
        !self.api_key.read().await.is_empty()
    }

    /// Register the machine and keep the issued API key.
    pub async fn register(&self, registration: &Registration) -> Result<String, SyncError> {
        let response = self
            .http
            .post(self.url(REGISTER_PATH))
            .json(registration)
            .send()
            .await?;
        let response = check(REGISTER_PATH, response).await?;
        let body: RegistrationResponse = response.json().await?;

        let api_key = body
            .api_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| SyncError::InvalidResponse {
                endpoint: REGISTER_PATH,
                message: "missing api_key".to_string(),
            })?;
        *self.api_key.write().await = api_key.clone();
        debug!("Registered as {}", registration.machine_id);
        Ok(api_key)
    }

    /// Send a heartbeat. Returns the pushed policy document, if the server
    /// sent a non-empty one.
    pub async fn heartbeat(&self, stats: &HeartbeatStats) -> Result<Option<Value>, SyncError> {
        let api_key = self.api_key().await?;
        let response = self
            .http
            .post(self.url(HEARTBEAT_PATH))
            .header(API_KEY_HEADER, api_key)
            .json(&HeartbeatRequest {
                status: "online",
                stats,
            })
            .send()
            .await?;
        let response = check(HEARTBEAT_PATH, response).await?;
        let body: HeartbeatResponse = response.json().await?;

        Ok(body.config.filter(|config| match config {
            Value::Object(map) => !map.is_empty(),
            Value::Null => false,
            _ => true,
        }))
    }

    /// Fetch the approved upload hashes.
    pub async fn approved_hashes(&self) -> Result<Vec<String>, SyncError> {
        let api_key = self.api_key().await?;
        let response = self
            .http
            .get(self.url(APPROVED_PATH))
            .header(API_KEY_HEADER, api_key)
            .send()
            .await?;
        let response = check(APPROVED_PATH, response).await?;
        let body: ApprovedResponse = response.json().await?;
        Ok(body.approved_hashes)
    }

    async fn api_key(&self) -> Result<String, SyncError> {
        let key = self.api_key.read().await;
        if key.is_empty() {
            return Err(SyncError::NotRegistered);
        }
        Ok(key.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn check(
    endpoint: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    Err(SyncError::Status {
        endpoint,
        status: status.as_u16(),
        body,
    })
}
