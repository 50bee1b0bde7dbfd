use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use endpoint_guard::agent::Agent;
use endpoint_guard::config::Config;
use endpoint_guard::os::{Hive, MemoryOs, RawDevice, RawDisk, RegistryValue};
use endpoint_guard::policy::{PolicyDocument, UsbMode};
use endpoint_guard::telemetry::AuditLogger;
use endpoint_guard::upload::UploadLockState;
use serde_json::json;
use tempfile::TempDir;

const HOSTS: &str = "# Copyright (c) 1993-2009 Microsoft Corp.\r\n127.0.0.1 localhost\r\n::1 localhost\r\n";
const STICK_ID: &str = r"USB\VID_0781&PID_5567\4C530001";
const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
const USBSTOR_KEY: &str = r"SYSTEM\CurrentControlSet\Services\USBSTOR";

fn config(temp: &TempDir) -> Config {
    let mut config = Config::embedded().expect("embedded config parses");
    config.agent.machine_id = "WS-TEST-0001".to_string();
    config.agent.dashboard_url.clear();
    config.agent.stop_timeout_secs = 1;
    config.network.disable_doh = Some(false);
    config.usb.watch_timeout_ms = 20;
    config.uploads.window_poll_ms = 10;
    config.uploads.expiry_check_ms = 10;
    config.uploads.gateway_dir = temp.path().join("gateway").display().to_string();
    config
}

fn attach_stick(os: &MemoryOs) {
    os.attach_disk(RawDisk {
        device_id: STICK_ID.to_string(),
        serial: None,
        description: "SanDisk Cruzer Blade USB Device".to_string(),
        drive_letter: Some("E:".to_string()),
    });
    os.attach_device_silently(RawDevice {
        device_id: STICK_ID.to_string(),
        service: Some("USBSTOR".to_string()),
        compatible_ids: vec![],
        description: "SanDisk Cruzer Blade".to_string(),
    });
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_pushed_policy_converges_every_controller() {
    let temp = TempDir::new().unwrap();
    let os = Arc::new(MemoryOs::with_hosts(HOSTS));
    os.set_resolution("facebook.com", vec![IpAddr::V4(Ipv4Addr::new(157, 240, 1, 35))]);
    attach_stick(&os);

    let agent = Agent::new(&config(&temp), os.clone(), Arc::new(AuditLogger::new_null()));
    agent.start().await;
    assert_eq!(agent.usb().mode().await, UsbMode::Monitor);
    assert!(os.ejected().is_empty());

    let document = PolicyDocument::from_value(&json!({
        "network": { "blocked_sites": ["facebook.com"], "blocking_method": "hosts" },
        "usb": { "mode": "block" },
        "uploads": { "block_all": true, "whitelist": [] }
    }));
    agent.policy().update(|current| current.with_document(&document));

    assert!(eventually(|| async { os.hosts().contains("127.0.0.1 facebook.com") }).await);
    assert!(os.hosts().starts_with(HOSTS));
    assert!(eventually(|| async { os.ejected().iter().any(|d| d == "E:") }).await);
    assert!(
        eventually(|| async { agent.uploads().lock_state().await == UploadLockState::Locked })
            .await
    );
    assert!(agent.network().is_site_blocked("www.facebook.com"));

    agent.stop().await;

    assert_eq!(os.hosts(), HOSTS);
    assert!(os.firewall_rules().is_empty());
    assert_eq!(
        os.registry_value(Hive::LocalMachine, USBSTOR_KEY, "Start"),
        Some(RegistryValue::Dword(3))
    );
}

#[tokio::test]
async fn test_approved_upload_round_trip() {
    let temp = TempDir::new().unwrap();
    let mut config = config(&temp);
    config.uploads.block_all = Some(true);
    let os = Arc::new(MemoryOs::new());

    let agent = Agent::new(&config, os.clone(), Arc::new(AuditLogger::new_null()));
    agent.start().await;
    assert_eq!(agent.uploads().lock_state().await, UploadLockState::Locked);

    agent
        .policy()
        .update(|current| current.with_approved_hashes([ABC_SHA256]));

    let file = temp.path().join("report.pdf");
    std::fs::write(&file, b"abc").unwrap();

    let mut grant = None;
    for _ in 0..100 {
        if let Ok(Some(g)) = agent
            .uploads()
            .request_temporary_unlock(&file, ABC_SHA256, Some(Duration::from_millis(200)))
            .await
        {
            grant = Some(g);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let grant = grant.expect("approved hash eventually unlocks");
    assert_eq!(std::fs::read(&grant.gateway_path).unwrap(), b"abc");

    assert!(
        eventually(|| async { agent.uploads().lock_state().await == UploadLockState::Locked })
            .await
    );
    assert!(!grant.gateway_path.exists());

    agent.stop().await;
}

#[tokio::test]
async fn test_unapproved_upload_touches_nothing() {
    let temp = TempDir::new().unwrap();
    let mut config = config(&temp);
    config.uploads.block_all = Some(true);
    let os = Arc::new(MemoryOs::new());

    let agent = Agent::new(&config, os.clone(), Arc::new(AuditLogger::new_null()));
    agent.start().await;

    let file = temp.path().join("secrets.docx");
    std::fs::write(&file, b"abc").unwrap();
    let result = agent
        .uploads()
        .request_temporary_unlock(&file, ABC_SHA256, None)
        .await;

    assert!(result.is_err());
    assert!(!temp.path().join("gateway").exists());
    assert_eq!(agent.uploads().lock_state().await, UploadLockState::Locked);

    agent.stop().await;
}

#[tokio::test]
async fn test_stop_twice_is_harmless() {
    let temp = TempDir::new().unwrap();
    let os = Arc::new(MemoryOs::with_hosts(HOSTS));
    let mut config = config(&temp);
    config.network.blocked_sites = vec!["tiktok.com".to_string()];

    let agent = Agent::new(&config, os.clone(), Arc::new(AuditLogger::new_null()));
    agent.start().await;
    assert!(os.hosts().contains("tiktok.com"));

    agent.stop().await;
    agent.stop().await;
    assert_eq!(os.hosts(), HOSTS);
}
