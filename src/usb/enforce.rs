//! Machine-wide USB storage enforcement.

use tracing::{debug, warn};

use crate::os::{Hive, OsAdapter, OsResult, RegistryValue};

/// USB mass-storage driver service key.
pub const USBSTOR_KEY: &str = r"SYSTEM\CurrentControlSet\Services\USBSTOR";

/// Group-policy key for removable disks.
pub const REMOVABLE_DISKS_POLICY: &str = r"SOFTWARE\Policies\Microsoft\Windows\RemovableStorageDevices\{53f5630d-b6bf-11d0-94f2-00a0c91efb8b}";

/// Deny flags set under [`REMOVABLE_DISKS_POLICY`].
pub const DENY_FLAGS: [&str; 3] = ["Deny_Read", "Deny_Write", "Deny_Execute"];

/// Service start type: load on demand.
pub const START_ENABLED: u32 = 3;
/// Service start type: disabled.
pub const START_DISABLED: u32 = 4;

/// Enable or disable the USB mass-storage driver.
pub async fn set_storage_driver(os: &dyn OsAdapter, enabled: bool) -> OsResult<()> {
    let start = if enabled { START_ENABLED } else { START_DISABLED };
    debug!("Setting USBSTOR Start = {}", start);
    os.write_value(
        Hive::LocalMachine,
        USBSTOR_KEY,
        "Start",
        &RegistryValue::Dword(start),
    )
    .await
}

/// Set or clear the removable-disk deny flags.
pub async fn set_removable_policy(os: &dyn OsAdapter, deny: bool) -> OsResult<()> {
    if deny {
        os.create_key(Hive::LocalMachine, REMOVABLE_DISKS_POLICY).await?;
        for flag in DENY_FLAGS {
            os.write_value(
                Hive::LocalMachine,
                REMOVABLE_DISKS_POLICY,
                flag,
                &RegistryValue::Dword(1),
            )
            .await?;
        }
    } else {
        for flag in DENY_FLAGS {
            os.delete_value(Hive::LocalMachine, REMOVABLE_DISKS_POLICY, flag)
                .await?;
        }
    }
    Ok(())
}

/// Apply or lift the machine-wide storage block, then refresh group policy.
///
/// Every step is attempted; the first failure is returned.
pub async fn apply_storage_block(os: &dyn OsAdapter, block: bool) -> OsResult<()> {
    let driver = set_storage_driver(os, !block).await;
    if let Err(e) = &driver {
        warn!("Failed to set USBSTOR driver state: {}", e);
    }
    let policy = set_removable_policy(os, block).await;
    if let Err(e) = &policy {
        warn!("Failed to set removable storage policy: {}", e);
    }
    let refresh = os.refresh_group_policy().await;
    if let Err(e) = &refresh {
        warn!("Group policy refresh failed: {}", e);
    }

    driver.and(policy).and(refresh)
}

/// Whether the driver is disabled and every deny flag is set.
pub async fn storage_block_in_place(os: &dyn OsAdapter) -> OsResult<bool> {
    let start = os.read_value(Hive::LocalMachine, USBSTOR_KEY, "Start").await?;
    if start != Some(RegistryValue::Dword(START_DISABLED)) {
        return Ok(false);
    }
    for flag in DENY_FLAGS {
        let value = os
            .read_value(Hive::LocalMachine, REMOVABLE_DISKS_POLICY, flag)
            .await?;
        if value != Some(RegistryValue::Dword(1)) {
            return Ok(false);
        }
    }
    Ok(true)
}
