//! Browser DNS-over-HTTPS policy.
//!
//! A browser resolving over HTTPS never consults the hosts file or the local
//! proxy, so DoH is switched off by machine policy while blocking is active.

use tracing::warn;

use crate::os::{Hive, OsAdapter, OsResult, RegistryValue};

const CHROME_POLICY: &str = r"SOFTWARE\Policies\Google\Chrome";
const EDGE_POLICY: &str = r"SOFTWARE\Policies\Microsoft\Edge";
const FIREFOX_DOH_POLICY: &str = r"SOFTWARE\Policies\Mozilla\Firefox\DNSOverHTTPS";

/// Turn DoH off in Chrome, Edge and Firefox.
pub async fn disable(os: &dyn OsAdapter) -> OsResult<()> {
    let mode = RegistryValue::String("off".to_string());
    for path in [CHROME_POLICY, EDGE_POLICY] {
        os.create_key(Hive::LocalMachine, path).await?;
        os.write_value(Hive::LocalMachine, path, "DnsOverHttpsMode", &mode)
            .await?;
    }

    os.create_key(Hive::LocalMachine, FIREFOX_DOH_POLICY).await?;
    os.write_value(
        Hive::LocalMachine,
        FIREFOX_DOH_POLICY,
        "Enabled",
        &RegistryValue::Dword(0),
    )
    .await?;
    os.write_value(
        Hive::LocalMachine,
        FIREFOX_DOH_POLICY,
        "Locked",
        &RegistryValue::Dword(1),
    )
    .await?;

    Ok(())
}

/// Remove the DoH policy values again. Keeps going past individual
/// failures and reports the first one.
pub async fn restore(os: &dyn OsAdapter) -> OsResult<()> {
    let targets = [
        (CHROME_POLICY, "DnsOverHttpsMode"),
        (EDGE_POLICY, "DnsOverHttpsMode"),
        (FIREFOX_DOH_POLICY, "Enabled"),
        (FIREFOX_DOH_POLICY, "Locked"),
    ];

    let mut first_error = None;
    for (path, name) in targets {
        if let Err(e) = os.delete_value(Hive::LocalMachine, path, name).await {
            warn!("Failed to remove {}\\{}: {}", path, name, e);
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::MemoryOs;

    #[tokio::test]
    async fn test_disable_then_restore() {
        let os = MemoryOs::new();

        disable(&os).await.unwrap();
        assert_eq!(
            os.registry_value(Hive::LocalMachine, CHROME_POLICY, "DnsOverHttpsMode"),
            Some(RegistryValue::String("off".to_string()))
        );
        assert_eq!(
            os.registry_value(Hive::LocalMachine, FIREFOX_DOH_POLICY, "Enabled"),
            Some(RegistryValue::Dword(0))
        );

        restore(&os).await.unwrap();
        assert!(
            os.registry_value(Hive::LocalMachine, EDGE_POLICY, "DnsOverHttpsMode")
                .is_none()
        );
        assert!(
            os.registry_value(Hive::LocalMachine, FIREFOX_DOH_POLICY, "Locked")
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_restore_without_disable_is_ok() {
        let os = MemoryOs::new();
        restore(&os).await.unwrap();
    }
}
