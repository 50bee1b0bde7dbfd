//! Parsers for the text the Windows tools print.
//!
//! Kept platform-independent so the formats are covered by tests everywhere.

use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::error::{OsError, OsResult};
use super::{DeviceEvent, ProcessInfo, RegistryValue, UsbInventory};

/// Extract `name` from `reg query <key> /v <name>` output.
///
/// ```text
/// HKEY_LOCAL_MACHINE\SYSTEM\CurrentControlSet\Services\USBSTOR
///     Start    REG_DWORD    0x3
/// ```
pub fn parse_reg_query(stdout: &str, name: &str) -> Option<RegistryValue> {
    for line in stdout.lines() {
        let mut parts = line.split_whitespace();
        let Some(value_name) = parts.next() else {
            continue;
        };
        if !value_name.eq_ignore_ascii_case(name) {
            continue;
        }
        let Some(kind) = parts.next() else {
            continue;
        };

        // Data is everything after the type token, spaces included.
        let data = line
            .find(kind)
            .map(|pos| line[pos + kind.len()..].trim())
            .unwrap_or("");

        return match kind {
            "REG_DWORD" => {
                let hex = data.trim_start_matches("0x").trim_start_matches("0X");
                u32::from_str_radix(hex, 16).ok().map(RegistryValue::Dword)
            }
            "REG_SZ" | "REG_EXPAND_SZ" => Some(RegistryValue::String(data.to_string())),
            _ => None,
        };
    }
    None
}

/// Check whether failed `reg` output means "key or value does not exist".
pub fn is_registry_not_found(diagnostic: &str) -> bool {
    diagnostic
        .to_lowercase()
        .contains("unable to find the specified registry key or value")
}

/// The `reg add` type and data arguments for a value.
pub fn reg_value_args(value: &RegistryValue) -> (&'static str, String) {
    match value {
        RegistryValue::Dword(v) => ("REG_DWORD", v.to_string()),
        RegistryValue::String(s) => ("REG_SZ", s.clone()),
    }
}

/// Parse `tasklist /FO CSV /NH` output.
///
/// ```text
/// "chrome.exe","11424","Console","1","312,644 K"
/// ```
pub fn parse_tasklist_csv(stdout: &str) -> Vec<ProcessInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let fields = split_csv_line(line);
            let name = fields.first()?.clone();
            let pid = fields.get(1)?.parse().ok()?;
            Some(ProcessInfo { pid, name })
        })
        .collect()
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.trim().chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if !current.is_empty() || !fields.is_empty() {
        fields.push(current);
    }
    fields
}

/// Parse the JSON document printed by the USB enumeration script.
pub fn parse_inventory(stdout: &str) -> OsResult<UsbInventory> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(UsbInventory::default());
    }
    serde_json::from_str(trimmed).map_err(|e| OsError::Parse {
        what: "USB inventory",
        message: e.to_string(),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

/// Parse a JSON list printed by `ConvertTo-Json`.
///
/// Empty output is an empty list. A bare object, which PowerShell prints for
/// a one-element pipeline, is a list of one.
pub fn parse_json_list<T: DeserializeOwned>(stdout: &str, what: &'static str) -> OsResult<Vec<T>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    match serde_json::from_str(trimmed) {
        Ok(OneOrMany::Many(items)) => Ok(items),
        Ok(OneOrMany::One(item)) => Ok(vec![item]),
        Err(e) => Err(OsError::Parse {
            what,
            message: e.to_string(),
        }),
    }
}

/// Parse the output of the device-change wait script.
///
/// The script prints `timeout` or the WMI `EventType` (2 = arrival,
/// 3 = removal; configuration changes are reported as arrivals).
pub fn parse_device_event(stdout: &str) -> OsResult<Option<DeviceEvent>> {
    let token = stdout.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    match token {
        "" | "timeout" => Ok(None),
        "3" => Ok(Some(DeviceEvent::Removal)),
        other if other.parse::<u32>().is_ok() => Ok(Some(DeviceEvent::Arrival)),
        other => Err(OsError::Parse {
            what: "device change event",
            message: format!("unexpected output '{}'", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::{ConnectionInfo, ProcessIo, Protocol, UsbHistoryEntry};

    #[test]
    fn test_parse_reg_query_dword() {
        let output = "\r\nHKEY_LOCAL_MACHINE\\SYSTEM\\CurrentControlSet\\Services\\USBSTOR\r\n    Start    REG_DWORD    0x4\r\n\r\n";
        assert_eq!(
            parse_reg_query(output, "Start"),
            Some(RegistryValue::Dword(4))
        );
        assert_eq!(parse_reg_query(output, "Type"), None);
    }

    #[test]
    fn test_parse_reg_query_string_with_spaces() {
        let output = "HKEY_LOCAL_MACHINE\\SOFTWARE\\Policies\\Google\\Chrome\n    DnsOverHttpsMode    REG_SZ    off\n    Note    REG_SZ    managed by endpoint guard\n";
        assert_eq!(
            parse_reg_query(output, "dnsoverhttpsmode"),
            Some(RegistryValue::String("off".to_string()))
        );
        assert_eq!(
            parse_reg_query(output, "Note"),
            Some(RegistryValue::String("managed by endpoint guard".to_string()))
        );
    }

    #[test]
    fn test_registry_not_found() {
        assert!(is_registry_not_found(
            "ERROR: The system was unable to find the specified registry key or value."
        ));
        assert!(!is_registry_not_found("ERROR: Access is denied."));
    }

    #[test]
    fn test_reg_value_args() {
        assert_eq!(
            reg_value_args(&RegistryValue::Dword(1)),
            ("REG_DWORD", "1".to_string())
        );
        assert_eq!(
            reg_value_args(&RegistryValue::String("off".to_string())),
            ("REG_SZ", "off".to_string())
        );
    }

    #[test]
    fn test_parse_tasklist() {
        let output = "\"System Idle Process\",\"0\",\"Services\",\"0\",\"8 K\"\r\n\
                      \"chrome.exe\",\"11424\",\"Console\",\"1\",\"312,644 K\"\r\n\
                      \r\n";
        let processes = parse_tasklist_csv(output);
        assert_eq!(processes.len(), 2);
        assert_eq!(processes[1].name, "chrome.exe");
        assert_eq!(processes[1].pid, 11424);
    }

    #[test]
    fn test_parse_tasklist_skips_garbage() {
        let output = "INFO: No tasks are running which match the specified criteria.\r\n";
        assert!(parse_tasklist_csv(output).is_empty());
    }

    #[test]
    fn test_parse_inventory_empty() {
        assert_eq!(parse_inventory("  \r\n").unwrap(), UsbInventory::default());
        assert!(parse_inventory("not json").is_err());
    }

    #[test]
    fn test_parse_connections() {
        let output = r#"[
            {"pid":4120,"process_name":"chrome.exe","protocol":"tcp","local_address":"10.0.0.5",
             "local_port":51544,"remote_address":"142.250.74.46","remote_port":443,"state":"Established"},
            {"pid":912,"process_name":null,"protocol":"udp","local_address":"0.0.0.0",
             "local_port":5353,"remote_address":"","remote_port":0,"state":"Listen"}
        ]"#;
        let connections: Vec<ConnectionInfo> = parse_json_list(output, "connections").unwrap();
        assert_eq!(connections.len(), 2);
        assert!(connections[0].is_established());
        assert_eq!(connections[0].remote_port, 443);
        assert_eq!(connections[1].protocol, Protocol::Udp);
        assert_eq!(connections[1].process_name, None);
        assert!(!connections[1].is_established());
    }

    #[test]
    fn test_parse_json_list_single_object() {
        let output = r#"{"device_class":"Disk&Ven_SanDisk&Prod_Cruzer_Blade&Rev_1.00",
            "instance_id":"4C530001&0","friendly_name":"SanDisk Cruzer Blade USB Device"}"#;
        let history: Vec<UsbHistoryEntry> = parse_json_list(output, "USB history").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].instance_id, "4C530001&0");

        let empty: Vec<ProcessIo> = parse_json_list("\r\n", "process I/O").unwrap();
        assert!(empty.is_empty());
        assert!(parse_json_list::<ProcessIo>("Get-CimInstance : denied", "process I/O").is_err());
    }

    #[test]
    fn test_parse_device_event() {
        assert_eq!(parse_device_event("timeout\r\n").unwrap(), None);
        assert_eq!(
            parse_device_event("2\r\n").unwrap(),
            Some(DeviceEvent::Arrival)
        );
        assert_eq!(
            parse_device_event("3").unwrap(),
            Some(DeviceEvent::Removal)
        );
        assert_eq!(
            parse_device_event("1").unwrap(),
            Some(DeviceEvent::Arrival)
        );
        assert!(parse_device_event("Register-WmiEvent : failed").is_err());
    }
}
