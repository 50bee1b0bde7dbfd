//! File-selection dialog suppression.
//!
//! Two layers: browser and shell policies that switch the dialogs off, and a
//! signature match used by the window monitor to close any dialog that opens
//! anyway.

use tracing::{debug, warn};

use crate::os::{Hive, OsAdapter, OsResult, RegistryValue, WindowInfo};

/// Browser policy keys carrying `FileSelectionDialogsEnabled`.
pub const BROWSER_POLICY_KEYS: [&str; 2] = [
    r"SOFTWARE\Policies\Google\Chrome",
    r"SOFTWARE\Policies\Microsoft\Edge",
];

/// Shell policy keys carrying the file-open and drag-drop restrictions.
pub const SHELL_POLICY_KEYS: [&str; 3] = [
    r"Software\Microsoft\Windows\CurrentVersion\Policies\Comdlg32",
    r"Software\Microsoft\Windows\CurrentVersion\Policies\Explorer",
    r"Software\Policies\Microsoft\Windows\Sidebar",
];

/// Shell restriction values; 1 restricts.
pub const SHELL_RESTRICTIONS: [&str; 3] = ["NoFileOpen", "NoFileSaveAs", "NoDragDrop"];

/// Browser dialog policy value; 0 disables.
pub const DIALOGS_ENABLED_VALUE: &str = "FileSelectionDialogsEnabled";

const HIVES: [Hive; 2] = [Hive::LocalMachine, Hive::CurrentUser];

/// Window classes used by file dialogs.
pub const DIALOG_CLASSES: [&str; 3] = ["#32770", "DirectUIHWND", "DUIViewWndClassName"];

/// Title fragments of file dialogs (lowercase).
pub const DIALOG_TITLES: &[&str] = &[
    "open",
    "save",
    "save as",
    "select file",
    "select files",
    "upload",
    "choose file",
    "open file",
    "attach",
    "browse",
    "file upload",
    "add files",
    "choose files",
    "select a file",
    "insert file",
    "attach file",
    "attach files",
];

/// Process-name fragments identifying browsers (lowercase).
pub const BROWSER_NAMES: [&str; 6] = ["chrome", "msedge", "firefox", "brave", "opera", "browser"];

/// Enable or disable file-selection dialogs in both hives.
///
/// Every value is attempted; the first failure is returned.
pub async fn set_dialog_policy(os: &dyn OsAdapter, allowed: bool) -> OsResult<()> {
    let browser_value = RegistryValue::Dword(if allowed { 1 } else { 0 });
    let shell_value = RegistryValue::Dword(if allowed { 0 } else { 1 });
    let mut first_error = None;

    for hive in HIVES {
        for key in BROWSER_POLICY_KEYS {
            let result = write(os, hive, key, DIALOGS_ENABLED_VALUE, &browser_value).await;
            record(&mut first_error, hive, key, result);
        }
        for key in SHELL_POLICY_KEYS {
            for name in SHELL_RESTRICTIONS {
                let result = write(os, hive, key, name, &shell_value).await;
                record(&mut first_error, hive, key, result);
            }
        }
    }

    debug!("File dialogs {}", if allowed { "enabled" } else { "disabled" });
    first_error.map_or(Ok(()), Err)
}

/// Whether the browser dialog values in both hives read back as `allowed`.
pub async fn dialog_policy_in_place(os: &dyn OsAdapter, allowed: bool) -> OsResult<bool> {
    let expected = RegistryValue::Dword(if allowed { 1 } else { 0 });
    for hive in HIVES {
        for key in BROWSER_POLICY_KEYS {
            let value = os.read_value(hive, key, DIALOGS_ENABLED_VALUE).await?;
            if value.as_ref() != Some(&expected) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

async fn write(
    os: &dyn OsAdapter,
    hive: Hive,
    key: &str,
    name: &str,
    value: &RegistryValue,
) -> OsResult<()> {
    os.create_key(hive, key).await?;
    os.write_value(hive, key, name, value).await
}

fn record(
    first_error: &mut Option<crate::os::OsError>,
    hive: Hive,
    key: &str,
    result: OsResult<()>,
) {
    if let Err(e) = result {
        warn!("Failed to set dialog policy under {}\\{}: {}", hive, key, e);
        first_error.get_or_insert(e);
    }
}

fn has_dialog_title(title: &str) -> bool {
    DIALOG_TITLES.iter().any(|t| title.contains(t))
}

/// Whether `window` looks like a file dialog that must be closed.
///
/// Windows owned by `own_pid` never match.
pub fn is_file_dialog(window: &WindowInfo, own_pid: u32) -> bool {
    if window.pid == own_pid {
        return false;
    }

    let title = window.title.to_lowercase();
    let class = window.class_name.as_str();

    if class == "#32770" {
        if has_dialog_title(&title) {
            return true;
        }
    } else if DIALOG_CLASSES.contains(&class) {
        return true;
    }

    let browser_owned = window
        .process_name
        .as_deref()
        .map(str::to_lowercase)
        .is_some_and(|name| BROWSER_NAMES.iter().any(|b| name.contains(b)));

    browser_owned && has_dialog_title(&title)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::{MemoryOs, OsOp, WindowHandle};

    fn window(class_name: &str, title: &str, pid: u32, process: Option<&str>) -> WindowInfo {
        WindowInfo {
            handle: WindowHandle(1),
            class_name: class_name.to_string(),
            title: title.to_string(),
            pid,
            process_name: process.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_dialog_policy_both_hives() {
        let os = MemoryOs::new();

        set_dialog_policy(&os, false).await.unwrap();
        for hive in HIVES {
            for key in BROWSER_POLICY_KEYS {
                assert_eq!(
                    os.registry_value(hive, key, DIALOGS_ENABLED_VALUE),
                    Some(RegistryValue::Dword(0))
                );
            }
            for key in SHELL_POLICY_KEYS {
                for name in SHELL_RESTRICTIONS {
                    assert_eq!(os.registry_value(hive, key, name), Some(RegistryValue::Dword(1)));
                }
            }
        }

        set_dialog_policy(&os, true).await.unwrap();
        assert_eq!(
            os.registry_value(Hive::CurrentUser, BROWSER_POLICY_KEYS[1], DIALOGS_ENABLED_VALUE),
            Some(RegistryValue::Dword(1))
        );
        assert_eq!(
            os.registry_value(Hive::LocalMachine, SHELL_POLICY_KEYS[0], "NoFileOpen"),
            Some(RegistryValue::Dword(0))
        );
    }

    #[tokio::test]
    async fn test_dialog_policy_reports_failure() {
        let os = MemoryOs::new();
        os.fail(OsOp::Registry);
        assert!(set_dialog_policy(&os, true).await.is_err());
    }

    #[tokio::test]
    async fn test_dialog_policy_read_back() {
        let os = MemoryOs::new();
        assert!(!dialog_policy_in_place(&os, false).await.unwrap());

        set_dialog_policy(&os, false).await.unwrap();
        assert!(dialog_policy_in_place(&os, false).await.unwrap());
        assert!(!dialog_policy_in_place(&os, true).await.unwrap());

        os.set_registry_value(
            Hive::CurrentUser,
            BROWSER_POLICY_KEYS[0],
            DIALOGS_ENABLED_VALUE,
            RegistryValue::Dword(1),
        );
        assert!(!dialog_policy_in_place(&os, false).await.unwrap());
    }

    #[test]
    fn test_standard_dialog_needs_file_title() {
        assert!(is_file_dialog(&window("#32770", "Open", 10, Some("notepad.exe")), 1));
        assert!(is_file_dialog(&window("#32770", "Save As", 10, None), 1));
        assert!(!is_file_dialog(&window("#32770", "Error", 10, None), 1));
    }

    #[test]
    fn test_modern_dialog_classes() {
        assert!(is_file_dialog(&window("DirectUIHWND", "", 10, None), 1));
        assert!(is_file_dialog(&window("DUIViewWndClassName", "Anything", 10, None), 1));
    }

    #[test]
    fn test_browser_owned_title() {
        let upload = window("Chrome_WidgetWin_1", "Choose File to Upload", 10, Some("chrome.exe"));
        assert!(is_file_dialog(&upload, 1));

        // Same title, not a browser
        let editor = window("Notepad", "Choose File to Upload", 10, Some("notepad.exe"));
        assert!(!is_file_dialog(&editor, 1));
    }

    #[test]
    fn test_own_windows_never_match() {
        assert!(!is_file_dialog(&window("#32770", "Open", 7, None), 7));
        assert!(!is_file_dialog(&window("DirectUIHWND", "", 7, None), 7));
    }
}
