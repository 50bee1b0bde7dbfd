//! Production adapter for Windows hosts.
//!
//! Registry and firewall changes go through `reg.exe` and `netsh` so that they
//! behave exactly like an administrator's manual changes. Device enumeration,
//! socket listing and process counters use PowerShell CIM queries. Window enumeration and volume ejection call
//! Win32 directly on the blocking pool.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, BOOL, HANDLE, HWND, INVALID_HANDLE_VALUE, LPARAM,
};
use windows_sys::Win32::Storage::FileSystem::CreateFileW;
use windows_sys::Win32::System::IO::DeviceIoControl;
use windows_sys::Win32::System::Threading::{OpenProcess, QueryFullProcessImageNameW};
use windows_sys::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GetClassNameW, GetWindowTextW, GetWindowThreadProcessId, IsWindowVisible,
    PostMessageW, WM_CLOSE,
};

use super::command::CommandRunner;
use super::error::{OsError, OsResult};
use super::parse;
use super::{
    lookup_host, ConnectionInfo, DeviceEvent, FirewallCommand, Hive, OsAdapter, ProcessInfo,
    ProcessIo, RegistryValue, SystemOsOptions, UsbHistoryEntry, UsbInventory, WindowHandle,
    WindowInfo,
};

const GENERIC_READ: u32 = 0x8000_0000;
const GENERIC_WRITE: u32 = 0x4000_0000;
const FILE_SHARE_READ: u32 = 0x0000_0001;
const FILE_SHARE_WRITE: u32 = 0x0000_0002;
const OPEN_EXISTING: u32 = 3;
const PROCESS_QUERY_LIMITED_INFORMATION: u32 = 0x1000;

const FSCTL_LOCK_VOLUME: u32 = 0x0009_0018;
const FSCTL_DISMOUNT_VOLUME: u32 = 0x0009_0020;
const IOCTL_STORAGE_EJECT_MEDIA: u32 = 0x002D_4808;

const INVENTORY_SCRIPT: &str = r#"
$ErrorActionPreference = 'SilentlyContinue'
$entities = @(Get-CimInstance Win32_PnPEntity | Where-Object { $_.PNPDeviceID -match 'VID_[0-9A-F]{4}' } | ForEach-Object {
    [pscustomobject]@{
        device_id = $_.PNPDeviceID
        service = $_.Service
        compatible_ids = @($_.CompatibleID | Where-Object { $_ })
        description = if ($_.Caption) { $_.Caption } else { [string]$_.Description }
    }
})
$disks = @(Get-CimInstance Win32_DiskDrive -Filter "InterfaceType='USB'" | ForEach-Object {
    $disk = $_
    $letter = $null
    foreach ($partition in Get-CimAssociatedInstance -InputObject $disk -ResultClassName Win32_DiskPartition) {
        foreach ($logical in Get-CimAssociatedInstance -InputObject $partition -ResultClassName Win32_LogicalDisk) {
            if (-not $letter) { $letter = $logical.DeviceID }
        }
    }
    [pscustomobject]@{
        device_id = $disk.PNPDeviceID
        serial = if ($disk.SerialNumber) { $disk.SerialNumber.Trim() } else { $null }
        description = [string]$disk.Caption
        drive_letter = $letter
    }
})
[pscustomobject]@{ entities = $entities; disks = $disks } | ConvertTo-Json -Depth 4 -Compress
"#;

const CONNECTIONS_SCRIPT: &str = r#"
$ErrorActionPreference = 'SilentlyContinue'
$names = @{}
Get-CimInstance Win32_Process | ForEach-Object { $names[[int]$_.ProcessId] = $_.Name }
$tcp = @(Get-NetTCPConnection | ForEach-Object {
    [pscustomobject]@{
        pid = [int]$_.OwningProcess
        process_name = $names[[int]$_.OwningProcess]
        protocol = 'tcp'
        local_address = [string]$_.LocalAddress
        local_port = [int]$_.LocalPort
        remote_address = [string]$_.RemoteAddress
        remote_port = [int]$_.RemotePort
        state = [string]$_.State
    }
})
$udp = @(Get-NetUDPEndpoint | ForEach-Object {
    [pscustomobject]@{
        pid = [int]$_.OwningProcess
        process_name = $names[[int]$_.OwningProcess]
        protocol = 'udp'
        local_address = [string]$_.LocalAddress
        local_port = [int]$_.LocalPort
        remote_address = ''
        remote_port = 0
        state = 'Listen'
    }
})
ConvertTo-Json -InputObject @($tcp + $udp) -Depth 3 -Compress
"#;

const PROCESS_IO_SCRIPT: &str = r#"
$ErrorActionPreference = 'SilentlyContinue'
$items = @(Get-CimInstance Win32_Process | ForEach-Object {
    [pscustomobject]@{
        pid = [int]$_.ProcessId
        name = [string]$_.Name
        bytes_read = [uint64]$_.ReadTransferCount
        bytes_written = [uint64]$_.WriteTransferCount
    }
})
ConvertTo-Json -InputObject $items -Compress
"#;

const USB_HISTORY_SCRIPT: &str = r#"
$ErrorActionPreference = 'SilentlyContinue'
$items = @(Get-ChildItem 'HKLM:\SYSTEM\CurrentControlSet\Enum\USBSTOR' | ForEach-Object {
    $class = $_.PSChildName
    Get-ChildItem $_.PSPath | ForEach-Object {
        [pscustomobject]@{
            device_class = $class
            instance_id = $_.PSChildName
            friendly_name = (Get-ItemProperty $_.PSPath).FriendlyName
        }
    }
})
ConvertTo-Json -InputObject $items -Compress
"#;

/// Adapter backed by the Windows system tools and Win32 API.
pub struct WindowsOs {
    options: SystemOsOptions,
    runner: CommandRunner,
}

impl WindowsOs {
    /// Create the adapter.
    pub fn new(options: SystemOsOptions) -> Self {
        let runner = CommandRunner::new(options.command_timeout);
        Self { options, runner }
    }

    async fn powershell(&self, script: &str, timeout: Duration) -> OsResult<String> {
        let args = vec![
            "-NoProfile".to_string(),
            "-NonInteractive".to_string(),
            "-Command".to_string(),
            script.to_string(),
        ];
        let output = self
            .runner
            .run_with_timeout("powershell", &args, timeout)
            .await?;
        Ok(output.stdout)
    }

    async fn blocking<T, F>(&self, call: &'static str, f: F) -> OsResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> OsResult<T> + Send + 'static,
    {
        let timeout = self.options.command_timeout;
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(OsError::CommandFailed {
                cmd: call.to_string(),
                source: std::io::Error::other(e.to_string()),
            }),
            Err(_) => Err(OsError::Timeout {
                cmd: call.to_string(),
                timeout,
            }),
        }
    }
}

fn key_arg(hive: Hive, path: &str) -> String {
    format!("{}\\{}", hive.abbrev(), path)
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl OsAdapter for WindowsOs {
    async fn read_value(
        &self,
        hive: Hive,
        path: &str,
        name: &str,
    ) -> OsResult<Option<RegistryValue>> {
        let args = strings(&["query", &key_arg(hive, path), "/v", name]);
        let output = self.runner.output("reg", &args).await?;
        if output.success {
            return Ok(parse::parse_reg_query(&output.stdout, name));
        }

        let diagnostic = output.diagnostic();
        if parse::is_registry_not_found(&diagnostic) {
            return Ok(None);
        }
        Err(OsError::CommandError {
            cmd: format!("reg query {}", key_arg(hive, path)),
            stderr: diagnostic,
        })
    }

    async fn write_value(
        &self,
        hive: Hive,
        path: &str,
        name: &str,
        value: &RegistryValue,
    ) -> OsResult<()> {
        let (kind, data) = parse::reg_value_args(value);
        let args = strings(&[
            "add",
            &key_arg(hive, path),
            "/v",
            name,
            "/t",
            kind,
            "/d",
            &data,
            "/f",
        ]);
        self.runner.run("reg", &args).await?;
        Ok(())
    }

    async fn delete_value(&self, hive: Hive, path: &str, name: &str) -> OsResult<()> {
        let args = strings(&["delete", &key_arg(hive, path), "/v", name, "/f"]);
        let output = self.runner.output("reg", &args).await?;
        let diagnostic = output.diagnostic();
        if output.success || parse::is_registry_not_found(&diagnostic) {
            return Ok(());
        }
        Err(OsError::CommandError {
            cmd: format!("reg delete {}", key_arg(hive, path)),
            stderr: diagnostic,
        })
    }

    async fn create_key(&self, hive: Hive, path: &str) -> OsResult<()> {
        let args = strings(&["add", &key_arg(hive, path), "/f"]);
        self.runner.run("reg", &args).await?;
        Ok(())
    }

    async fn run_firewall_command(&self, command: &FirewallCommand) -> OsResult<()> {
        let (program, args) = command.invocation();
        self.runner.run(program, &args).await?;
        Ok(())
    }

    async fn enumerate_usb_devices(&self) -> OsResult<UsbInventory> {
        let stdout = self
            .powershell(INVENTORY_SCRIPT, self.options.command_timeout * 2)
            .await?;
        parse::parse_inventory(&stdout)
    }

    async fn watch_device_change(&self, timeout: Duration) -> OsResult<Option<DeviceEvent>> {
        let seconds = timeout.as_secs().max(1);
        let script = format!(
            "$null = Register-WmiEvent -Query 'SELECT * FROM Win32_DeviceChangeEvent' -SourceIdentifier EndpointGuardDeviceChange\n\
             $e = Wait-Event -SourceIdentifier EndpointGuardDeviceChange -Timeout {}\n\
             if ($e) {{ $e.SourceEventArgs.NewEvent.EventType }} else {{ 'timeout' }}\n\
             Unregister-Event -SourceIdentifier EndpointGuardDeviceChange",
            seconds
        );
        let stdout = self
            .powershell(&script, timeout + self.options.command_timeout)
            .await?;
        parse::parse_device_event(&stdout)
    }

    async fn eject_volume(&self, drive_letter: &str) -> OsResult<()> {
        let letter = drive_letter.to_string();
        self.blocking("eject volume", move || eject_blocking(&letter))
            .await
    }

    async fn refresh_group_policy(&self) -> OsResult<()> {
        self.runner
            .run_with_timeout(
                "gpupdate",
                &strings(&["/force"]),
                self.options.policy_refresh_timeout,
            )
            .await?;
        Ok(())
    }

    async fn read_hosts_file(&self) -> OsResult<String> {
        let path = &self.options.hosts_path;
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| OsError::io(path, e))
    }

    async fn write_hosts_file(&self, contents: &str) -> OsResult<()> {
        let path = &self.options.hosts_path;
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| OsError::io(path, e))
    }

    async fn flush_dns_cache(&self) -> OsResult<()> {
        self.runner
            .run("ipconfig", &strings(&["/flushdns"]))
            .await?;
        Ok(())
    }

    async fn resolve_domain(&self, name: &str) -> OsResult<Vec<IpAddr>> {
        lookup_host(name, self.options.resolve_timeout).await
    }

    async fn list_processes(&self) -> OsResult<Vec<ProcessInfo>> {
        let output = self
            .runner
            .run("tasklist", &strings(&["/FO", "CSV", "/NH"]))
            .await?;
        Ok(parse::parse_tasklist_csv(&output.stdout))
    }

    async fn kill_process(&self, pid: u32) -> OsResult<()> {
        let pid = pid.to_string();
        self.runner
            .run("taskkill", &strings(&["/PID", &pid, "/F"]))
            .await?;
        Ok(())
    }

    async fn enumerate_windows(&self) -> OsResult<Vec<WindowInfo>> {
        self.blocking("EnumWindows", enumerate_windows_blocking).await
    }

    async fn close_window(&self, handle: WindowHandle) -> OsResult<()> {
        self.blocking("PostMessageW", move || {
            // SAFETY: PostMessageW tolerates stale handles and reports failure.
            let ok = unsafe { PostMessageW(handle.0 as HWND, WM_CLOSE, 0, 0) };
            if ok == 0 {
                return Err(win32_error("PostMessageW"));
            }
            Ok(())
        })
        .await
    }

    async fn list_connections(&self) -> OsResult<Vec<ConnectionInfo>> {
        let stdout = self
            .powershell(CONNECTIONS_SCRIPT, self.options.command_timeout * 2)
            .await?;
        parse::parse_json_list(&stdout, "connections")
    }

    async fn process_io_counters(&self) -> OsResult<Vec<ProcessIo>> {
        let stdout = self
            .powershell(PROCESS_IO_SCRIPT, self.options.command_timeout)
            .await?;
        parse::parse_json_list(&stdout, "process I/O counters")
    }

    async fn usb_device_history(&self) -> OsResult<Vec<UsbHistoryEntry>> {
        let stdout = self
            .powershell(USB_HISTORY_SCRIPT, self.options.command_timeout)
            .await?;
        parse::parse_json_list(&stdout, "USB device history")
    }
}

fn win32_error(call: &'static str) -> OsError {
    // SAFETY: reads thread-local error state only.
    let code = unsafe { GetLastError() };
    OsError::Win32 { call, code }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Issue a buffer-less IOCTL; returns whether it succeeded.
///
/// # Safety
///
/// `handle` must be an open volume handle.
unsafe fn ioctl(handle: HANDLE, code: u32) -> bool {
    let mut returned = 0u32;
    // SAFETY: no input or output buffers; handle validity is the caller's contract.
    unsafe {
        DeviceIoControl(
            handle,
            code,
            std::ptr::null(),
            0,
            std::ptr::null_mut(),
            0,
            &mut returned,
            std::ptr::null_mut(),
        ) != 0
    }
}

fn eject_blocking(drive_letter: &str) -> OsResult<()> {
    let letter = drive_letter.trim_end_matches(['\\', ':']);
    let path = wide(&format!(r"\\.\{}:", letter));

    // SAFETY: `path` is NUL-terminated and outlives the call.
    let handle = unsafe {
        CreateFileW(
            path.as_ptr(),
            GENERIC_READ | GENERIC_WRITE,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            std::ptr::null(),
            OPEN_EXISTING,
            0,
            std::ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(win32_error("CreateFileW"));
    }

    // SAFETY: `handle` was opened above and is closed exactly once below.
    let ejected = unsafe {
        if !ioctl(handle, FSCTL_LOCK_VOLUME) {
            warn!("Could not lock volume {}: continuing with dismount", letter);
        }
        if !ioctl(handle, FSCTL_DISMOUNT_VOLUME) {
            warn!("Could not dismount volume {}", letter);
        }
        let ejected = ioctl(handle, IOCTL_STORAGE_EJECT_MEDIA);
        let error = (!ejected).then(|| win32_error("DeviceIoControl(IOCTL_STORAGE_EJECT_MEDIA)"));
        CloseHandle(handle);
        error
    };

    match ejected {
        None => {
            debug!("Ejected volume {}", letter);
            Ok(())
        }
        Some(e) => Err(e),
    }
}

unsafe extern "system" fn collect_window(hwnd: HWND, lparam: LPARAM) -> BOOL {
    // SAFETY: `lparam` is the `Vec` passed by `enumerate_windows_blocking`,
    // which outlives the synchronous EnumWindows call.
    let handles = unsafe { &mut *(lparam as *mut Vec<isize>) };
    handles.push(hwnd as isize);
    1
}

fn read_wide(f: impl FnOnce(*mut u16, i32) -> i32) -> String {
    let mut buf = [0u16; 512];
    let len = f(buf.as_mut_ptr(), buf.len() as i32).max(0) as usize;
    String::from_utf16_lossy(&buf[..len.min(buf.len())])
}

fn process_image_name(pid: u32) -> Option<String> {
    // SAFETY: the handle is checked for null and closed before returning.
    unsafe {
        let process = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if process.is_null() {
            return None;
        }
        let mut buf = [0u16; 1024];
        let mut size = buf.len() as u32;
        let ok = QueryFullProcessImageNameW(process, 0, buf.as_mut_ptr(), &mut size);
        CloseHandle(process);
        if ok == 0 {
            return None;
        }
        let full = String::from_utf16_lossy(&buf[..size as usize]);
        Path::new(&full)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }
}

fn enumerate_windows_blocking() -> OsResult<Vec<WindowInfo>> {
    let mut handles: Vec<isize> = Vec::new();
    // SAFETY: the callback only pushes into `handles`, which outlives the call.
    let ok = unsafe {
        EnumWindows(
            Some(collect_window),
            &mut handles as *mut Vec<isize> as LPARAM,
        )
    };
    if ok == 0 {
        return Err(win32_error("EnumWindows"));
    }

    let mut names: HashMap<u32, Option<String>> = HashMap::new();
    let mut windows = Vec::new();
    for raw in handles {
        let hwnd = raw as HWND;
        // SAFETY: all calls below accept stale handles and report failure.
        unsafe {
            if IsWindowVisible(hwnd) == 0 {
                continue;
            }
        }
        let class_name = read_wide(|buf, len| unsafe { GetClassNameW(hwnd, buf, len) });
        let title = read_wide(|buf, len| unsafe { GetWindowTextW(hwnd, buf, len) });
        let mut pid = 0u32;
        unsafe { GetWindowThreadProcessId(hwnd, &mut pid) };

        let process_name = names
            .entry(pid)
            .or_insert_with(|| process_image_name(pid))
            .clone();

        windows.push(WindowInfo {
            handle: WindowHandle(raw),
            class_name,
            title,
            pid,
            process_name,
        });
    }
    Ok(windows)
}
