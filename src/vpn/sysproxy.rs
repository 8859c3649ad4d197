//! System proxy toggle
//!
//! On Windows the daemon writes the current-user Internet Settings registry
//! keys and pokes WinINet so running apps pick the change up. On other
//! platforms this is a genuine no-op: the engine's mixed inbound is emitted
//! with `set_system_proxy: true` and handles the binding itself.
//!
//! Both operations are idempotent and best-effort; failures are logged and
//! never fail a connect.

#[cfg(windows)]
const INTERNET_SETTINGS_KEY: &str =
    "Software\\Microsoft\\Windows\\CurrentVersion\\Internet Settings";

/// Point the host HTTP proxy at `host:port`.
#[cfg(windows)]
pub fn enable(host: &str, port: u16) {
    use winreg::enums::HKEY_CURRENT_USER;
    use winreg::RegKey;

    let hkcu = RegKey::predef(HKEY_CURRENT_USER);
    let key = match hkcu.create_subkey(INTERNET_SETTINGS_KEY) {
        Ok((key, _)) => key,
        Err(e) => {
            log::warn!("system proxy: opening registry key failed: {e}");
            return;
        }
    };
    let address = format!("{host}:{port}");
    if let Err(e) = key.set_value("ProxyServer", &address) {
        log::warn!("system proxy: setting ProxyServer failed: {e}");
        return;
    }
    if let Err(e) = key.set_value("ProxyEnable", &1u32) {
        log::warn!("system proxy: setting ProxyEnable failed: {e}");
        return;
    }
    notify_wininet();
    log::info!("system proxy enabled: {address}");
}

/// Clear the host HTTP proxy.
#[cfg(windows)]
pub fn disable() {
    use winreg::enums::HKEY_CURRENT_USER;
    use winreg::RegKey;

    let hkcu = RegKey::predef(HKEY_CURRENT_USER);
    let key = match hkcu.create_subkey(INTERNET_SETTINGS_KEY) {
        Ok((key, _)) => key,
        Err(e) => {
            log::warn!("system proxy: opening registry key failed: {e}");
            return;
        }
    };
    if let Err(e) = key.set_value("ProxyEnable", &0u32) {
        log::warn!("system proxy: clearing ProxyEnable failed: {e}");
        return;
    }
    notify_wininet();
    log::info!("system proxy disabled");
}

/// Tell WinINet the proxy settings changed so browsers refresh them.
#[cfg(windows)]
fn notify_wininet() {
    use windows_sys::Win32::Networking::WinInet::{
        InternetSetOptionW, INTERNET_OPTION_REFRESH, INTERNET_OPTION_SETTINGS_CHANGED,
    };
    unsafe {
        InternetSetOptionW(
            std::ptr::null_mut(),
            INTERNET_OPTION_SETTINGS_CHANGED,
            std::ptr::null(),
            0,
        );
        InternetSetOptionW(std::ptr::null_mut(), INTERNET_OPTION_REFRESH, std::ptr::null(), 0);
    }
}

#[cfg(not(windows))]
pub fn enable(_host: &str, _port: u16) {}

#[cfg(not(windows))]
pub fn disable() {}
