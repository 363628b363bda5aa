//! Locating the IL2CPP runtime module
//!
//! Detection strategy:
//! - Windows: `GetModuleHandleA` on the already-loaded GameAssembly.dll
//! - Unix: `dlopen(RTLD_NOLOAD)` by name; on Linux, fall back to the path the
//!   module is mapped from in `/proc/self/maps`
//!
//! Symbols are resolved with `GetProcAddress` / `dlsym`.

use std::ffi::CString;

use sysinfo::{Pid, System};

use super::ResolveError;

/// The loaded runtime module, resolved once per session
///
/// On Unix the handle holds a `dlopen` reference that is released on drop.
/// `GetModuleHandleA` takes no reference, so Windows has nothing to release.
#[derive(Debug)]
pub struct ModuleHandle {
    name: String,
    raw: usize,
}

impl ModuleHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS handle (`HMODULE` on Windows, `dlopen` handle on Unix)
    pub fn raw(&self) -> usize {
        self.raw
    }

    /// Address of an exported symbol, if the module exports it
    pub fn symbol(&self, symbol: &str) -> Option<usize> {
        let symbol = CString::new(symbol).ok()?;
        lookup_symbol(self.raw(), &symbol)
    }
}

impl Drop for ModuleHandle {
    fn drop(&mut self) {
        close_module(self.raw());
    }
}

/// Find an already-loaded module by file name. Never loads anything.
pub fn locate_module(name: &str) -> Result<ModuleHandle, ResolveError> {
    let c_name = CString::new(name).map_err(|_| ResolveError::InvalidName(name.to_string()))?;

    let raw = open_module(&c_name).ok_or_else(|| ResolveError::ModuleNotFound(name.to_string()))?;
    tracing::debug!(module = name, handle = format!("0x{:x}", raw), "located runtime module");

    Ok(ModuleHandle {
        name: name.to_string(),
        raw,
    })
}

#[cfg(target_os = "windows")]
fn open_module(name: &std::ffi::CStr) -> Option<usize> {
    use winapi::um::libloaderapi::GetModuleHandleA;

    let handle = unsafe { GetModuleHandleA(name.as_ptr()) };
    (!handle.is_null()).then_some(handle as usize)
}

#[cfg(target_os = "windows")]
fn lookup_symbol(module: usize, symbol: &std::ffi::CStr) -> Option<usize> {
    use winapi::shared::minwindef::HMODULE;
    use winapi::um::libloaderapi::GetProcAddress;

    let addr = unsafe { GetProcAddress(module as HMODULE, symbol.as_ptr()) };
    (!addr.is_null()).then_some(addr as usize)
}

#[cfg(unix)]
fn open_module(name: &std::ffi::CStr) -> Option<usize> {
    let flags = libc::RTLD_NOW | libc::RTLD_NOLOAD;

    let handle = unsafe { libc::dlopen(name.as_ptr(), flags) };
    if !handle.is_null() {
        return Some(handle as usize);
    }

    // Modules without a matching soname are only found by their full path
    #[cfg(target_os = "linux")]
    {
        let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
        let path = mapped_path(&maps, name.to_str().ok()?)?;
        let path = CString::new(path).ok()?;
        let handle = unsafe { libc::dlopen(path.as_ptr(), flags) };
        if !handle.is_null() {
            return Some(handle as usize);
        }
    }

    None
}

#[cfg(unix)]
fn close_module(module: usize) {
    // The game holds its own reference, so this never unloads the module
    unsafe { libc::dlclose(module as *mut libc::c_void) };
}

#[cfg(unix)]
fn lookup_symbol(module: usize, symbol: &std::ffi::CStr) -> Option<usize> {
    let addr = unsafe { libc::dlsym(module as *mut libc::c_void, symbol.as_ptr()) };
    (!addr.is_null()).then_some(addr as usize)
}

#[cfg(not(unix))]
fn close_module(_module: usize) {}

#[cfg(not(any(unix, target_os = "windows")))]
fn open_module(_name: &std::ffi::CStr) -> Option<usize> {
    None
}

#[cfg(not(any(unix, target_os = "windows")))]
fn lookup_symbol(_module: usize, _symbol: &std::ffi::CStr) -> Option<usize> {
    None
}

/// Path of the first mapping whose file name is exactly `name`
///
/// Lines look like `start-end perms offset dev inode path`; the path may
/// contain spaces.
#[allow(dead_code)]
fn mapped_path(maps: &str, name: &str) -> Option<String> {
    maps.lines().find_map(|line| {
        let path = line.splitn(6, char::is_whitespace).nth(5)?.trim();
        let file_name = path.rsplit('/').next()?;
        (file_name == name).then(|| path.to_string())
    })
}

/// Find a process by name and return its PID
pub fn find_process_by_name(name: &str) -> Option<Pid> {
    let mut sys = System::new_all();
    sys.refresh_all();

    sys.processes()
        .iter()
        .find(|(_, process)| process.name().contains(name))
        .map(|(pid, _)| *pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c0000000-55d0c0021000 r--p 00000000 08:01 131 /usr/bin/game
7f1a2b000000-7f1a2c000000 r-xp 00000000 08:01 4242 /opt/My Game/GameAssembly.so
7f1a2c000000-7f1a2c100000 rw-p 00000000 00:00 0
7f1a2d000000-7f1a2d100000 r-xp 00000000 08:01 99 /opt/My Game/NotGameAssembly.so";

    #[test]
    fn test_mapped_path_matches_file_name() {
        let path = mapped_path(MAPS, "GameAssembly.so");
        assert_eq!(path.as_deref(), Some("/opt/My Game/GameAssembly.so"));
    }

    #[test]
    fn test_mapped_path_ignores_anonymous_and_suffix_matches() {
        assert_eq!(mapped_path(MAPS, "Assembly.so"), None);
        assert_eq!(mapped_path(MAPS, ""), None);
    }

    #[test]
    fn test_locate_missing_module() {
        let result = locate_module("__netcap_no_such_module__.so");
        assert!(matches!(result, Err(ResolveError::ModuleNotFound(_))));
    }

    #[test]
    fn test_locate_rejects_interior_nul() {
        let result = locate_module("Game\0Assembly");
        assert!(matches!(result, Err(ResolveError::InvalidName(_))));
    }

    #[test]
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    fn test_locate_loaded_module_and_release() {
        for _ in 0..3 {
            let libc = locate_module("libc.so.6").unwrap();
            assert_eq!(libc.name(), "libc.so.6");
            assert_ne!(libc.raw(), 0);
            assert!(libc.symbol("strlen").is_some());
            assert!(libc.symbol("__netcap_no_such_symbol").is_none());
        }
        // Still resolvable after every handle was dropped
        assert!(locate_module("libc.so.6").unwrap().symbol("malloc").is_some());
    }

    #[test]
    fn test_find_no_process() {
        assert!(find_process_by_name("_____netcap_test").is_none());
    }
}
