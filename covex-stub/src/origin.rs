//! Caller-origin filter: only fault-inject calls that originate from the
//! test binary itself, not from a library the test happens to link.
//!
//! The stack walk is abstracted behind [`CallerOrigin`] so the resolution
//! strategy can be swapped per platform without touching call sites.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;

use crate::context::StubContext;

/// Given a point in the current call stack, identify the binary (main
/// executable or shared object) that contains it.
pub trait CallerOrigin {
    /// Walk outward from the current frame and return the path of the
    /// first binary encountered that is not `self_module` — i.e. the
    /// first frame belonging to code outside this crate.
    fn find_external_caller(&self, self_module: &Path) -> Option<PathBuf>;
}

pub struct DladdrOrigin;

impl CallerOrigin for DladdrOrigin {
    fn find_external_caller(&self, self_module: &Path) -> Option<PathBuf> {
        let mut found = None;
        backtrace::trace(|frame| {
            if let Some(path) = dladdr_path(frame.ip()) {
                if path != self_module {
                    found = Some(path);
                    return false;
                }
            }
            true
        });
        found
    }
}

#[cfg(unix)]
fn dladdr_path(ip: *mut std::ffi::c_void) -> Option<PathBuf> {
    // SAFETY: `ip` is a valid instruction pointer captured from the live
    // call stack by `backtrace::trace`.
    unsafe {
        let mut info: libc::Dl_info = std::mem::zeroed();
        if libc::dladdr(ip as *const std::ffi::c_void, &mut info) == 0 || info.dli_fname.is_null()
        {
            return None;
        }
        let raw = std::ffi::CStr::from_ptr(info.dli_fname);
        Some(PathBuf::from(raw.to_string_lossy().into_owned()))
    }
}

#[cfg(not(unix))]
fn dladdr_path(_ip: *mut std::ffi::c_void) -> Option<PathBuf> {
    None
}

fn own_module_path() -> Option<&'static Path> {
    static SELF_MODULE: OnceCell<Option<PathBuf>> = OnceCell::new();
    SELF_MODULE
        .get_or_init(|| {
            let marker: fn(&Path) -> Option<PathBuf> = dladdr_path_probe;
            dladdr_path(marker as *mut std::ffi::c_void)
        })
        .as_deref()
}

// A named function (rather than a closure) so taking its address is a
// stable, unambiguous probe point inside this crate's own binary.
fn dladdr_path_probe(p: &Path) -> Option<PathBuf> {
    Some(p.to_path_buf())
}

/// `true` if this intercepted call must be forwarded without consulting the
/// BCA: fault injection is disabled process-wide, or the call did not
/// originate from the test executable itself.
pub fn should_skip_injection(ctx: &StubContext) -> bool {
    match std::env::var(crate::STUB_ENABLE_ENV_VAR) {
        Ok(v) if v == "1" => {}
        _ => return true,
    }

    let test_exe = match ctx.test_executable_path() {
        Some(path) => path,
        None => return true,
    };

    let self_module = match own_module_path() {
        Some(path) => path,
        None => return true,
    };

    match DladdrOrigin.find_external_caller(self_module) {
        Some(origin) => origin != test_exe,
        None => true,
    }
}
