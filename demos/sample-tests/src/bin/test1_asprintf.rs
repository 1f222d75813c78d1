//! Rust translation of `examples/original_source/samples/test1.c`: formats
//! a string with `asprintf`, guarded by fault injection around the one
//! call that can fail. Pair with `sample-stub-asprintf` (nightly only).

use std::ffi::{c_char, c_int, CStr};
use std::ptr;

const MYSTRING: &str = "This is my string";

extern "C" {
    fn asprintf(strp: *mut *mut c_char, fmt: *const c_char, ...) -> c_int;
}

fn main() {
    covex_stub::set_enabled(true);

    let mut ptr: *mut c_char = ptr::null_mut();
    let fmt = c"MYSTRING: %s";
    let arg = std::ffi::CString::new(MYSTRING).expect("no interior NUL");

    // SAFETY: `ptr` is valid for writes; `fmt` has one `%s` matching `arg`.
    let written = unsafe { asprintf(&mut ptr, fmt.as_ptr(), arg.as_ptr()) };

    covex_stub::set_enabled(false);

    if written < 0 {
        eprintln!("asprintf: {}", std::io::Error::last_os_error());
        // Nothing was allocated to free; the failure path itself is the
        // scenario under test, so it exits cleanly rather than propagating
        // the injected failure as a nonzero status.
        std::process::exit(0);
    }

    // SAFETY: `ptr` was just populated by a successful asprintf call.
    let rendered = unsafe { CStr::from_ptr(ptr) };
    println!("{}", rendered.to_string_lossy());

    // SAFETY: asprintf's output buffer is allocated with malloc.
    unsafe { libc::free(ptr as *mut libc::c_void) };

    std::process::exit(0);
}
