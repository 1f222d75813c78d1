//! Stub library for the `asprintf` fault-injection scenario
//! (`examples/original_source/samples/test1.c`): preloaded over a test
//! binary that formats a string with `asprintf`.
//!
//! `asprintf` is C-variadic, so this crate (unlike the other two demo
//! stub libraries) only builds on nightly Rust, via the unstable
//! `c_variadic` feature. See `DESIGN.md`.
#![feature(c_variadic)]

covex_stub::interpose_variadic! {
    fn asprintf(strp: *mut *mut libc::c_char, fmt: *const libc::c_char, ...) -> libc::c_int via "asprintf"
    fail {
        unsafe { *libc::__errno_location() = libc::ENOMEM; }
        -1
    }
}
